//! Document Memory.
//!
//! Arbitrary content chunks (task descriptions, conversation excerpts,
//! project notes, agent responses) tagged with a document-type label and
//! searchable by vector similarity.
//!
//! # Example
//!
//! ```rust
//! use mnemos_memory::documents::DocumentMemory;
//! use mnemos_types::{DocumentQuery, EmbeddingRecord};
//!
//! let docs = DocumentMemory::open_in_memory(3).unwrap();
//! let id = docs
//!     .insert(EmbeddingRecord::new("quarterly revenue report", vec![0.2, 0.9, 0.1]).with_category("task"))
//!     .unwrap();
//!
//! let query = DocumentQuery { category: Some("task".into()), ..DocumentQuery::default() };
//! let hits = docs.find_similar(&[0.2, 0.9, 0.1], &query).unwrap();
//! assert_eq!(hits[0].id, id);
//! ```

use mnemos_types::{DocumentMatch, DocumentQuery, EmbeddingRecord};
use tracing::debug;
use uuid::Uuid;

use crate::collection::Collection;
use crate::error::Result;
use crate::index::IndexParams;
use crate::retrieval::{RankingKey, RetrievalPlan};
use crate::store::StorageLocation;

/// Similarity-searchable store of document chunks.
pub struct DocumentMemory {
    collection: Collection<EmbeddingRecord>,
}

impl DocumentMemory {
    /// Open (or create) the document collection at `location`.
    pub fn open(location: &StorageLocation, dimension: usize, params: IndexParams) -> Result<Self> {
        Ok(Self {
            collection: Collection::open(location, dimension, params, None)?,
        })
    }

    /// Open a private in-memory collection (useful for testing).
    pub fn open_in_memory(dimension: usize) -> Result<Self> {
        Self::open(&StorageLocation::InMemory, dimension, IndexParams::default())
    }

    pub fn dimension(&self) -> usize {
        self.collection.dimension()
    }

    pub fn len(&self) -> Result<usize> {
        self.collection.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.collection.is_empty()
    }

    /// Store a document chunk and return its id.
    pub fn insert(&self, record: EmbeddingRecord) -> Result<Uuid> {
        let id = self.collection.insert(record)?;
        debug!(%id, "inserted document");
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> Result<EmbeddingRecord> {
        self.collection.get(id)
    }

    pub fn delete(&self, id: &Uuid) -> Result<()> {
        self.collection.delete(id)
    }

    /// Documents strictly more similar to `query` than the threshold, most
    /// similar first, restricted to `params.category` when set.
    pub fn find_similar(&self, query: &[f32], params: &DocumentQuery) -> Result<Vec<DocumentMatch>> {
        let plan = RetrievalPlan {
            filter: params.category.as_deref(),
            threshold: params.similarity_threshold,
            max_results: params.max_results,
            ranking: RankingKey::Similarity,
        };
        let hits = plan.execute(&self.collection, query)?;
        debug!(
            category = params.category.as_deref().unwrap_or("*"),
            hits = hits.len(),
            "document similarity search"
        );
        Ok(hits
            .into_iter()
            .map(|(record, similarity)| DocumentMatch::from_record(record, similarity))
            .collect())
    }
}
