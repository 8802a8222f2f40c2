//! Query-time ranking shared by document and agent memory.
//!
//! Both call sites run the same pipeline:
//!
//! ```text
//! equality filter → nearest candidates with similarity > threshold → rank → truncate
//! ```
//!
//! and differ only in the [`RankingKey`]. Sorting is stable, so candidates
//! with equal scores keep the index order (similarity, then insertion).

use mnemos_types::{AgentMemoryRecord, EmbeddingRecord};

use crate::collection::Collection;
use crate::error::{MemoryError, Result};
use crate::store::StoredRecord;

/// Long-term weight of a record, used by [`RankingKey::ImportanceWeighted`].
pub trait Weighted {
    fn importance(&self) -> f32;
}

impl Weighted for EmbeddingRecord {
    fn importance(&self) -> f32 {
        1.0
    }
}

impl Weighted for AgentMemoryRecord {
    fn importance(&self) -> f32 {
        self.importance_score
    }
}

/// How surviving candidates are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingKey {
    /// Descending similarity.
    Similarity,
    /// Descending `importance * similarity`.
    ImportanceWeighted,
}

impl RankingKey {
    pub fn score<R: Weighted>(self, record: &R, similarity: f32) -> f32 {
        match self {
            RankingKey::Similarity => similarity,
            RankingKey::ImportanceWeighted => record.importance() * similarity,
        }
    }

    /// How many nearest neighbours to pull from the index. Similarity ranking
    /// matches index order, so `max_results` suffices; re-ranking needs every
    /// candidate above the threshold because a less similar record may still
    /// score higher.
    fn candidate_limit(self, max_results: usize) -> usize {
        match self {
            RankingKey::Similarity => max_results,
            RankingKey::ImportanceWeighted => usize::MAX,
        }
    }
}

/// One parameterised retrieval.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalPlan<'a> {
    /// Equality filter on the record category / memory type.
    pub filter: Option<&'a str>,
    /// Candidates must have `similarity > threshold`.
    pub threshold: f32,
    pub max_results: usize,
    pub ranking: RankingKey,
}

impl RetrievalPlan<'_> {
    /// Reject thresholds outside `[0, 1]` (including NaN) and a zero result cap.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(MemoryError::InvalidThreshold(format!(
                "similarity threshold {} is outside [0, 1]",
                self.threshold
            )));
        }
        if self.max_results == 0 {
            return Err(MemoryError::InvalidThreshold(
                "max_results must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Run the plan against `collection`. Read-only.
    pub fn execute<R>(&self, collection: &Collection<R>, query: &[f32]) -> Result<Vec<(R, f32)>>
    where
        R: StoredRecord + Weighted,
    {
        self.validate()?;
        let limit = self.ranking.candidate_limit(self.max_results);
        let mut hits = collection.search(query, limit, self.filter, Some(self.threshold))?;

        if self.ranking != RankingKey::Similarity {
            let ranking = self.ranking;
            hits.sort_by(|a, b| ranking.score(&b.0, b.1).total_cmp(&ranking.score(&a.0, a.1)));
        }
        hits.truncate(self.max_results);
        Ok(hits)
    }
}
