//! Agent Memory.
//!
//! Per-agent memories ranked by importance-weighted similarity, with usage
//! bookkeeping.
//!
//! ## Layout
//!
//! Every registered agent owns its own [`Collection`]: a store connection
//! scoped to the agent's rows plus a private similarity index. Operations on
//! different agents therefore never wait on each other. The map from agent id
//! to collection is only locked long enough to clone an `Arc`, except by
//! [`AgentMemory::delete_agent`], which holds it for the whole cascade.
//!
//! Agents registered through another handle on the same file are picked up
//! on first use. Inserts and retrievals confirm the agent is still registered
//! and drop a collection whose agent was deleted elsewhere.
//!
//! ## Retrieval
//!
//! [`AgentMemory::retrieve`] first bumps `access_count` and `last_accessed`
//! on **every** memory the agent owns, not only the ones that end up in the
//! result, and then ranks candidates by `importance_score * similarity`.
//! Usage statistics therefore count retrievals per agent, not per hit.
//!
//! # Example
//!
//! ```rust
//! use mnemos_memory::agents::AgentMemory;
//! use mnemos_types::{AgentMemoryRecord, MemoryQuery};
//!
//! let memory = AgentMemory::open_in_memory(2).unwrap();
//! let agent = memory.register_agent("analyst", None).unwrap();
//!
//! memory
//!     .insert(AgentMemoryRecord::new(agent.id, "user prefers charts", vec![1.0, 0.0]).with_importance(0.9))
//!     .unwrap();
//!
//! let hits = memory.retrieve(&agent.id, &[1.0, 0.0], &MemoryQuery::default()).unwrap();
//! assert_eq!(hits[0].access_count, 1);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use mnemos_types::{Agent, AgentMemoryMatch, AgentMemoryRecord, MemoryQuery};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collection::Collection;
use crate::error::{MemoryError, Result};
use crate::index::IndexParams;
use crate::registry::AgentRegistry;
use crate::retrieval::{RankingKey, RetrievalPlan};
use crate::store::StorageLocation;

type AgentCollection = Collection<AgentMemoryRecord>;

/// Agent-scoped memory with importance ranking and access tracking.
pub struct AgentMemory {
    location: StorageLocation,
    dimension: usize,
    params: IndexParams,
    registry: AgentRegistry,
    collections: RwLock<HashMap<Uuid, Arc<AgentCollection>>>,
}

impl AgentMemory {
    /// Open the registry and every registered agent's memories at `location`.
    pub fn open(location: &StorageLocation, dimension: usize, params: IndexParams) -> Result<Self> {
        let registry = AgentRegistry::open(location)?;
        let mut collections = HashMap::new();
        for agent in registry.list()? {
            let collection =
                Collection::open(location, dimension, params.clone(), Some(agent.id.to_string()))?;
            collections.insert(agent.id, Arc::new(collection));
        }
        if !collections.is_empty() {
            info!(agents = collections.len(), "loaded agent memories");
        }
        Ok(Self {
            location: location.clone(),
            dimension,
            params,
            registry,
            collections: RwLock::new(collections),
        })
    }

    /// Open a private in-memory instance (useful for testing).
    pub fn open_in_memory(dimension: usize) -> Result<Self> {
        Self::open(&StorageLocation::InMemory, dimension, IndexParams::default())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    fn poisoned() -> MemoryError {
        MemoryError::IndexUnavailable("agent collection map lock poisoned".to_string())
    }

    fn open_collection(&self, agent_id: &Uuid) -> Result<AgentCollection> {
        Collection::open(
            &self.location,
            self.dimension,
            self.params.clone(),
            Some(agent_id.to_string()),
        )
    }

    /// The agent's collection, opened on first use if the agent is in the
    /// registry but not yet in the map.
    fn collection(&self, agent_id: &Uuid) -> Result<Arc<AgentCollection>> {
        if let Some(collection) = self.collections.read().map_err(|_| Self::poisoned())?.get(agent_id) {
            return Ok(Arc::clone(collection));
        }
        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;
        if let Some(collection) = collections.get(agent_id) {
            return Ok(Arc::clone(collection));
        }
        self.registry.get(agent_id)?;
        let collection = Arc::new(self.open_collection(agent_id)?);
        collections.insert(*agent_id, Arc::clone(&collection));
        debug!(agent = %agent_id, "opened agent collection");
        Ok(collection)
    }

    /// Like [`collection`][Self::collection], but first confirms the agent is
    /// still registered and forgets its collection if it is not.
    fn live_collection(&self, agent_id: &Uuid) -> Result<Arc<AgentCollection>> {
        if let Err(e) = self.registry.get(agent_id) {
            if matches!(e, MemoryError::NotFound(_)) {
                self.collections.write().map_err(|_| Self::poisoned())?.remove(agent_id);
            }
            return Err(e);
        }
        self.collection(agent_id)
    }

    /// Register an agent (or refresh an existing one with the same name) and
    /// make sure it has a memory collection.
    pub fn register_agent(&self, name: &str, description: Option<&str>) -> Result<Agent> {
        let agent = self.registry.register(name, description)?;
        self.collection(&agent.id)?;
        info!(agent = %agent.id, name = %agent.name, "registered agent");
        Ok(agent)
    }

    pub fn agent(&self, agent_id: &Uuid) -> Result<Agent> {
        self.registry.get(agent_id)
    }

    pub fn agents(&self) -> Result<Vec<Agent>> {
        self.registry.list()
    }

    /// Store a memory for `memory.agent_id`.
    ///
    /// Usage statistics start fresh: whatever the record carries,
    /// `access_count` is stored as `0` and `last_accessed` as the creation
    /// time. Fails with [`MemoryError::NotFound`] for an unknown (or
    /// concurrently deleted) agent and [`MemoryError::InvalidImportance`] for
    /// a score outside `[0, 1]`.
    pub fn insert(&self, mut memory: AgentMemoryRecord) -> Result<Uuid> {
        if !(0.0..=1.0).contains(&memory.importance_score) {
            return Err(MemoryError::InvalidImportance(memory.importance_score));
        }
        memory.access_count = 0;
        memory.last_accessed = memory.record.created_at;

        let agent_id = memory.agent_id;
        let collection = self.live_collection(&agent_id)?;
        let id = collection.insert(memory)?;
        debug!(agent = %agent_id, %id, "inserted agent memory");
        Ok(id)
    }

    pub fn get(&self, agent_id: &Uuid, memory_id: &Uuid) -> Result<AgentMemoryRecord> {
        self.collection(agent_id)?.get(memory_id)
    }

    pub fn delete(&self, agent_id: &Uuid, memory_id: &Uuid) -> Result<()> {
        self.collection(agent_id)?.delete(memory_id)
    }

    /// Number of memories owned by `agent_id`.
    pub fn len(&self, agent_id: &Uuid) -> Result<usize> {
        self.collection(agent_id)?.len()
    }

    /// Every memory owned by `agent_id`, in insertion order.
    pub fn memories(&self, agent_id: &Uuid) -> Result<Vec<AgentMemoryRecord>> {
        self.collection(agent_id)?.store().all()
    }

    /// Retrieve the agent's memories most relevant to `query`.
    ///
    /// Before ranking, every memory the agent owns gets `access_count + 1`
    /// and `last_accessed = now`, whatever the filter, threshold or result.
    /// Matches are ordered by descending `importance_score * similarity` and
    /// report the post-increment access count.
    pub fn retrieve(
        &self,
        agent_id: &Uuid,
        query: &[f32],
        params: &MemoryQuery,
    ) -> Result<Vec<AgentMemoryMatch>> {
        let collection = self.live_collection(agent_id)?;
        let plan = RetrievalPlan {
            filter: params.memory_type.as_deref(),
            threshold: params.similarity_threshold,
            max_results: params.max_results,
            ranking: RankingKey::ImportanceWeighted,
        };
        plan.validate()?;
        if query.len() != self.dimension {
            return Err(MemoryError::dimension(self.dimension, query.len()));
        }

        let touched = collection.store().touch_all(Utc::now())?;
        let hits = plan.execute(&collection, query)?;
        debug!(
            agent = %agent_id,
            memory_type = params.memory_type.as_deref().unwrap_or("*"),
            touched,
            hits = hits.len(),
            "agent memory retrieval"
        );
        Ok(hits
            .into_iter()
            .map(|(memory, similarity)| AgentMemoryMatch::from_record(memory, similarity))
            .collect())
    }

    /// Delete an agent and every memory it owns. Returns the number of
    /// memories removed.
    ///
    /// The collection is closed before the registry entry goes, so an insert
    /// racing the delete either lands before the purge or fails with
    /// [`MemoryError::NotFound`].
    pub fn delete_agent(&self, agent_id: &Uuid) -> Result<usize> {
        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;
        let collection = match collections.get(agent_id) {
            Some(collection) => Arc::clone(collection),
            None => {
                self.registry.get(agent_id)?;
                Arc::new(self.open_collection(agent_id)?)
            }
        };
        let removed = collection.close()?;
        collections.remove(agent_id);
        if let Err(e) = self.registry.remove(agent_id) {
            warn!(agent = %agent_id, error = %e, "agent memories purged but registry entry remained");
            return Err(e);
        }
        info!(agent = %agent_id, removed, "deleted agent");
        Ok(removed)
    }
}
