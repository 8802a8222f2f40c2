//! The engine boundary: one handle owning document and agent memory.
//!
//! [`MemoryEngine`] is what collaborators hold. It applies the configured
//! retrieval defaults, validates the configuration once at open time and
//! wraps every operation in a `tracing` span. Query vectors are never
//! recorded in spans.
//!
//! All operations are blocking. From async code, call them through
//! `tokio::task::spawn_blocking` with a cloned handle.
//!
//! Spans and events are only recorded once the host has installed a
//! subscriber, normally with [`init_tracing`][crate::telemetry::init_tracing].

use std::sync::Arc;

use mnemos_memory::{AgentMemory, DocumentMemory, MemoryError, StorageLocation};
use mnemos_types::{
    Agent, AgentMemoryMatch, AgentMemoryRecord, DocumentMatch, DocumentQuery, EmbeddingRecord,
    MemoryQuery, NewAgent, NewDocument, NewMemory,
};
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::{Config, ConfigError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

struct Inner {
    config: Config,
    documents: DocumentMemory,
    agents: AgentMemory,
}

/// Cheaply cloneable handle to an open engine.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

impl MemoryEngine {
    /// Validate `config` and open both memories at its storage location.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let location = config.storage_location();
        if let StorageLocation::File(path) = &location
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let params = config.index_params();
        let documents = DocumentMemory::open(&location, config.dimension, params.clone())?;
        let agents = AgentMemory::open(&location, config.dimension, params)?;
        info!(
            dimension = config.dimension,
            storage = ?config.storage_path,
            documents = documents.len()?,
            agents = agents.agents()?.len(),
            "memory engine opened"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                documents,
                agents,
            }),
        })
    }

    /// Open with `~/.mnemos/config.toml` (or the defaults when absent).
    pub fn from_default_config() -> Result<Self> {
        Self::open(crate::config::load_or_default()?)
    }

    /// An in-memory engine with default tuning.
    pub fn in_memory(dimension: usize) -> Result<Self> {
        Self::open(Config {
            dimension,
            ..Config::default()
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn documents(&self) -> &DocumentMemory {
        &self.inner.documents
    }

    pub fn agent_memory(&self) -> &AgentMemory {
        &self.inner.agents
    }

    // ── Agents ─────────────────────────────────────────────────────────────

    #[instrument(skip(self), fields(name = %request.name))]
    pub fn register_agent(&self, request: NewAgent) -> Result<Agent> {
        Ok(self
            .inner
            .agents
            .register_agent(&request.name, request.description.as_deref())?)
    }

    /// Delete an agent and all its memories. Returns the number of memories
    /// removed.
    #[instrument(skip(self))]
    pub fn delete_agent(&self, agent_id: Uuid) -> Result<usize> {
        Ok(self.inner.agents.delete_agent(&agent_id)?)
    }

    // ── Documents ──────────────────────────────────────────────────────────

    #[instrument(skip_all, fields(category = request.category.as_deref()))]
    pub fn insert_document(&self, request: NewDocument) -> Result<Uuid> {
        Ok(self.inner.documents.insert(request.into_record())?)
    }

    pub fn get_document(&self, id: Uuid) -> Result<EmbeddingRecord> {
        Ok(self.inner.documents.get(&id)?)
    }

    #[instrument(skip(self))]
    pub fn delete_document(&self, id: Uuid) -> Result<()> {
        Ok(self.inner.documents.delete(&id)?)
    }

    /// Similarity search with the configured threshold and result cap.
    pub fn search_documents(&self, vector: &[f32], category: Option<&str>) -> Result<Vec<DocumentMatch>> {
        self.search_documents_with(vector, &self.inner.config.document_query(category))
    }

    #[instrument(skip(self, vector), fields(
        category = query.category.as_deref(),
        threshold = query.similarity_threshold,
        max_results = query.max_results,
    ))]
    pub fn search_documents_with(&self, vector: &[f32], query: &DocumentQuery) -> Result<Vec<DocumentMatch>> {
        Ok(self.inner.documents.find_similar(vector, query)?)
    }

    // ── Agent memories ─────────────────────────────────────────────────────

    #[instrument(skip(self, request), fields(memory_type = request.memory_type.as_deref()))]
    pub fn insert_memory(&self, agent_id: Uuid, request: NewMemory) -> Result<Uuid> {
        Ok(self.inner.agents.insert(request.into_record(agent_id))?)
    }

    pub fn get_memory(&self, agent_id: Uuid, memory_id: Uuid) -> Result<AgentMemoryRecord> {
        Ok(self.inner.agents.get(&agent_id, &memory_id)?)
    }

    /// Importance-weighted retrieval with the configured threshold and result
    /// cap. Advances the access statistics of every memory of the agent.
    pub fn retrieve_memories(
        &self,
        agent_id: Uuid,
        vector: &[f32],
        memory_type: Option<&str>,
    ) -> Result<Vec<AgentMemoryMatch>> {
        self.retrieve_memories_with(agent_id, vector, &self.inner.config.memory_query(memory_type))
    }

    #[instrument(skip(self, vector), fields(
        memory_type = query.memory_type.as_deref(),
        threshold = query.similarity_threshold,
        max_results = query.max_results,
    ))]
    pub fn retrieve_memories_with(
        &self,
        agent_id: Uuid,
        vector: &[f32],
        query: &MemoryQuery,
    ) -> Result<Vec<AgentMemoryMatch>> {
        Ok(self.inner.agents.retrieve(&agent_id, vector, query)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MemoryEngine {
        MemoryEngine::in_memory(2).unwrap()
    }

    fn agent(engine: &MemoryEngine, name: &str) -> Uuid {
        engine
            .register_agent(NewAgent {
                name: name.to_string(),
                description: None,
            })
            .unwrap()
            .id
    }

    #[test]
    fn open_rejects_invalid_config() {
        let err = MemoryEngine::open(Config {
            dimension: 0,
            ..Config::default()
        })
        .err()
        .expect("invalid config");
        assert!(matches!(err, EngineError::Config(ConfigError::Invalid(_))));
    }

    #[test]
    fn document_search_uses_configured_defaults() {
        let mut config = Config {
            dimension: 2,
            ..Config::default()
        };
        config.documents.similarity_threshold = 0.5;
        config.documents.max_results = 1;
        let engine = MemoryEngine::open(config).unwrap();

        for (content, v) in [("a", [1.0, 0.0]), ("b", [0.8, 0.6]), ("c", [0.0, 1.0])] {
            engine
                .insert_document(NewDocument {
                    category: Some("note".into()),
                    ..NewDocument::new(content, v.to_vec())
                })
                .unwrap();
        }
        let hits = engine.search_documents(&[1.0, 0.0], Some("note")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "a");
        assert!(engine.search_documents(&[1.0, 0.0], Some("other")).unwrap().is_empty());
    }

    #[test]
    fn memory_roundtrip_through_engine() {
        let engine = engine();
        let id = agent(&engine, "analyst");
        let memory = engine
            .insert_memory(
                id,
                NewMemory {
                    memory_type: Some("preference".into()),
                    importance: Some(0.8),
                    ..NewMemory::new("likes tables", vec![1.0, 0.0])
                },
            )
            .unwrap();

        let hits = engine.retrieve_memories(id, &[1.0, 0.0], Some("preference")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, memory);
        assert_eq!(hits[0].access_count, 1);
        assert_eq!(engine.get_memory(id, memory).unwrap().access_count, 1);
    }

    #[test]
    fn errors_surface_as_memory_errors() {
        let engine = engine();
        let err = engine
            .insert_memory(Uuid::new_v4(), NewMemory::new("orphan", vec![1.0, 0.0]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Memory(MemoryError::NotFound(_))));

        let id = agent(&engine, "a");
        let err = engine
            .insert_memory(
                id,
                NewMemory {
                    importance: Some(3.0),
                    ..NewMemory::new("too important", vec![1.0, 0.0])
                },
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Memory(MemoryError::InvalidImportance(_))));
    }

    #[test]
    fn delete_agent_reports_removed_count() {
        let engine = engine();
        let id = agent(&engine, "short-lived");
        for i in 0..3 {
            engine
                .insert_memory(id, NewMemory::new(format!("m{i}"), vec![1.0, 0.0]))
                .unwrap();
        }
        assert_eq!(engine.delete_agent(id).unwrap(), 3);
        assert!(matches!(
            engine.retrieve_memories(id, &[1.0, 0.0], None).unwrap_err(),
            EngineError::Memory(MemoryError::NotFound(_))
        ));
    }

    #[test]
    fn file_backed_engine_reopens() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let config = Config {
            dimension: 2,
            storage_path: Some(dir.path().join("nested").join("mnemos.db")),
            ..Config::default()
        };
        let (agent_id, doc) = {
            let engine = MemoryEngine::open(config.clone()).unwrap();
            let agent_id = agent(&engine, "persistent");
            engine
                .insert_memory(agent_id, NewMemory::new("kept", vec![0.0, 1.0]))
                .unwrap();
            let doc = engine
                .insert_document(NewDocument::new("kept doc", vec![0.0, 1.0]))
                .unwrap();
            (agent_id, doc)
        };

        let engine = MemoryEngine::open(config).unwrap();
        assert_eq!(engine.get_document(doc).unwrap().content, "kept doc");
        let hits = engine.retrieve_memories(agent_id, &[0.0, 1.0], None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "kept");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_retrievals_from_async_tasks() {
        const TASKS: u64 = 16;
        let engine = engine();
        let agent_id = agent(&engine, "shared");
        let memory = engine
            .insert_memory(agent_id, NewMemory::new("hot", vec![1.0, 0.0]))
            .unwrap();

        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let engine = engine.clone();
                tokio::task::spawn_blocking(move || {
                    engine.retrieve_memories(agent_id, &[1.0, 0.0], None).map(|hits| hits.len())
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.expect("task panicked").unwrap(), 1);
        }

        assert_eq!(engine.get_memory(agent_id, memory).unwrap().access_count, TASKS);
    }
}
