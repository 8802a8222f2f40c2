use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Open key/value payload attached to every record. Opaque to the engine.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Vector dimension used when a collection is provisioned without an explicit
/// one (matches common 1536-wide text embedding models).
pub const DEFAULT_DIMENSION: usize = 1536;

/// Importance assigned to an agent memory when the caller does not set one.
pub const DEFAULT_IMPORTANCE: f32 = 0.5;

pub const DEFAULT_DOCUMENT_THRESHOLD: f32 = 0.7;
pub const DEFAULT_DOCUMENT_MAX_RESULTS: usize = 10;
pub const DEFAULT_MEMORY_THRESHOLD: f32 = 0.6;
pub const DEFAULT_MEMORY_MAX_RESULTS: usize = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// A content chunk together with its pre-computed embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Unique identifier, generated when the record is built.
    pub id: Uuid,
    /// External reference supplied by the caller (e.g. the source document).
    /// Several records may share one subject.
    pub subject_id: Option<String>,
    /// Free-form tag such as `"task"` or `"conversation"`; used as an
    /// equality filter at query time.
    pub category: Option<String>,
    /// Text payload the vector was computed from.
    pub content: String,
    /// Dense embedding vector.
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    /// Wall-clock insertion time. Never changes afterwards.
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    /// Build a record with a fresh UUID and the current UTC timestamp.
    pub fn new(content: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id: None,
            category: None,
            content: content.into(),
            vector,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A memory owned by a single agent.
///
/// The embedded [`EmbeddingRecord`] carries the content and vector; its
/// `category` holds the memory type. `importance_score` is fixed at insert
/// time while `access_count` and `last_accessed` are only ever advanced by
/// retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMemoryRecord {
    #[serde(flatten)]
    pub record: EmbeddingRecord,
    pub agent_id: Uuid,
    /// Caller-assigned long-term value in `[0.0, 1.0]`.
    pub importance_score: f32,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
}

impl AgentMemoryRecord {
    /// Build a memory for `agent_id` with the default importance and a zero
    /// access count. `last_accessed` starts at the creation time.
    pub fn new(agent_id: Uuid, content: impl Into<String>, vector: Vec<f32>) -> Self {
        let record = EmbeddingRecord::new(content, vector);
        let last_accessed = record.created_at;
        Self {
            record,
            agent_id,
            importance_score: DEFAULT_IMPORTANCE,
            access_count: 0,
            last_accessed,
        }
    }

    pub fn with_memory_type(mut self, memory_type: impl Into<String>) -> Self {
        self.record.category = Some(memory_type.into());
        self
    }

    pub fn with_importance(mut self, importance_score: f32) -> Self {
        self.importance_score = importance_score;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.record.metadata = metadata;
        self
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn memory_type(&self) -> Option<&str> {
        self.record.category.as_deref()
    }
}

/// A registered agent that can own memories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    /// Unique human-readable name (e.g. `"research_analyst"`).
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Stamped on every accepted registration update.
    pub updated_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Insert requests
// ─────────────────────────────────────────────────────────────────────────────

/// Caller-facing request to register an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Caller-facing request to store a document chunk. The id and timestamp are
/// assigned when it is turned into a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    pub content: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewDocument {
    pub fn new(content: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            content: content.into(),
            vector,
            subject_id: None,
            category: None,
            metadata: Metadata::new(),
        }
    }

    pub fn into_record(self) -> EmbeddingRecord {
        EmbeddingRecord {
            subject_id: self.subject_id,
            category: self.category,
            metadata: self.metadata,
            ..EmbeddingRecord::new(self.content, self.vector)
        }
    }
}

/// Caller-facing request to store an agent memory. `importance` falls back
/// to [`DEFAULT_IMPORTANCE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMemory {
    pub content: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub memory_type: Option<String>,
    #[serde(default)]
    pub importance: Option<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewMemory {
    pub fn new(content: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            content: content.into(),
            vector,
            memory_type: None,
            importance: None,
            metadata: Metadata::new(),
        }
    }

    pub fn into_record(self, agent_id: Uuid) -> AgentMemoryRecord {
        let mut memory = AgentMemoryRecord::new(agent_id, self.content, self.vector)
            .with_importance(self.importance.unwrap_or(DEFAULT_IMPORTANCE))
            .with_metadata(self.metadata);
        memory.record.category = self.memory_type;
        memory
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters of a document similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentQuery {
    /// Only documents with exactly this category are considered.
    pub category: Option<String>,
    /// Matches must be strictly more similar than this.
    pub similarity_threshold: f32,
    pub max_results: usize,
}

impl Default for DocumentQuery {
    fn default() -> Self {
        Self {
            category: None,
            similarity_threshold: DEFAULT_DOCUMENT_THRESHOLD,
            max_results: DEFAULT_DOCUMENT_MAX_RESULTS,
        }
    }
}

/// Parameters of an agent memory retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Only memories with exactly this memory type are considered.
    pub memory_type: Option<String>,
    /// Matches must be strictly more similar than this.
    pub similarity_threshold: f32,
    pub max_results: usize,
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self {
            memory_type: None,
            similarity_threshold: DEFAULT_MEMORY_THRESHOLD,
            max_results: DEFAULT_MEMORY_MAX_RESULTS,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// One hit of a document similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMatch {
    pub id: Uuid,
    pub subject_id: Option<String>,
    pub category: Option<String>,
    pub content: String,
    /// Cosine similarity to the query vector.
    pub similarity: f32,
    pub metadata: Metadata,
}

impl DocumentMatch {
    pub fn from_record(record: EmbeddingRecord, similarity: f32) -> Self {
        Self {
            id: record.id,
            subject_id: record.subject_id,
            category: record.category,
            content: record.content,
            similarity,
            metadata: record.metadata,
        }
    }
}

/// One hit of an agent memory retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMemoryMatch {
    pub id: Uuid,
    pub memory_type: Option<String>,
    pub content: String,
    /// Cosine similarity to the query vector.
    pub similarity: f32,
    pub importance_score: f32,
    /// Access count after the retrieval that produced this match.
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub metadata: Metadata,
}

impl AgentMemoryMatch {
    pub fn from_record(memory: AgentMemoryRecord, similarity: f32) -> Self {
        Self {
            id: memory.record.id,
            memory_type: memory.record.category,
            content: memory.record.content,
            similarity,
            importance_score: memory.importance_score,
            access_count: memory.access_count,
            last_accessed: memory.last_accessed,
            metadata: memory.record.metadata,
        }
    }

    /// Ranking key: importance-weighted similarity.
    pub fn score(&self) -> f32 {
        self.importance_score * self.similarity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_agent_memory_has_defaults() {
        let agent = Uuid::new_v4();
        let m = AgentMemoryRecord::new(agent, "note", vec![1.0, 0.0]);
        assert_eq!(m.agent_id, agent);
        assert!((m.importance_score - DEFAULT_IMPORTANCE).abs() < f32::EPSILON);
        assert_eq!(m.access_count, 0);
        assert_eq!(m.last_accessed, m.record.created_at);
        assert!(m.memory_type().is_none());
    }

    #[test]
    fn agent_memory_serializes_flat() {
        let m = AgentMemoryRecord::new(Uuid::new_v4(), "note", vec![0.5])
            .with_memory_type("conversation")
            .with_importance(0.8);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["content"], "note");
        assert_eq!(json["category"], "conversation");
        let back: AgentMemoryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn query_defaults() {
        let d = DocumentQuery::default();
        assert!((d.similarity_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(d.max_results, 10);
        assert!(d.category.is_none());

        let m = MemoryQuery::default();
        assert!((m.similarity_threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(m.max_results, 5);
    }

    #[test]
    fn memory_match_score_is_importance_times_similarity() {
        let m = AgentMemoryRecord::new(Uuid::new_v4(), "x", vec![1.0]).with_importance(0.9);
        let hit = AgentMemoryMatch::from_record(m, 0.7);
        assert!((hit.score() - 0.63).abs() < 1e-6);
    }

    #[test]
    fn new_memory_defaults_importance() {
        let agent = Uuid::new_v4();
        let m = NewMemory::new("note", vec![1.0]).into_record(agent);
        assert!((m.importance_score - DEFAULT_IMPORTANCE).abs() < f32::EPSILON);
        assert!(m.memory_type().is_none());

        let typed = NewMemory {
            memory_type: Some("preference".into()),
            importance: Some(0.9),
            ..NewMemory::new("likes tables", vec![1.0])
        }
        .into_record(agent);
        assert_eq!(typed.memory_type(), Some("preference"));
        assert!((typed.importance_score - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn new_document_deserializes_with_only_required_fields() {
        let req: NewDocument =
            serde_json::from_str(r#"{"content":"chunk","vector":[0.5,0.5]}"#).unwrap();
        assert!(req.category.is_none());
        let record = req.into_record();
        assert_eq!(record.content, "chunk");
        assert!(record.metadata.is_empty());
    }

    #[test]
    fn document_builder_sets_optional_fields() {
        let mut meta = Metadata::new();
        meta.insert("page".into(), serde_json::json!(3));
        let r = EmbeddingRecord::new("chunk", vec![0.1])
            .with_subject("doc-1")
            .with_category("task")
            .with_metadata(meta.clone());
        assert_eq!(r.subject_id.as_deref(), Some("doc-1"));
        assert_eq!(r.category.as_deref(), Some("task"));
        assert_eq!(r.metadata, meta);
    }
}
