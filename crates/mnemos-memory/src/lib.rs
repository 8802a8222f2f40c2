//! `mnemos-memory` – The Recall Engine.
//!
//! Stores embedding vectors alongside their content and answers
//! nearest-neighbour queries over them, on top of a local SQLite substrate.
//!
//! # Modules
//!
//! - [`documents`] – [`DocumentMemory`][documents::DocumentMemory]: content
//!   chunks tagged with a document type, searchable by cosine similarity with
//!   a threshold and an optional type filter.
//! - [`agents`] – [`AgentMemory`][agents::AgentMemory]: per-agent memories
//!   ranked by `importance × similarity`. Every retrieval advances the access
//!   statistics of all of the agent's memories.
//! - [`registry`] – [`AgentRegistry`][registry::AgentRegistry]: the agents
//!   that may own memories.
//! - [`index`] – [`SimilarityIndex`][index::SimilarityIndex]: an IVF-flat
//!   approximate nearest-neighbour index that falls back to an exact scan
//!   for small collections.
//! - [`store`] – [`RecordStore`][store::RecordStore]: the SQLite tables
//!   records are persisted in.
//! - [`collection`] – a store and its index kept in lockstep.
//! - [`retrieval`] – the filter / threshold / rank / truncate pipeline both
//!   memories share.

pub mod agents;
pub mod collection;
pub mod documents;
pub mod error;
pub mod index;
pub mod registry;
pub mod retrieval;
pub mod store;

pub use agents::AgentMemory;
pub use documents::DocumentMemory;
pub use error::{MemoryError, Result};
pub use index::{IndexParams, SimilarityIndex};
pub use registry::AgentRegistry;
pub use retrieval::{RankingKey, RetrievalPlan};
pub use store::StorageLocation;
