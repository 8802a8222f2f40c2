//! `mnemos-runtime` – The Engine Boundary.
//!
//! Wires the recall engine to the outside world: configuration, tracing and
//! the [`MemoryEngine`] handle collaborators use.
//!
//! # Modules
//!
//! - [`engine`] – [`MemoryEngine`][engine::MemoryEngine]: a cheaply cloneable
//!   handle owning document and agent memory. Every operation is wrapped in a
//!   `tracing` span and falls back to the configured retrieval defaults.
//! - [`config`] – [`Config`][config::Config]: the `~/.mnemos/config.toml`
//!   vault (dimension, storage path, index tuning, retrieval defaults) with
//!   `MNEMOS_*` environment overrides.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the hook a
//!   host process calls once, before opening the engine, to install the
//!   global `tracing` subscriber. Spans go to an OTLP collector when
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` is set. The engine never installs a
//!   subscriber on its own.
//!
//! # Example
//!
//! ```rust
//! use mnemos_runtime::MemoryEngine;
//! use mnemos_types::{NewAgent, NewMemory};
//!
//! let engine = MemoryEngine::in_memory(2).unwrap();
//! let agent = engine
//!     .register_agent(NewAgent { name: "analyst".into(), description: None })
//!     .unwrap();
//! engine.insert_memory(agent.id, NewMemory::new("likes charts", vec![1.0, 0.0])).unwrap();
//!
//! let hits = engine.retrieve_memories(agent.id, &[1.0, 0.0], None).unwrap();
//! assert_eq!(hits.len(), 1);
//! ```

pub mod config;
pub mod engine;
pub mod telemetry;

pub use config::{Config, ConfigError};
pub use engine::{EngineError, MemoryEngine};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};

// Re-export the memory error so callers can match on `EngineError::Memory`
// without a direct dependency on mnemos-memory.
pub use mnemos_memory::MemoryError;
