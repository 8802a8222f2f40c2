//! Process-wide tracing setup for hosts embedding Mnemos.
//!
//! The engine itself never installs a subscriber: it only emits `tracing`
//! events and the per-operation spans of [`MemoryEngine`][crate::MemoryEngine].
//! A host process (service, worker, test harness) calls [`init_tracing`] once
//! before opening the engine to route them to stderr and, optionally, to an
//! OTLP collector.
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Filter directives, `info` when unset. |
//! | `MNEMOS_LOG_FORMAT` | `json` for one JSON object per line, otherwise compact text. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP/HTTP collector URL; spans are exported only when set. |
//!
//! # Example
//!
//! ```rust,no_run
//! use mnemos_runtime::{MemoryEngine, init_tracing};
//!
//! let _telemetry = init_tracing("mnemos");
//! let engine = MemoryEngine::from_default_config().unwrap();
//! // `_telemetry` flushes pending spans when the host shuts down.
//! # drop(engine);
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Console output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// Parse a `MNEMOS_LOG_FORMAT` value. Anything but `json` is compact.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }

    fn from_env() -> Self {
        Self::parse(std::env::var("MNEMOS_LOG_FORMAT").ok().as_deref())
    }
}

/// Install the global subscriber for a host process embedding the engine.
///
/// Leaves an already-installed subscriber in place. Keep the returned guard
/// alive until shutdown; dropping it flushes spans still queued for export.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let provider = otlp_provider(service_name);
    let spans = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("mnemos")));

    let registry = tracing_subscriber::registry().with(filter).with(spans);
    let installed = match LogFormat::from_env() {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Compact => registry.with(tracing_subscriber::fmt::layer().compact()).try_init(),
    };
    if let Err(e) = installed {
        eprintln!("[mnemos] keeping existing tracing subscriber: {e}");
    }

    TracerProviderGuard(provider)
}

/// Shuts the span exporter down on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    /// `true` when spans go to an OTLP collector.
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[mnemos] span exporter shutdown failed: {e}");
        }
    }
}

/// `None` unless `OTEL_EXPORTER_OTLP_ENDPOINT` is set and the exporter builds.
fn otlp_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("[mnemos] OTLP span exporter unavailable: {e}");
            return None;
        }
    };

    let resource = Resource::builder().with_service_name(service_name.to_string()).build();
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            // Engine calls are blocking and hosts may have no async runtime.
            .with_simple_exporter(exporter)
            .build(),
    )
}
