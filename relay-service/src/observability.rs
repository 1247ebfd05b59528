//! Tracing initialization and trace-context propagation
//!
//! Distributed-trace context crosses the broker inside the message metadata
//! map. The carrier types below adapt a plain `HashMap<String, String>` to
//! the OpenTelemetry text-map propagator so publishers inject the current
//! span context and subscribers extract it before invoking handlers.

use std::collections::HashMap;

use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::{global, Context as OtelContext};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize tracing and install the global text-map propagator
pub fn init_tracing(config: &Config) -> Result<()> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let log_level = config.service.log_level.clone();

    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    tracing::info!("Tracing initialized for service: {}", config.service.name);

    Ok(())
}

/// Injects propagator keys into a message-metadata map
pub struct MetadataInjector<'a>(pub &'a mut HashMap<String, String>);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Reads propagator keys from a message-metadata map
pub struct MetadataExtractor<'a>(pub &'a HashMap<String, String>);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Inject the current span's trace context into `metadata`.
///
/// A no-op when no span context is active, so metadata stays free of trace
/// keys outside instrumented paths.
pub fn inject_trace_context(metadata: &mut HashMap<String, String>) {
    let cx = tracing::Span::current().context();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut MetadataInjector(metadata));
    });
}

/// Extract a trace context from `metadata`.
///
/// Returns an empty context when the propagator keys are absent.
pub fn extract_trace_context(metadata: &HashMap<String, String>) -> OtelContext {
    global::get_text_map_propagator(|propagator| propagator.extract(&MetadataExtractor(metadata)))
}
