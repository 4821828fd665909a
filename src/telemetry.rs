//! OpenTelemetry trace export
//!
//! Spans recorded through `tracing` are shipped to an OTLP collector over
//! gRPC when an endpoint is configured. Export is batched on the tokio
//! runtime and flushed by [`shutdown_telemetry`].

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

use crate::error::{Error, Result};

/// Service name reported on every exported span
pub const SERVICE_NAME: &str = "storage-client-operator";

/// Build the tracing layer exporting spans to `endpoint`.
///
/// `_subscriber` only pins the layer's subscriber type to the registry it
/// will be stacked on.
pub fn init_telemetry<S>(
    _subscriber: &S,
    endpoint: &str,
) -> Result<OpenTelemetryLayer<S, trace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(trace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::ConfigError(format!("failed to install OTLP tracer: {e}")))?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flush buffered spans and stop the exporter
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
