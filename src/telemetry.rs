//! Logging and tracing setup
//!
//! Logs go to stdout, as plain text or JSON. When `OTEL_EXPORTER_OTLP_ENDPOINT`
//! is set, spans are also exported over OTLP.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{trace, Resource};
use tracing::{info, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{fmt, prelude::*, registry::LookupSpan, EnvFilter, Layer};

use crate::error::{Error, Result};

const SERVICE_NAME: &str = "addon-manager";
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Default filter when `RUST_LOG` is not set
fn default_directives(debug: bool) -> &'static str {
    if debug {
        "debug,kube=info,hyper=warn,tower=warn,h2=warn"
    } else {
        "info,kube=warn,hyper=warn,tower=warn"
    }
}

/// Install the global subscriber
pub fn init_tracing(debug: bool, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug)));

    let fmt_layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let otel_layer = match std::env::var(OTLP_ENDPOINT_ENV) {
        Ok(endpoint) if !endpoint.is_empty() => init_telemetry(&endpoint),
        _ => None,
    };
    let otel_enabled = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::ConfigError(format!("failed to initialize tracing: {}", e)))?;

    if otel_enabled {
        info!("OpenTelemetry tracing initialized");
    } else {
        info!("OpenTelemetry tracing disabled ({} not set)", OTLP_ENDPOINT_ENV);
    }
    Ok(())
}

/// Build the OTLP export layer; `None` if the pipeline cannot be created
pub fn init_telemetry<S>(endpoint: &str) -> Option<OpenTelemetryLayer<S, trace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let resource = Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(trace::config().with_resource(resource))
        .install_batch(opentelemetry_sdk::runtime::Tokio);

    match tracer {
        Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
        Err(e) => {
            // The subscriber is not installed yet
            eprintln!("failed to initialize OTLP exporter for {}: {}", endpoint, e);
            None
        }
    }
}

/// Flush any remaining spans
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
