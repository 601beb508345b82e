//! Tracing subscriber setup for the binaries
//!
//! The library itself never installs a subscriber. `init_telemetry` builds a
//! registry with an `EnvFilter` (default `info`), a text or JSON `fmt` layer
//! and, when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, an OpenTelemetry layer
//! exporting spans over OTLP/gRPC.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, Resource};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const SERVICE_NAME: &str = "eksforge";
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracer: {0}")]
    Tracer(#[from] opentelemetry::trace::TraceError),

    #[error("failed to initialize tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
    /// OTLP collector endpoint; spans stay local when `None`
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: false,
            otlp_endpoint: std::env::var(OTLP_ENDPOINT_ENV)
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}

/// Flushes pending spans when dropped
#[must_use = "dropping the guard shuts the exporter down"]
pub struct TelemetryGuard {
    otel: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.otel {
            opentelemetry::global::shutdown_tracer_provider();
        }
    }
}

fn otlp_tracer(endpoint: &str) -> Result<trace::Tracer, TelemetryError> {
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
        .install_batch(runtime::Tokio)?;
    Ok(tracer)
}

/// Install the global subscriber
///
/// Must be called from inside a Tokio runtime when OTLP export is enabled.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(endpoint)?)),
        None => None,
    };
    let otel = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .with(otel_layer)
        .try_init()?;

    if otel {
        tracing::info!("OpenTelemetry tracing initialized");
    } else {
        tracing::debug!("OpenTelemetry tracing disabled ({OTLP_ENDPOINT_ENV} not set)");
    }
    Ok(TelemetryGuard { otel })
}
