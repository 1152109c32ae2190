//! Observability infrastructure: tracing and metrics.
//!
//! The CLI calls [`init`] once at startup. Library code only emits `tracing`
//! events and records through [`metrics`]; with no exporter installed the
//! metric calls are no-ops.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Result, ScanError};

pub mod metrics;

/// Logging and metrics options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Default filter directive when `RUST_LOG` is unset (e.g. "info").
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Serve Prometheus metrics on this address.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false, metrics_addr: None }
    }
}

/// Initialize the global observability infrastructure.
///
/// Must be called once, before any lifecycle work starts.
pub fn init(options: &LogOptions) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.level))
        .map_err(|e| ScanError::InvalidConfig {
            reason: format!("invalid log level '{}': {}", options.level, e),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if options.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
            .try_init()
    };
    installed.map_err(|e| ScanError::Internal(format!("tracing already initialized: {}", e)))?;

    if let Some(addr) = options.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| ScanError::Internal(format!("failed to start metrics exporter: {}", e)))?;
        tracing::info!(addr = %addr, "Prometheus metrics exporter listening");
    }

    metrics::register_core_metrics();

    Ok(())
}
