//! Tracing subscriber initialisation.

use crate::{VolterraError, VolterraResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub default_filter: String,

    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,

    /// Address for the Prometheus scrape endpoint (e.g. "0.0.0.0:9100").
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_service_name() -> String {
    "volterra-pipeline".to_string()
}

fn default_filter() -> String {
    "info,volterra=debug".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            default_filter: default_filter(),
            json: false,
            metrics_addr: None,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Fails when a global subscriber has already been set.
pub fn init_tracing(config: &TelemetryConfig) -> VolterraResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| VolterraError::Internal(format!("Failed to install tracing subscriber: {e}")))?;

    tracing::info!(
        service_name = %config.service_name,
        json = config.json,
        "Tracing initialized"
    );

    Ok(())
}
