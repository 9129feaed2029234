//! Tracing subscriber setup
//!
//! `RUST_LOG` wins over the configured default filter. `LOG_FORMAT=json`
//! switches the fmt layer to one JSON object per line.

use cadence_core::TelemetryConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub type TelemetryError = Box<dyn std::error::Error + Send + Sync>;

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(default_filter).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let json = config.json_logs;

    tracing_subscriber::registry()
        .with(env_filter(&config.default_filter))
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_current_span(true)))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .try_init()?;

    tracing::info!(
        environment = %config.environment,
        format = if json { "json" } else { "text" },
        "Telemetry initialized"
    );
    Ok(())
}

pub async fn shutdown_telemetry() {
    tracing::debug!("Telemetry shutdown");
}
