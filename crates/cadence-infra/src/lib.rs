//! Cadence Infrastructure Library
//!
//! Process-level plumbing shared by cadence binaries. Today that is telemetry
//! initialisation.

#[cfg(feature = "observability-basic")]
pub mod telemetry;

#[cfg(feature = "observability-basic")]
pub use telemetry::{init_telemetry, shutdown_telemetry, TelemetryError};
