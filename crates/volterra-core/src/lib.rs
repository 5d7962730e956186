//! # Volterra Core
//!
//! Shared error type and tracing bootstrap for the Volterra trajectory
//! pipeline crates.

pub mod error;
pub mod telemetry;

pub use error::*;
pub use telemetry::{init_tracing, TelemetryConfig};
