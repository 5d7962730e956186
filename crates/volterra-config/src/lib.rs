//! # Volterra Config
//!
//! Configuration for the Volterra pipeline server.
//! Layers defaults, per-environment files, local overrides and
//! `VOLTERRA__` environment variables, then validates the result.

mod app_config;
mod loader;
mod validation;

pub use app_config::*;
pub use loader::*;
pub use validation::*;
