//! # Volterra Server Library
//!
//! Wires configuration, backends, worker pools and the update relay into
//! one running pipeline process.

pub mod app;
pub mod startup;
