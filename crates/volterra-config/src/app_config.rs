//! Application configuration structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use volterra_core::TelemetryConfig;
use volterra_jobs::{JobsConfig, PluginsConfig, SshConnection};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and environment.
    #[serde(default)]
    pub app: AppMetadata,

    /// Logging and metrics exporter.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// On-disk locations for trajectories and staging.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Analysis plugins, rasterizer and `scp`.
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Queues, workers, producer and event fan-out.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Saved SSH targets available to imports.
    #[serde(default)]
    pub ssh: SshConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "volterra-pipeline".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root holding one folder per trajectory.
    #[serde(default = "default_trajectories_root")]
    pub trajectories_root: PathBuf,

    /// Decoded frame records, `<root>/<trajectoryId>/<timestep>.frame`.
    #[serde(default = "default_frames_root")]
    pub frames_root: PathBuf,

    /// Where SSH imports download remote files before ingestion.
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            trajectories_root: default_trajectories_root(),
            frames_root: default_frames_root(),
            staging_root: default_staging_root(),
        }
    }
}

fn default_trajectories_root() -> PathBuf {
    PathBuf::from("./data/trajectories")
}

fn default_frames_root() -> PathBuf {
    PathBuf::from("./data/frames")
}

fn default_staging_root() -> PathBuf {
    PathBuf::from("./data/ssh-staging")
}

/// SSH import targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub targets: Vec<SshTarget>,
}

/// One saved connection and the user allowed to use it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTarget {
    pub owner: String,
    pub connection: SshConnection,
}

impl AppConfig {
    /// True when running with `app.environment = "production"`.
    pub fn is_production(&self) -> bool {
        self.app.environment.eq_ignore_ascii_case("production")
    }
}
