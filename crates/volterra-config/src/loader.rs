//! Configuration loader with layered sources.

use crate::{AppConfig, ConfigValidator};
use config::{Config, ConfigError, Environment, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use volterra_core::{VolterraError, VolterraResult};

/// Environment variable selecting the `config/{environment}.toml` layer.
pub const ENVIRONMENT_VAR: &str = "VOLTERRA_ENVIRONMENT";

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Untracked local overrides
    /// 4. Environment variables such as `VOLTERRA__JOBS__REDIS__URL`
    pub fn new(config_dir: impl Into<PathBuf>) -> VolterraResult<Self> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> VolterraResult<Self> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    ///
    /// An invalid file leaves the current configuration in place.
    pub async fn reload(&self) -> VolterraResult<()> {
        let new_config = Self::load_config(&self.config_dir)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    fn load_config(config_dir: &Path) -> VolterraResult<AppConfig> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment = std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string());
        info!(environment = %environment, dir = %config_dir.display(), "Loading configuration");

        let mut builder = Config::builder();
        for layer in ["default", environment.as_str(), "local"] {
            let path = config_dir.join(format!("{layer}.toml"));
            if path.exists() {
                debug!("Loading config layer from: {}", path.display());
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("VOLTERRA")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error)?;
        let app_config: AppConfig = config.try_deserialize().map_err(config_error)?;

        if let Err(errors) = ConfigValidator::validate(&app_config) {
            let message = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(VolterraError::Configuration(message));
        }

        if app_config.plugins.registry.is_empty() {
            warn!("No analysis plugins registered; analysis requests will be rejected");
        }

        Ok(app_config)
    }

    /// Gets a specific configuration value by key path.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }
}

fn config_error(err: ConfigError) -> VolterraError {
    VolterraError::Configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[tokio::test]
    async fn test_missing_directory_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::new(dir.path().join("absent")).unwrap();
        let config = loader.get().await;

        assert_eq!(config.jobs.ingest.chunk_size, 20);
        assert_eq!(config.jobs.events.channel, "job_updates");
    }

    #[tokio::test]
    async fn test_local_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "default.toml",
            "[jobs.ingest]\nchunk_size = 50\n\n[jobs.redis]\nkey_prefix = \"base\"\n",
        );
        write(dir.path(), "local.toml", "[jobs.ingest]\nchunk_size = 5\n");

        let loader = ConfigLoader::new(dir.path()).unwrap();
        assert_eq!(loader.get_value::<usize>("jobs.ingest.chunk_size").await, Some(5));
        assert_eq!(
            loader.get_value::<String>("jobs.redis.key_prefix").await.as_deref(),
            Some("base")
        );
        assert_eq!(loader.get_value::<usize>("jobs.missing").await, None);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "local.toml", "[jobs.redis]\nurl = \"http://nope\"\n");

        let err = ConfigLoader::new(dir.path()).err().unwrap();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
        assert!(err.to_string().contains("redis"));
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "local.toml", "[jobs.worker]\nconcurrency = 2\n");
        let loader = ConfigLoader::new(dir.path()).unwrap();
        assert_eq!(loader.get().await.jobs.worker.concurrency, 2);

        write(dir.path(), "local.toml", "[jobs.worker]\nconcurrency = 8\n");
        loader.reload().await.unwrap();
        assert_eq!(loader.get().await.jobs.worker.concurrency, 8);

        write(dir.path(), "local.toml", "[jobs.worker]\nconcurrency = 0\n");
        assert!(loader.reload().await.is_err());
        assert_eq!(loader.get().await.jobs.worker.concurrency, 8);
    }

    #[test]
    fn test_shipped_default_file_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/default.toml");
        let text = fs::read_to_string(path).unwrap();
        let config: AppConfig = toml::from_str(&text).unwrap();
        assert!(ConfigValidator::validate(&config).is_ok());
    }
}
