//! Configuration validation.
//!
//! Every rule runs and all violations are reported together, so a bad
//! deployment fails at startup with the full list.

use crate::AppConfig;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Value must be at least 1.
    NonPositive { name: String },
    /// Pool size exceeds maximum allowed.
    PoolSizeTooLarge { value: usize, maximum: usize },
    /// Backoff multiplier below 1.0 would shrink delays.
    InvalidMultiplier { value: f64 },
    /// Initial delay larger than the cap.
    InvalidDelayRange { initial_ms: u64, max_ms: u64 },
    /// Claim lifetime shorter than the job timeout.
    VisibilityShorterThanTimeout { visibility_secs: u64, timeout_secs: u64 },
    /// Metrics listener address does not parse.
    InvalidMetricsAddr { value: String },
    /// Two SSH targets share an id.
    DuplicateSshTarget { id: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {url_type} URL: {message}")
            }
            Self::NonPositive { name } => write!(f, "'{name}' must be at least 1"),
            Self::PoolSizeTooLarge { value, maximum } => {
                write!(f, "Pool size {value} exceeds maximum allowed ({maximum})")
            }
            Self::InvalidMultiplier { value } => {
                write!(f, "Retry multiplier {value} must be at least 1.0")
            }
            Self::InvalidDelayRange { initial_ms, max_ms } => write!(
                f,
                "Initial retry delay ({initial_ms}ms) cannot exceed max delay ({max_ms}ms)"
            ),
            Self::VisibilityShorterThanTimeout {
                visibility_secs,
                timeout_secs,
            } => write!(
                f,
                "Visibility timeout ({visibility_secs}s) must not be shorter than job timeout ({timeout_secs}s)"
            ),
            Self::InvalidMetricsAddr { value } => {
                write!(f, "Invalid metrics address '{value}'")
            }
            Self::DuplicateSshTarget { id } => write!(f, "Duplicate SSH target id '{id}'"),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum Redis pool size.
    const MAX_POOL_SIZE: usize = 512;

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        Self::validate_redis(config, &mut errors);
        Self::validate_worker(config, &mut errors);
        Self::validate_retry(config, &mut errors);
        Self::validate_events(config, &mut errors);
        Self::validate_telemetry(config, &mut errors);
        Self::validate_ssh(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_redis(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let redis = &config.jobs.redis;
        if !redis.url.starts_with("redis://") && !redis.url.starts_with("rediss://") {
            errors.push(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: "URL must start with redis:// or rediss://".to_string(),
            });
        }
        if redis.pool_size == 0 {
            errors.push(non_positive("jobs.redis.pool_size"));
        }
        if redis.pool_size > Self::MAX_POOL_SIZE {
            errors.push(ConfigValidationError::PoolSizeTooLarge {
                value: redis.pool_size,
                maximum: Self::MAX_POOL_SIZE,
            });
        }
    }

    fn validate_worker(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let worker = &config.jobs.worker;
        if worker.concurrency == 0 {
            errors.push(non_positive("jobs.worker.concurrency"));
        }
        if worker.job_timeout_secs == 0 {
            errors.push(non_positive("jobs.worker.job_timeout_secs"));
        }
        if worker.poll_interval_ms == 0 {
            errors.push(non_positive("jobs.worker.poll_interval_ms"));
        }
        if worker.visibility_timeout_secs < worker.job_timeout_secs {
            errors.push(ConfigValidationError::VisibilityShorterThanTimeout {
                visibility_secs: worker.visibility_timeout_secs,
                timeout_secs: worker.job_timeout_secs,
            });
        }
        if config.jobs.ingest.chunk_size == 0 {
            errors.push(non_positive("jobs.ingest.chunk_size"));
        }
    }

    fn validate_retry(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let retry = &config.jobs.queue.default_retry;
        if retry.multiplier < 1.0 {
            errors.push(ConfigValidationError::InvalidMultiplier {
                value: retry.multiplier,
            });
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            errors.push(ConfigValidationError::InvalidDelayRange {
                initial_ms: retry.initial_delay_ms,
                max_ms: retry.max_delay_ms,
            });
        }

        let producer = &config.jobs.producer;
        if producer.max_attempts == 0 {
            errors.push(non_positive("jobs.producer.max_attempts"));
        }
        if producer.initial_delay_ms > producer.max_delay_ms {
            errors.push(ConfigValidationError::InvalidDelayRange {
                initial_ms: producer.initial_delay_ms,
                max_ms: producer.max_delay_ms,
            });
        }
    }

    fn validate_events(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let events = &config.jobs.events;
        if events.pending_buffer_capacity == 0 {
            errors.push(non_positive("jobs.events.pending_buffer_capacity"));
        }
        if events.local_capacity == 0 {
            errors.push(non_positive("jobs.events.local_capacity"));
        }
    }

    fn validate_telemetry(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        if let Some(addr) = &config.telemetry.metrics_addr {
            if addr.parse::<SocketAddr>().is_err() {
                errors.push(ConfigValidationError::InvalidMetricsAddr { value: addr.clone() });
            }
        }
    }

    fn validate_ssh(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let mut seen = HashSet::new();
        for target in &config.ssh.targets {
            if !seen.insert(target.connection.id.as_str()) {
                errors.push(ConfigValidationError::DuplicateSshTarget {
                    id: target.connection.id.clone(),
                });
            }
        }
    }
}

fn non_positive(name: &str) -> ConfigValidationError {
    ConfigValidationError::NonPositive {
        name: name.to_string(),
    }
}
