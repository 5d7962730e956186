//! Bootstrap-level error type.
//!
//! Pipeline crates carry their own error enums (`ParseError`, `JobError`);
//! `VolterraError` covers what sits around them: configuration, process
//! startup and plain I/O.

use thiserror::Error;

/// Error raised while configuring or starting the pipeline.
#[derive(Error, Debug)]
pub enum VolterraError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Input rejected before any work was scheduled.
    #[error("Validation error: {0}")]
    Validation(String),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VolterraError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation(message.into())
    }
}

/// A specialized `Result` type for bootstrap operations.
pub type VolterraResult<T> = Result<T, VolterraError>;
