//! Trajectory error types.

use crate::parser::ParseError;
use thiserror::Error;

/// Result type for trajectory operations.
pub type TrajectoryResult<T> = Result<T, TrajectoryError>;

/// Errors raised while decoding, encoding or storing frames.
#[derive(Debug, Error)]
pub enum TrajectoryError {
    /// Frame text could not be decoded.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary record could not be encoded or decoded.
    #[error("Frame codec error: {0}")]
    Codec(String),

    /// Trajectory id is not usable as a storage key.
    #[error("Invalid trajectory key: {0}")]
    InvalidKey(String),
}
