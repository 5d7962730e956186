//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// External command exited unsuccessfully or could not be started.
    #[error("Job execution failed (exit code {code:?}): {stderr}")]
    Execution { code: Option<i32>, stderr: String },

    /// Broker stayed unavailable through every enqueue attempt.
    #[error("Delivery failed after {attempts} attempts: {reason}")]
    Delivery { attempts: u32, reason: String },

    /// Publishing a job update failed.
    #[error("Broadcast failed: {0}")]
    Broadcast(String),

    /// Request rejected before any work was scheduled.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Job timed out.
    #[error("Job timed out after {0} seconds")]
    Timeout(u64),

    /// The (analysis, timestep) pair is already being processed elsewhere.
    #[error("Frame {timestep} of analysis {analysis_id} is already in flight")]
    FrameInFlight { analysis_id: String, timestep: u64 },

    /// Queue backend temporarily unavailable.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Frame decoding or storage error.
    #[error("Trajectory error: {0}")]
    Trajectory(#[from] volterra_trajectory::TrajectoryError),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Job, analysis or trajectory not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if this error is retryable.
    ///
    /// Infrastructure failures and timeouts are retried by the queue;
    /// execution and validation failures are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Timeout(_)
                | JobError::FrameInFlight { .. }
                | JobError::Unavailable(_)
                | JobError::Redis(_)
                | JobError::Pool(_)
        )
    }

    /// Creates an execution error.
    pub fn execution(code: Option<i32>, stderr: impl Into<String>) -> Self {
        JobError::Execution {
            code,
            stderr: stderr.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        JobError::Validation(message.into())
    }
}

impl From<volterra_core::VolterraError> for JobError {
    fn from(err: volterra_core::VolterraError) -> Self {
        JobError::Internal(err.to_string())
    }
}
