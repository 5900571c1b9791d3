use thiserror::Error;

/// Canonical rowmill error taxonomy used across crates.
///
/// Classification guidance:
/// - [`MillError::InvalidArgument`]: malformed request, missing stream header, unknown task
/// - [`MillError::Unavailable`]: coordinator or peer dial failure; caller may retry
/// - [`MillError::Internal`]: task-creation or executor-construction failure
/// - [`MillError::Cancelled`]: cooperative cancellation observed at a suspension point
/// - [`MillError::TaskFailed`]: user function returned an error or panicked
#[derive(Debug, Error)]
pub enum MillError {
    /// Malformed request, missing or malformed stream header, unknown task.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Coordinator or peer is unreachable; the caller may retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Task-creation, executor-construction, or other non-retriable runtime failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// Cooperative cancellation.
    #[error("cancelled")]
    Cancelled,

    /// The user function returned an error or panicked; the text is also
    /// appended under the job's error prefix in the coordinator.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// The coordinator refused to grant a liveness lease.
    #[error("lease denied: {0}")]
    LeaseDenied(String),

    /// Dialing a peer did not complete within the connect timeout.
    #[error("dial timeout: {0}")]
    DialTimeout(String),

    /// Coordinator key lookup miss.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard rowmill result alias.
pub type Result<T> = std::result::Result<T, MillError>;
