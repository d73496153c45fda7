//! Error types for pool operations.

use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Error type returned by [`ObjectPoolHandler`](crate::ObjectPoolHandler) callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No resource became available before the configured wait elapsed.
    #[error("Pool exhausted: no object available within {max_wait_seconds}s")]
    Exhausted {
        /// The configured wait, in seconds.
        max_wait_seconds: u64,
    },

    /// A freshly created object failed its liveness test.
    #[error("Freshly created object failed validation: {0}")]
    ValidationFailed(String),

    /// The pool was shut down.
    #[error("Pool is shut down")]
    Shutdown,

    /// The configuration was rejected by the pool or its handler.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// The handler failed to construct an object.
    #[error("Failed to create pooled object: {0}")]
    Create(String),
}

impl PoolError {
    /// Whether waiting longer or retrying later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
