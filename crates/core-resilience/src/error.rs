//! Error type shared by the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Failures raised by the pool, breaker and cache primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// No eligible connection became available within the wait window
    #[error("no eligible connection available after waiting {waited:?}")]
    Unavailable { waited: Duration },

    /// The target is isolated by its circuit breaker
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Creating a new connection failed
    #[error("failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// The pool has been closed and accepts no new acquisitions
    #[error("connection pool is closed")]
    Closed,

    /// Invalid configuration passed to a primitive
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ResilienceError {
    /// Whether retrying later (or elsewhere) may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::Unavailable { .. }
                | ResilienceError::CircuitOpen(_)
                | ResilienceError::ConnectFailed { .. }
        )
    }

    /// Whether retrying can never succeed
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}
