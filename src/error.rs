/*!
 * Error types for Conduit
 */

use conduit_core_resilience::ResilienceError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConduitError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

/// Failures surfaced by the execution layer
///
/// `Clone` so that every waiter attached to a coalesced call receives the
/// same outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConduitError {
    /// No connection or instance became available in time
    #[error("no capacity available: {0}")]
    Unavailable(String),

    /// An attempt or the caller's deadline ran out
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote node answered with an error object
    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        transient: bool,
    },

    /// The connection or instance is isolated by its circuit breaker
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Connection-level failure (refused, reset, bad HTTP status)
    #[error("transport error: {0}")]
    Transport(String),

    /// The response could not be decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The layer has been shut down and accepts no new calls
    #[error("conduit is shut down")]
    ShutDown,

    /// Final failure of an executed request, with execution context
    #[error("request to {endpoint} failed after {attempts} attempt(s) in {elapsed_ms}ms: {cause}")]
    Failed {
        endpoint: String,
        attempts: u32,
        elapsed_ms: u64,
        cause: Box<ConduitError>,
    },
}

impl ConduitError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.root_cause() {
            ConduitError::Config(_) => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    /// Whether another attempt (possibly on another connection or instance)
    /// may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ConduitError::Unavailable(_)
            | ConduitError::Timeout(_)
            | ConduitError::CircuitOpen(_)
            | ConduitError::Transport(_) => true,
            ConduitError::Remote { transient, .. } => *transient,
            ConduitError::Codec(_) | ConduitError::Config(_) | ConduitError::ShutDown => false,
            ConduitError::Failed { cause, .. } => cause.is_retryable(),
        }
    }

    /// Whether this outcome counts against the target's circuit breaker
    ///
    /// A permanent remote error means the node answered correctly to a bad
    /// request, so it does not count.
    pub fn trips_breaker(&self) -> bool {
        match self {
            ConduitError::Timeout(_) | ConduitError::Transport(_) => true,
            ConduitError::Remote { transient, .. } => *transient,
            ConduitError::Failed { cause, .. } => cause.trips_breaker(),
            _ => false,
        }
    }

    /// Whether at least one call went out on a connection before failing
    pub fn reached_connection(&self) -> bool {
        matches!(self, ConduitError::Failed { attempts, .. } if *attempts > 0)
    }

    /// Pick the failure to report out of the previous and the latest one
    ///
    /// A failure observed on a connection outranks a later capacity or
    /// isolation error that never reached one; otherwise the latest wins.
    pub fn most_informative(previous: Option<ConduitError>, latest: ConduitError) -> ConduitError {
        match previous {
            Some(previous) if previous.reached_connection() && !latest.reached_connection() => {
                previous
            }
            _ => latest,
        }
    }

    /// The innermost error, unwrapping execution context
    pub fn root_cause(&self) -> &ConduitError {
        match self {
            ConduitError::Failed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Get error category for logging and instrumentation
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConduitError::Unavailable(_) => ErrorCategory::Capacity,
            ConduitError::Timeout(_) => ErrorCategory::Timeout,
            ConduitError::Remote { .. } => ErrorCategory::Remote,
            ConduitError::CircuitOpen(_) => ErrorCategory::Isolation,
            ConduitError::Transport(_) => ErrorCategory::Network,
            ConduitError::Codec(_) => ErrorCategory::Codec,
            ConduitError::Config(_) => ErrorCategory::Configuration,
            ConduitError::ShutDown => ErrorCategory::Lifecycle,
            ConduitError::Failed { cause, .. } => cause.category(),
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Pool or balancer exhausted
    Capacity,
    /// Attempt or deadline timeout
    Timeout,
    /// Error object returned by the node
    Remote,
    /// Circuit breaker isolation
    Isolation,
    /// Connection-level failures
    Network,
    /// Response decoding
    Codec,
    /// Configuration errors
    Configuration,
    /// Shutdown in progress
    Lifecycle,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Capacity => write!(f, "capacity"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Remote => write!(f, "remote"),
            ErrorCategory::Isolation => write!(f, "isolation"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Codec => write!(f, "codec"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Lifecycle => write!(f, "lifecycle"),
        }
    }
}

impl From<ResilienceError> for ConduitError {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::Unavailable { .. } => ConduitError::Unavailable(err.to_string()),
            ResilienceError::CircuitOpen(target) => ConduitError::CircuitOpen(target),
            ResilienceError::ConnectFailed { .. } => ConduitError::Transport(err.to_string()),
            ResilienceError::Closed => ConduitError::ShutDown,
            ResilienceError::InvalidConfig(msg) => ConduitError::Config(msg),
        }
    }
}

impl From<serde_json::Error> for ConduitError {
    fn from(err: serde_json::Error) -> Self {
        ConduitError::Codec(err.to_string())
    }
}
