//! Circuit Breaker state machine for fault isolation
//!
//! The breaker isolates a single target (a pooled connection or a balanced
//! instance) once it has failed repeatedly. It has three states:
//! - Closed: Normal operation, the target is selectable
//! - Open: The target failed `failure_threshold` times in a row and is excluded
//! - HalfOpen: The cooldown elapsed; the next outcome decides Closed or Open
//!
//! The breaker holds no lock of its own. Owners embed it in state they already
//! guard (the pool's slot table, an instance's metrics) so that selection and
//! the state transition happen under the same lock.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// What a breaker is isolating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// A single pooled connection
    Connection,
    /// A load-balanced backend instance
    Instance,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Connection => write!(f, "connection"),
            TargetKind::Instance => write!(f, "instance"),
        }
    }
}

/// Identity of the isolated target, used for structured transition events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTarget {
    pub kind: TargetKind,
    pub label: String,
}

impl BreakerTarget {
    pub fn connection(label: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Connection,
            label: label.into(),
        }
    }

    pub fn instance(label: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Instance,
            label: label.into(),
        }
    }
}

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, the target must not receive regular traffic
    Open,
    /// Cooldown elapsed, the target is on trial
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit
    pub success_threshold: u32,
    /// Time since the last failure before an open circuit may be probed
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Per-target circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    target: BreakerTarget,
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker for `target`
    pub fn new(target: BreakerTarget, config: CircuitBreakerConfig) -> Self {
        Self {
            target,
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
        }
    }

    pub fn target(&self) -> &BreakerTarget {
        &self.target
    }

    /// Current state, moving Open to HalfOpen when the cooldown has elapsed
    pub fn state(&mut self) -> CircuitState {
        if self.state == CircuitState::Open {
            let cooled = self
                .last_failure_at
                .map(|at| at.elapsed() >= self.config.cooldown)
                .unwrap_or(true);
            if cooled {
                self.transition(CircuitState::HalfOpen);
                self.consecutive_successes = 0;
            }
        }
        self.state
    }

    /// State without applying the cooldown transition
    pub fn peek_state(&self) -> CircuitState {
        self.state
    }

    /// Whether regular traffic may be routed to the target right now
    pub fn allows_requests(&mut self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// Record a successful call
    ///
    /// An open breaker only leaves Open through its cooldown, so a success
    /// observed while Open (for example a health probe) leaves the state alone.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        match self.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    self.consecutive_successes = 0;
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure_at = Some(Instant::now());
        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure while on trial reopens the circuit
                self.consecutive_successes = 0;
                self.transition(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.last_failure_at = None;
        self.transition(CircuitState::Closed);
    }

    fn transition(&mut self, next: CircuitState) {
        if self.state == next {
            return;
        }
        let previous = self.state;
        self.state = next;
        match next {
            CircuitState::Open => warn!(
                target_kind = %self.target.kind,
                target = %self.target.label,
                from = %previous,
                consecutive_failures = self.consecutive_failures,
                "circuit opened"
            ),
            _ => info!(
                target_kind = %self.target.kind,
                target = %self.target.label,
                from = %previous,
                to = %next,
                "circuit state changed"
            ),
        }
    }
}
