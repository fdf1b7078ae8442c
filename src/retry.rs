/*!
 * Retry logic with exponential backoff and adaptive per-attempt timeouts
 *
 * One controller run works on exactly one acquired connection. Every attempt
 * races the call against a timeout derived from that connection's recent
 * latency and error streak; every outcome feeds the connection's statistics
 * and circuit breaker. Moving to another connection or instance is the
 * caller's job.
 */

use conduit_core_resilience::{CircuitState, PooledConnection};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ConduitError, Result};

/// Multipliers applied to the base timeout
#[derive(Debug, Clone)]
pub struct AdaptiveTimeoutConfig {
    /// Average latency above which `slow_factor` applies
    pub slow_threshold_ms: f64,
    pub slow_factor: f64,
    /// Average latency above which `elevated_factor` applies
    pub elevated_threshold_ms: f64,
    pub elevated_factor: f64,
    /// Consecutive errors above which `error_factor` applies
    pub error_streak: u32,
    pub error_factor: f64,
    /// The timeout never exceeds `base x max_multiplier`
    pub max_multiplier: f64,
}

impl Default for AdaptiveTimeoutConfig {
    fn default() -> Self {
        Self {
            slow_threshold_ms: 1000.0,
            slow_factor: 1.5,
            elevated_threshold_ms: 500.0,
            elevated_factor: 1.2,
            error_streak: 3,
            error_factor: 1.3,
            max_multiplier: 2.0,
        }
    }
}

impl AdaptiveTimeoutConfig {
    /// Timeout for the next attempt on a connection with the given history
    pub fn timeout_for(
        &self,
        base: Duration,
        avg_response_time_ms: f64,
        consecutive_errors: u32,
    ) -> Duration {
        let perf = if avg_response_time_ms > self.slow_threshold_ms {
            self.slow_factor
        } else if avg_response_time_ms > self.elevated_threshold_ms {
            self.elevated_factor
        } else {
            1.0
        };
        let err = if consecutive_errors > self.error_streak {
            self.error_factor
        } else {
            1.0
        };
        base.mul_f64((perf * err).min(self.max_multiplier))
    }
}

/// Retry policy for one connection
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub base_timeout: Duration,
    pub adaptive: AdaptiveTimeoutConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            base_timeout: Duration::from_secs(30),
            adaptive: AdaptiveTimeoutConfig::default(),
        }
    }
}

impl RetryConfig {
    /// Delay after the failed attempt with zero-based index `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Execute `op` on `conn`, retrying retryable failures with backoff
///
/// `op` receives a clone of the connection handle for each attempt. Stops
/// early on a non-retryable error, or with `CircuitOpen` when the
/// connection's breaker opens between attempts. Failures are wrapped in
/// `ConduitError::Failed` carrying the endpoint, attempt count and elapsed
/// time.
pub async fn execute_with_retry<T, R, F, Fut>(
    conn: &PooledConnection<T>,
    config: &RetryConfig,
    attempts: u32,
    base_timeout: Duration,
    mut op: F,
) -> Result<R>
where
    T: Clone,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let started = Instant::now();
    let attempts = attempts.max(1);
    let mut last_error: Option<ConduitError> = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            if conn.circuit_state() == CircuitState::Open {
                debug!(endpoint = %conn.endpoint(), attempt, "circuit opened mid-retry");
                return Err(failed(
                    conn,
                    attempt,
                    started,
                    ConduitError::CircuitOpen(conn.endpoint().to_string()),
                ));
            }
            let delay = config.backoff(attempt - 1);
            debug!(endpoint = %conn.endpoint(), attempt, ?delay, "backing off before retry");
            tokio::time::sleep(delay).await;
        }

        let (avg_ms, consecutive_errors) = conn
            .snapshot()
            .map(|s| (s.avg_response_time_ms, s.consecutive_errors))
            .unwrap_or((0.0, 0));
        let timeout = config
            .adaptive
            .timeout_for(base_timeout, avg_ms, consecutive_errors);

        let call_started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, op(conn.conn().clone())).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ConduitError::Timeout(timeout)),
        };
        let elapsed = call_started.elapsed();

        match outcome {
            Ok(value) => {
                conn.record_success(elapsed);
                return Ok(value);
            }
            Err(e) => {
                if e.trips_breaker() {
                    conn.record_failure(elapsed);
                } else {
                    // The node answered; the request itself was bad
                    conn.record_success(elapsed);
                }
                warn!(
                    endpoint = %conn.endpoint(),
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %e,
                    "request attempt failed"
                );
                if !e.is_retryable() {
                    return Err(failed(conn, attempt + 1, started, e));
                }
                last_error = Some(e);
            }
        }
    }

    let cause = last_error.unwrap_or_else(|| ConduitError::Unavailable("no attempts made".into()));
    Err(failed(conn, attempts, started, cause))
}

fn failed<T>(
    conn: &PooledConnection<T>,
    attempts: u32,
    started: Instant,
    cause: ConduitError,
) -> ConduitError {
    ConduitError::Failed {
        endpoint: conn.endpoint().to_string(),
        attempts,
        elapsed_ms: started.elapsed().as_millis() as u64,
        cause: Box::new(cause),
    }
}
