//! Health-scored connection pool
//!
//! The pool owns a bounded set of connections spread over one or more
//! endpoints. Every connection carries its own health statistics and circuit
//! breaker. `acquire()` hands out the best eligible connection:
//!
//! - eligible: not in use, circuit not open, health score above the floor
//! - score: `health - penalty x consecutive_errors - (slow ? slow_penalty : 0)`
//! - ties go to the least recently used connection
//!
//! Only the slot table is locked, and never across an `.await`. A checked-out
//! connection is returned when its `PooledConnection` guard is dropped, so a
//! caller whose future is cancelled releases its connection immediately.

use super::circuit_breaker::{BreakerTarget, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::error::ResilienceError;
use super::health::{HealthScoring, HealthStats};
use futures::future::join_all;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections created by `initialize()`
    pub min_size: usize,
    /// Maximum number of connections in the pool
    pub max_size: usize,
    /// Create connections on demand (up to `max_size`) when none is eligible
    pub allow_growth: bool,
    /// Timeout for acquiring a connection from the pool
    pub acquire_timeout: Duration,
    /// Upper bound between eligibility re-checks while waiting
    pub poll_interval: Duration,
    /// Connections at or below this health score are not handed out
    pub min_health_score: f64,
    /// Score deducted per consecutive error
    pub consecutive_error_penalty: f64,
    /// Average latency above which a connection counts as slow
    pub slow_response_ms: f64,
    /// Score deducted from slow connections
    pub slow_response_penalty: f64,
    /// Breaker settings applied to every connection
    pub breaker: CircuitBreakerConfig,
    /// Health score constants applied to every connection
    pub scoring: HealthScoring,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            allow_growth: true,
            acquire_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            min_health_score: 50.0,
            consecutive_error_penalty: 10.0,
            slow_response_ms: 1000.0,
            slow_response_penalty: 20.0,
            breaker: CircuitBreakerConfig::default(),
            scoring: HealthScoring::default(),
        }
    }
}

impl PoolConfig {
    /// Reject configurations that could never hand out a connection
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_size == 0 {
            return Err(ResilienceError::InvalidConfig(
                "max_size must be at least 1".into(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(ResilienceError::InvalidConfig(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if !self.allow_growth && self.min_size == 0 {
            return Err(ResilienceError::InvalidConfig(
                "a pool that cannot grow needs min_size >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Factory trait for creating and closing connections
#[async_trait::async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Create a new connection to `endpoint`
    async fn create(&self, endpoint: &str) -> Result<T, ResilienceError>;

    /// Close a connection (optional cleanup)
    async fn close(&self, conn: T) {
        drop(conn);
    }
}

/// A pooled connection and its bookkeeping
#[derive(Debug)]
struct Slot<T> {
    id: u64,
    endpoint: String,
    conn: T,
    in_use: bool,
    last_used_at: Instant,
    stats: HealthStats,
    breaker: CircuitBreaker,
}

/// Internal pool state
#[derive(Debug)]
struct PoolState<T> {
    slots: Vec<Slot<T>>,
    /// Connections being created outside the lock
    pending: usize,
    next_id: u64,
}

impl<T> PoolState<T> {
    fn slot_mut(&mut self, id: u64) -> Option<&mut Slot<T>> {
        self.slots.iter_mut().find(|slot| slot.id == id)
    }
}

struct PoolShared<T> {
    label: String,
    config: PoolConfig,
    endpoints: Vec<String>,
    factory: Arc<dyn ConnectionFactory<T>>,
    state: Mutex<PoolState<T>>,
    released: Notify,
    closed: AtomicBool,
}

impl<T> PoolShared<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: u64) {
        {
            let mut state = self.lock();
            if let Some(slot) = state.slot_mut(id) {
                slot.in_use = false;
                slot.last_used_at = Instant::now();
            }
        }
        self.released.notify_waiters();
    }

    fn record(&self, id: u64, elapsed: Duration, success: bool) {
        let floor = self.config.min_health_score;
        let mut state = self.lock();
        let Some(slot) = state.slot_mut(id) else {
            return;
        };
        if !success {
            slot.stats.record(elapsed, false, &self.config.scoring);
            slot.breaker.record_failure();
            return;
        }

        let on_trial = slot.breaker.peek_state() == CircuitState::HalfOpen;
        slot.breaker.record_success();
        let closed_again = on_trial && slot.breaker.peek_state() == CircuitState::Closed;
        // A recovered connection starts over instead of carrying its outage
        // in the lifetime error rate
        if closed_again || slot.stats.health_score() <= floor {
            debug!(pool = %self.label, id, "connection recovered, statistics reset");
            slot.stats.reset();
        }
        slot.stats.record(elapsed, true, &self.config.scoring);
    }

    fn selection_score(&self, slot: &Slot<T>) -> f64 {
        let mut score = slot.stats.health_score()
            - self.config.consecutive_error_penalty * slot.breaker.consecutive_failures() as f64;
        if slot.stats.avg_response_time_ms() > self.config.slow_response_ms {
            score -= self.config.slow_response_penalty;
        }
        score
    }
}

/// Reserved growth capacity, returned to the pool unless committed
struct Reservation<'a, T> {
    shared: &'a PoolShared<T>,
    armed: bool,
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            state.pending = state.pending.saturating_sub(1);
        }
    }
}

enum Checkout<T> {
    Ready(PooledConnection<T>),
    Grow(String),
    Wait,
}

/// Point-in-time view of one connection
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub endpoint: String,
    pub in_use: bool,
    pub request_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub avg_response_time_ms: f64,
    pub health_score: f64,
    pub circuit_state: CircuitState,
    /// Time since the connection was last acquired or released
    pub idle_for: Duration,
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    /// Connections not currently checked out
    pub idle: usize,
    /// Connections currently checked out
    pub in_use: usize,
    /// Total connections (idle + in use)
    pub total: usize,
    /// Connections whose circuit is open
    pub open_circuits: usize,
    /// Maximum pool size
    pub max_size: usize,
}

impl PoolStats {
    /// Fraction of the pool's capacity that is checked out
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            self.in_use as f64 / self.max_size as f64
        }
    }
}

/// Outcome of a health-check pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheckReport {
    pub probed: usize,
    pub healthy: usize,
    pub failed: usize,
}

/// Outcome of closing the pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Every connection was released before the drain deadline
    pub drained: bool,
    /// Connections closed in total
    pub closed: usize,
    /// Connections that were still checked out and closed anyway
    pub forced: usize,
}

/// A checked-out connection; returned to the pool on drop
pub struct PooledConnection<T> {
    shared: Arc<PoolShared<T>>,
    id: u64,
    endpoint: String,
    conn: T,
}

impl<T> PooledConnection<T> {
    /// The underlying transport handle
    pub fn conn(&self) -> &T {
        &self.conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Record a completed call on this connection
    pub fn record_success(&self, elapsed: Duration) {
        self.shared.record(self.id, elapsed, true);
    }

    /// Record a failed call on this connection
    pub fn record_failure(&self, elapsed: Duration) {
        self.shared.record(self.id, elapsed, false);
    }

    /// Current statistics of this connection
    pub fn snapshot(&self) -> Option<ConnectionSnapshot> {
        let mut state = self.shared.lock();
        state.slot_mut(self.id).map(snapshot_of)
    }

    pub fn circuit_state(&self) -> CircuitState {
        let mut state = self.shared.lock();
        state
            .slot_mut(self.id)
            .map(|slot| slot.breaker.state())
            .unwrap_or(CircuitState::Open)
    }
}

impl<T> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

impl<T: Debug> Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

fn snapshot_of<T>(slot: &mut Slot<T>) -> ConnectionSnapshot {
    ConnectionSnapshot {
        id: slot.id,
        endpoint: slot.endpoint.clone(),
        in_use: slot.in_use,
        request_count: slot.stats.request_count(),
        error_count: slot.stats.error_count(),
        consecutive_errors: slot.breaker.consecutive_failures(),
        avg_response_time_ms: slot.stats.avg_response_time_ms(),
        health_score: slot.stats.health_score(),
        circuit_state: slot.breaker.state(),
        idle_for: slot.last_used_at.elapsed(),
    }
}

fn is_better(current: Option<(usize, f64, Instant)>, score: f64, last_used: Instant) -> bool {
    match current {
        None => true,
        Some((_, best_score, best_used)) => {
            score > best_score || (score == best_score && last_used < best_used)
        }
    }
}

fn check_out<T: Clone>(shared: &Arc<PoolShared<T>>, slot: &mut Slot<T>) -> PooledConnection<T> {
    slot.in_use = true;
    slot.last_used_at = Instant::now();
    PooledConnection {
        shared: Arc::clone(shared),
        id: slot.id,
        endpoint: slot.endpoint.clone(),
        conn: slot.conn.clone(),
    }
}

/// A health-scored connection pool
///
/// # Example
/// ```no_run
/// use conduit_core_resilience::{ConnectionFactory, ConnectionPool, PoolConfig, ResilienceError};
/// use std::sync::Arc;
///
/// # #[derive(Clone)]
/// # struct MyConnection;
/// struct MyConnectionFactory;
///
/// #[async_trait::async_trait]
/// impl ConnectionFactory<MyConnection> for MyConnectionFactory {
///     async fn create(&self, _endpoint: &str) -> Result<MyConnection, ResilienceError> {
///         Ok(MyConnection)
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ConnectionPool::new(
///     "primary",
///     vec!["http://127.0.0.1:8899".to_string()],
///     Arc::new(MyConnectionFactory),
///     PoolConfig::default(),
/// )?;
/// pool.initialize().await;
///
/// let conn = pool.acquire().await?;
/// // Use conn.conn() ...
/// drop(conn); // back to the pool
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ConnectionPool<T> {
    /// Create an empty pool over `endpoints`
    pub fn new(
        label: impl Into<String>,
        endpoints: Vec<String>,
        factory: Arc<dyn ConnectionFactory<T>>,
        config: PoolConfig,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        if endpoints.is_empty() {
            return Err(ResilienceError::InvalidConfig(
                "a pool needs at least one endpoint".into(),
            ));
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                label: label.into(),
                config,
                endpoints,
                factory,
                state: Mutex::new(PoolState {
                    slots: Vec::new(),
                    pending: 0,
                    next_id: 0,
                }),
                released: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn endpoints(&self) -> &[String] {
        &self.shared.endpoints
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Create `min_size` idle connections, spread across the endpoints
    ///
    /// Returns how many were created; failures are logged and left to
    /// on-demand growth.
    pub async fn initialize(&self) -> usize {
        let mut created = 0;
        for i in 0..self.shared.config.min_size {
            let endpoint = &self.shared.endpoints[i % self.shared.endpoints.len()];
            match self.shared.factory.create(endpoint).await {
                Ok(conn) => {
                    self.insert_slot(endpoint.clone(), conn, false);
                    created += 1;
                }
                Err(e) => warn!(
                    pool = %self.shared.label,
                    endpoint = %endpoint,
                    error = %e,
                    "failed to pre-create connection"
                ),
            }
        }
        info!(pool = %self.shared.label, created, "connection pool initialized");
        created
    }

    /// Acquire the best eligible connection
    ///
    /// Grows the pool when allowed; otherwise waits for a release (re-checking
    /// every `poll_interval`, since circuits also recover with time) until
    /// `acquire_timeout` elapses.
    pub async fn acquire(&self) -> Result<PooledConnection<T>, ResilienceError> {
        let started = Instant::now();
        let deadline = started + self.shared.config.acquire_timeout;

        loop {
            if self.is_closed() {
                return Err(ResilienceError::Closed);
            }

            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_checkout() {
                Checkout::Ready(conn) => return Ok(conn),
                Checkout::Grow(endpoint) => match self.grow(endpoint).await {
                    Ok(conn) => return Ok(conn),
                    Err(ResilienceError::Closed) => return Err(ResilienceError::Closed),
                    Err(e) => debug!(pool = %self.shared.label, error = %e, "pool growth failed"),
                },
                Checkout::Wait => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ResilienceError::Unavailable {
                    waited: now.duration_since(started),
                });
            }
            let wait = self.shared.config.poll_interval.min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    fn try_checkout(&self) -> Checkout<T> {
        let shared = &self.shared;
        let mut state = shared.lock();

        // Best slot above the health floor, and best slot below it
        let mut best: Option<(usize, f64, Instant)> = None;
        let mut fallback: Option<(usize, f64, Instant)> = None;
        for (idx, slot) in state.slots.iter_mut().enumerate() {
            if slot.in_use {
                continue;
            }
            let circuit = slot.breaker.state();
            if circuit == CircuitState::Open {
                continue;
            }
            // A half-open connection is on trial and skips the floor
            let below_floor = circuit == CircuitState::Closed
                && slot.stats.health_score() <= shared.config.min_health_score;
            let score = shared.selection_score(slot);
            let pick = if below_floor { &mut fallback } else { &mut best };
            if is_better(*pick, score, slot.last_used_at) {
                *pick = Some((idx, score, slot.last_used_at));
            }
        }

        if let Some((idx, _, _)) = best {
            return Checkout::Ready(check_out(shared, &mut state.slots[idx]));
        }

        if shared.config.allow_growth
            && state.slots.len() + state.pending < shared.config.max_size
        {
            state.pending += 1;
            let endpoint = shared
                .endpoints
                .iter()
                .min_by_key(|endpoint| {
                    state
                        .slots
                        .iter()
                        .filter(|slot| &slot.endpoint == *endpoint)
                        .count()
                })
                .cloned()
                .unwrap_or_else(|| shared.endpoints[0].clone());
            return Checkout::Grow(endpoint);
        }

        // Nothing healthy and no room to grow: a degraded connection beats
        // none, and its next success lifts it back above the floor
        if let Some((idx, _, _)) = fallback {
            let slot = &mut state.slots[idx];
            debug!(
                pool = %shared.label,
                id = slot.id,
                health_score = slot.stats.health_score(),
                "handing out connection below the health floor"
            );
            return Checkout::Ready(check_out(shared, slot));
        }

        Checkout::Wait
    }

    async fn grow(&self, endpoint: String) -> Result<PooledConnection<T>, ResilienceError> {
        let mut reservation = Reservation {
            shared: self.shared.as_ref(),
            armed: true,
        };

        let conn = self.shared.factory.create(&endpoint).await.inspect_err(|e| {
            warn!(pool = %self.shared.label, endpoint = %endpoint, error = %e, "failed to open connection");
        })?;

        if self.is_closed() {
            drop(reservation);
            self.shared.factory.close(conn).await;
            return Err(ResilienceError::Closed);
        }

        let id = {
            let mut state = self.shared.lock();
            state.pending = state.pending.saturating_sub(1);
            reservation.armed = false;
            let id = state.next_id;
            state.next_id += 1;
            state.slots.push(self.new_slot(id, endpoint.clone(), conn.clone(), true));
            id
        };
        debug!(pool = %self.shared.label, endpoint = %endpoint, id, "opened new connection");

        Ok(PooledConnection {
            shared: Arc::clone(&self.shared),
            id,
            endpoint,
            conn,
        })
    }

    fn insert_slot(&self, endpoint: String, conn: T, in_use: bool) -> u64 {
        let mut state = self.shared.lock();
        let id = state.next_id;
        state.next_id += 1;
        let slot = self.new_slot(id, endpoint, conn, in_use);
        state.slots.push(slot);
        id
    }

    fn new_slot(&self, id: u64, endpoint: String, conn: T, in_use: bool) -> Slot<T> {
        let breaker = CircuitBreaker::new(
            BreakerTarget::connection(format!("{}#{}", endpoint, id)),
            self.shared.config.breaker.clone(),
        );
        Slot {
            id,
            endpoint,
            conn,
            in_use,
            last_used_at: Instant::now(),
            stats: HealthStats::new(),
            breaker,
        }
    }

    /// Probe every idle connection, open circuits included
    ///
    /// Probed connections are checked out for the duration of the probe so
    /// regular traffic cannot share them. Outcomes feed the same statistics
    /// and breakers as regular calls.
    pub async fn health_check<F, Fut>(&self, probe: F, timeout: Duration) -> HealthCheckReport
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = bool>,
    {
        let targets: Vec<PooledConnection<T>> = {
            let mut state = self.shared.lock();
            state
                .slots
                .iter_mut()
                .filter(|slot| !slot.in_use)
                .map(|slot| {
                    slot.in_use = true;
                    PooledConnection {
                        shared: Arc::clone(&self.shared),
                        id: slot.id,
                        endpoint: slot.endpoint.clone(),
                        conn: slot.conn.clone(),
                    }
                })
                .collect()
        };

        let outcomes = join_all(targets.into_iter().map(|conn| {
            let fut = probe(conn.conn().clone());
            async move {
                let started = Instant::now();
                let ok = matches!(tokio::time::timeout(timeout, fut).await, Ok(true));
                let elapsed = started.elapsed();
                if ok {
                    conn.record_success(elapsed);
                } else {
                    conn.record_failure(elapsed);
                }
                ok
            }
        }))
        .await;

        let healthy = outcomes.iter().filter(|ok| **ok).count();
        let report = HealthCheckReport {
            probed: outcomes.len(),
            healthy,
            failed: outcomes.len() - healthy,
        };
        debug!(
            pool = %self.shared.label,
            probed = report.probed,
            healthy = report.healthy,
            "health check complete"
        );
        report
    }

    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        let mut state = self.shared.lock();
        let in_use = state.slots.iter().filter(|slot| slot.in_use).count();
        let open_circuits = state
            .slots
            .iter_mut()
            .map(|slot| slot.breaker.state())
            .filter(|state| *state == CircuitState::Open)
            .count();
        PoolStats {
            idle: state.slots.len() - in_use,
            in_use,
            total: state.slots.len(),
            open_circuits,
            max_size: self.shared.config.max_size,
        }
    }

    /// Per-connection detail listing
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut state = self.shared.lock();
        state.slots.iter_mut().map(snapshot_of).collect()
    }

    /// Close the pool
    ///
    /// New acquisitions fail immediately. Waits up to `drain_timeout` for every
    /// checked-out connection to come back, then closes all connections,
    /// including any still in use.
    pub async fn close(&self, drain_timeout: Duration) -> DrainReport {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.released.notify_waiters();

        let deadline = Instant::now() + drain_timeout;
        let drained = loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let in_use = self.shared.lock().slots.iter().filter(|s| s.in_use).count();
            if in_use == 0 {
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            let wait = self.shared.config.poll_interval.min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        };

        let slots = std::mem::take(&mut self.shared.lock().slots);
        let forced = slots.iter().filter(|slot| slot.in_use).count();
        let closed = slots.len();
        for slot in slots {
            self.shared.factory.close(slot.conn).await;
        }

        if drained {
            info!(pool = %self.shared.label, closed, "connection pool closed");
        } else {
            warn!(
                pool = %self.shared.label,
                closed,
                forced,
                "connection pool drain timed out; closed busy connections"
            );
        }
        DrainReport {
            drained,
            closed,
            forced,
        }
    }
}
