//! Backend instances behind the load balancer
//!
//! An instance is one endpoint with its own connection pool, an
//! instance-level circuit breaker and rolling request statistics. Resource
//! usage (CPU, memory) is reported from outside and feeds adaptive selection
//! and autoscaling.

use conduit_core_resilience::{
    BreakerTarget, CircuitBreaker, CircuitBreakerConfig, CircuitState, ConnectionPool,
    ConnectionSnapshot, HealthScoring, HealthStats, PoolStats,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::strategy::InstanceView;
use crate::error::ConduitError;
use crate::transport::Connection;

/// Health transition caused by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    BecameHealthy,
    BecameUnhealthy,
}

#[derive(Debug)]
struct InstanceState {
    healthy: bool,
    draining: bool,
    breaker: CircuitBreaker,
    stats: HealthStats,
    cpu_usage: f64,
    memory_usage: f64,
    failed_probes: u32,
    last_probe_at: Option<Instant>,
}

/// One load-balanced endpoint
pub struct Instance {
    id: String,
    endpoint: String,
    weight: u32,
    pool: ConnectionPool<Connection>,
    scoring: HealthScoring,
    max_connections: usize,
    state: Mutex<InstanceState>,
    connections: AtomicUsize,
    registered_at: Instant,
}

/// Point-in-time view of an instance for `details()`
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub id: String,
    pub endpoint: String,
    pub weight: u32,
    pub healthy: bool,
    pub draining: bool,
    pub circuit_state: CircuitState,
    pub active_requests: usize,
    pub request_count: u64,
    pub error_count: u64,
    pub avg_response_time_ms: f64,
    pub health_score: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub uptime: Duration,
    pub pool: PoolStats,
    pub connections: Vec<ConnectionSnapshot>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("weight", &self.weight)
            .finish()
    }
}

impl Instance {
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        weight: u32,
        pool: ConnectionPool<Connection>,
        breaker: CircuitBreakerConfig,
        scoring: HealthScoring,
        max_connections: usize,
    ) -> Self {
        let id = id.into();
        let endpoint = endpoint.into();
        Self {
            state: Mutex::new(InstanceState {
                healthy: true,
                draining: false,
                breaker: CircuitBreaker::new(BreakerTarget::instance(id.clone()), breaker),
                stats: HealthStats::new(),
                cpu_usage: 0.0,
                memory_usage: 0.0,
                failed_probes: 0,
                last_probe_at: None,
            }),
            id,
            endpoint,
            weight: weight.max(1),
            pool,
            scoring,
            max_connections: max_connections.max(1),
            connections: AtomicUsize::new(0),
            registered_at: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn pool(&self) -> &ConnectionPool<Connection> {
        &self.pool
    }

    /// Requests currently executing on this instance
    pub fn active_requests(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Healthy, not draining and not isolated by its breaker
    pub fn is_eligible(&self) -> bool {
        let mut state = self.lock();
        state.healthy && !state.draining && state.breaker.allows_requests()
    }

    pub fn is_healthy(&self) -> bool {
        self.lock().healthy
    }

    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    pub fn set_draining(&self) {
        self.lock().draining = true;
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.lock().breaker.state()
    }

    /// What selection policies see
    pub fn view(&self) -> InstanceView {
        let state = self.lock();
        InstanceView {
            id: self.id.clone(),
            weight: self.weight,
            connections: self.active_requests(),
            avg_response_time_ms: state.stats.avg_response_time_ms(),
            cpu_usage: state.cpu_usage,
            memory_usage: state.memory_usage,
            health_score: state.stats.health_score(),
        }
    }

    /// Mark a request as running until the guard drops
    pub fn begin_request(self: &Arc<Self>) -> RequestGuard {
        self.connections.fetch_add(1, Ordering::AcqRel);
        RequestGuard {
            instance: Arc::clone(self),
        }
    }

    /// Feed a completed request into statistics and the instance breaker
    pub fn record_success(&self, elapsed: Duration) {
        let mut state = self.lock();
        state.stats.record(elapsed, true, &self.scoring);
        state.breaker.record_success();
    }

    pub fn record_failure(&self, elapsed: Duration) {
        let mut state = self.lock();
        state.stats.record(elapsed, false, &self.scoring);
        state.breaker.record_failure();
    }

    /// Record a failed attempt according to what the error says about the
    /// instance
    ///
    /// Transport-level failures count against it; a permanent remote error
    /// still proves a working round-trip. Capacity and isolation errors
    /// never reached the node and leave no trace.
    pub fn record_error(&self, error: &ConduitError, elapsed: Duration) {
        if error.trips_breaker() {
            self.record_failure(elapsed);
            return;
        }
        match error.root_cause() {
            ConduitError::Remote { .. } | ConduitError::Codec(_) => self.record_success(elapsed),
            _ => {}
        }
    }

    /// Apply a probe outcome; returns a transition when health flipped
    pub fn record_probe(&self, success: bool, unhealthy_threshold: u32) -> Option<HealthTransition> {
        let mut state = self.lock();
        state.last_probe_at = Some(Instant::now());
        if success {
            state.failed_probes = 0;
            if !state.healthy {
                state.healthy = true;
                info!(instance = %self.id, endpoint = %self.endpoint, "instance healthy again");
                return Some(HealthTransition::BecameHealthy);
            }
            return None;
        }

        state.failed_probes = state.failed_probes.saturating_add(1);
        if state.healthy && state.failed_probes >= unhealthy_threshold.max(1) {
            state.healthy = false;
            warn!(
                instance = %self.id,
                endpoint = %self.endpoint,
                failed_probes = state.failed_probes,
                "instance marked unhealthy"
            );
            return Some(HealthTransition::BecameUnhealthy);
        }
        None
    }

    /// Store externally reported usage, clamped to percentages
    pub fn set_resource_usage(&self, cpu_usage: f64, memory_usage: f64) {
        let mut state = self.lock();
        state.cpu_usage = cpu_usage.clamp(0.0, 100.0);
        state.memory_usage = memory_usage.clamp(0.0, 100.0);
    }

    pub fn resource_usage(&self) -> (f64, f64) {
        let state = self.lock();
        (state.cpu_usage, state.memory_usage)
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        self.lock().stats.avg_response_time_ms()
    }

    /// Combined load in `[0, 1]`: request slots, CPU and memory averaged
    pub fn utilization(&self) -> f64 {
        let (cpu, memory) = self.resource_usage();
        let slots = (self.active_requests() as f64 / self.max_connections as f64).min(1.0);
        (slots + cpu / 100.0 + memory / 100.0) / 3.0
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let (healthy, draining, circuit_state, stats, cpu_usage, memory_usage) = {
            let mut state = self.lock();
            let circuit_state = state.breaker.state();
            (
                state.healthy,
                state.draining,
                circuit_state,
                state.stats.clone(),
                state.cpu_usage,
                state.memory_usage,
            )
        };
        InstanceSnapshot {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            weight: self.weight,
            healthy,
            draining,
            circuit_state,
            active_requests: self.active_requests(),
            request_count: stats.request_count(),
            error_count: stats.error_count(),
            avg_response_time_ms: stats.avg_response_time_ms(),
            health_score: stats.health_score(),
            cpu_usage,
            memory_usage,
            uptime: self.registered_at.elapsed(),
            pool: self.pool.stats(),
            connections: self.pool.snapshot(),
        }
    }
}

/// Active-request marker; decrements the instance's count on drop
pub struct RequestGuard {
    instance: Arc<Instance>,
}

impl RequestGuard {
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.instance.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use conduit_core_resilience::{ConnectionFactory, PoolConfig, ResilienceError};
    use serde_json::Value;

    struct NullTransport(String);

    #[async_trait]
    impl Transport for NullTransport {
        async fn call(&self, _method: &str, _params: &[Value]) -> crate::error::Result<Value> {
            Ok(Value::Null)
        }

        fn endpoint(&self) -> &str {
            &self.0
        }
    }

    struct NullFactory;

    #[async_trait]
    impl ConnectionFactory<Connection> for NullFactory {
        async fn create(&self, endpoint: &str) -> Result<Connection, ResilienceError> {
            Ok(Arc::new(NullTransport(endpoint.to_string())))
        }
    }

    fn instance(breaker: CircuitBreakerConfig) -> Arc<Instance> {
        let pool = ConnectionPool::new(
            "i-1",
            vec!["mock://a".to_string()],
            Arc::new(NullFactory),
            PoolConfig::default(),
        )
        .unwrap();
        Arc::new(Instance::new(
            "i-1",
            "mock://a",
            1,
            pool,
            breaker,
            HealthScoring::default(),
            10,
        ))
    }

    #[tokio::test]
    async fn test_request_guard_tracks_active_requests() {
        let instance = instance(CircuitBreakerConfig::default());
        let a = instance.begin_request();
        let b = instance.begin_request();
        assert_eq!(instance.active_requests(), 2);
        assert_eq!(instance.view().connections, 2);
        drop(a);
        drop(b);
        assert_eq!(instance.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_after_threshold_and_back_after_one_success() {
        let instance = instance(CircuitBreakerConfig::default());
        assert_eq!(instance.record_probe(false, 3), None);
        assert_eq!(instance.record_probe(false, 3), None);
        assert_eq!(
            instance.record_probe(false, 3),
            Some(HealthTransition::BecameUnhealthy)
        );
        assert!(!instance.is_eligible());
        assert_eq!(instance.record_probe(false, 3), None);
        assert_eq!(
            instance.record_probe(true, 3),
            Some(HealthTransition::BecameHealthy)
        );
        assert!(instance.is_eligible());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_excludes_instance() {
        let instance = instance(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            cooldown: Duration::from_secs(10),
        });
        let timeout = ConduitError::Timeout(Duration::from_secs(1));
        instance.record_error(&timeout, Duration::from_millis(5));
        assert!(instance.is_eligible());
        instance.record_error(&timeout, Duration::from_millis(5));
        assert!(!instance.is_eligible());
        assert_eq!(instance.circuit_state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(instance.is_eligible());
    }

    #[tokio::test]
    async fn test_record_error_classification() {
        let instance = instance(CircuitBreakerConfig::default());
        let permanent = ConduitError::Remote {
            code: -32602,
            message: "invalid params".into(),
            transient: false,
        };
        instance.record_error(&permanent, Duration::from_millis(10));
        instance.record_error(
            &ConduitError::Unavailable("pool exhausted".into()),
            Duration::from_millis(10),
        );
        let snapshot = instance.snapshot();
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.error_count, 0);
    }

    #[tokio::test]
    async fn test_resource_usage_clamped_and_utilization() {
        let instance = instance(CircuitBreakerConfig::default());
        instance.set_resource_usage(150.0, -4.0);
        assert_eq!(instance.resource_usage(), (100.0, 0.0));
        let _guard = instance.begin_request();
        // (0.1 + 1.0 + 0.0) / 3
        assert!((instance.utilization() - 1.1 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_draining_is_not_eligible() {
        let instance = instance(CircuitBreakerConfig::default());
        instance.set_draining();
        assert!(instance.is_draining());
        assert!(!instance.is_eligible());
    }
}
