/*!
 * Instance registry and request routing
 *
 * The balancer owns every backend instance (one connection pool each),
 * selects an eligible instance per request through a `SelectionPolicy`,
 * retries retryable failures on other instances and keeps instance health up
 * to date with periodic probes.
 */

pub mod autoscaler;
pub mod instance;
pub mod strategy;

use conduit_core_resilience::{CircuitBreakerConfig, DrainReport, HealthScoring, PoolConfig};
use dashmap::DashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConduitError, Result};
use crate::transport::TransportFactory;
use conduit_core_resilience::ConnectionPool;
pub use instance::{HealthTransition, Instance, InstanceSnapshot, RequestGuard};
pub use strategy::{InstanceView, SelectionContext, SelectionPolicy, StrategyKind};

/// Load balancer configuration
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub strategy: StrategyKind,
    pub sticky_sessions: bool,
    /// Instances tried per request
    pub max_attempts: u32,
    /// How long `next_instance` waits for an eligible instance
    pub acquire_timeout: Duration,
    pub poll_interval: Duration,
    pub health_check_interval: Duration,
    pub health_check_method: String,
    pub health_check_timeout: Duration,
    /// Consecutive failed probes before an instance is marked unhealthy
    pub unhealthy_threshold: u32,
    /// Connection count treated as full load by headroom scoring
    pub max_connections_per_instance: usize,
    /// Instance-level breaker settings
    pub breaker: CircuitBreakerConfig,
    pub scoring: HealthScoring,
    /// How long deregistration waits for in-flight requests
    pub drain_timeout: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            sticky_sessions: false,
            max_attempts: 3,
            acquire_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            health_check_interval: Duration::from_secs(30),
            health_check_method: "getHealth".to_string(),
            health_check_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            max_connections_per_instance: 10,
            breaker: CircuitBreakerConfig::default(),
            scoring: HealthScoring::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Averages over healthy instances, as seen by the autoscaler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterMetrics {
    /// Registered instances that are not draining
    pub instances: usize,
    pub healthy_instances: usize,
    pub avg_cpu: f64,
    pub avg_memory: f64,
    pub avg_response_time_ms: f64,
}

/// Routes requests across registered instances
pub struct LoadBalancer {
    config: BalancerConfig,
    pool_config: PoolConfig,
    policy: Arc<dyn SelectionPolicy>,
    factory: Arc<TransportFactory>,
    instances: RwLock<Vec<Arc<Instance>>>,
    sessions: DashMap<String, String>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl LoadBalancer {
    /// Balancer using the policy named by `config.strategy`
    pub fn new(
        config: BalancerConfig,
        pool_config: PoolConfig,
        factory: Arc<TransportFactory>,
    ) -> Self {
        let policy = config.strategy.build();
        Self::with_policy(config, pool_config, factory, policy)
    }

    /// Balancer using a custom selection policy
    pub fn with_policy(
        config: BalancerConfig,
        pool_config: PoolConfig,
        factory: Arc<TransportFactory>,
        policy: Arc<dyn SelectionPolicy>,
    ) -> Self {
        info!(policy = policy.name(), "load balancer created");
        Self {
            config,
            pool_config,
            policy,
            factory,
            instances: RwLock::new(Vec::new()),
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// All registered instances, draining ones included
    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn instance(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances().into_iter().find(|i| i.id() == id)
    }

    /// Registered instances that are not draining
    pub fn instance_count(&self) -> usize {
        self.instances().iter().filter(|i| !i.is_draining()).count()
    }

    /// Sum of pool capacities of instances that are not draining
    pub fn total_capacity(&self) -> usize {
        self.instances()
            .iter()
            .filter(|i| !i.is_draining())
            .map(|i| i.pool().config().max_size)
            .sum()
    }

    /// Connection utilization across every pool, in `[0, 1]`
    pub fn connection_utilization(&self) -> f64 {
        let (in_use, capacity) = self
            .instances()
            .iter()
            .map(|i| i.pool().stats())
            .fold((0usize, 0usize), |(used, cap), stats| {
                (used + stats.in_use, cap + stats.max_size)
            });
        if capacity == 0 {
            0.0
        } else {
            in_use as f64 / capacity as f64
        }
    }

    /// Create an instance for `endpoint` with its own pool and add it to the
    /// registry
    pub async fn register(&self, endpoint: &str, weight: u32) -> Result<Arc<Instance>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConduitError::ShutDown);
        }
        let id = format!("instance-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let pool = ConnectionPool::new(
            id.clone(),
            vec![endpoint.to_string()],
            Arc::clone(&self.factory),
            self.pool_config.clone(),
        )?;
        let created = pool.initialize().await;

        let instance = Arc::new(Instance::new(
            id.clone(),
            endpoint,
            weight,
            pool,
            self.config.breaker.clone(),
            self.config.scoring.clone(),
            self.config.max_connections_per_instance,
        ));
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&instance));

        info!(instance = %id, endpoint, weight, connections = created, "instance registered");
        Ok(instance)
    }

    /// Remove an instance after draining it
    ///
    /// The instance stops receiving new requests immediately; in-flight
    /// requests get up to `drain_timeout` before its pool is closed.
    pub async fn deregister(&self, id: &str) -> Result<DrainReport> {
        let instance = self
            .instance(id)
            .ok_or_else(|| ConduitError::Config(format!("unknown instance '{}'", id)))?;
        instance.set_draining();
        self.sessions.retain(|_, pinned| pinned != id);

        let deadline = Instant::now() + self.config.drain_timeout;
        while instance.active_requests() > 0 && Instant::now() < deadline {
            tokio::time::sleep(self.config.poll_interval).await;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let report = instance.pool().close(remaining).await;

        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|i| i.id() != id);

        if report.drained {
            info!(instance = %id, endpoint = %instance.endpoint(), "instance deregistered");
        } else {
            warn!(
                instance = %id,
                endpoint = %instance.endpoint(),
                forced = report.forced,
                "instance deregistered before in-flight requests finished"
            );
        }
        Ok(report)
    }

    /// Store reported CPU and memory usage for an instance
    pub fn report_resource_usage(&self, id: &str, cpu_usage: f64, memory_usage: f64) -> bool {
        match self.instance(id) {
            Some(instance) => {
                instance.set_resource_usage(cpu_usage, memory_usage);
                true
            }
            None => false,
        }
    }

    /// Select an eligible instance, skipping ids in `exclude` unless nothing
    /// else is eligible
    pub fn select(&self, session: Option<&str>, exclude: &HashSet<String>) -> Option<Arc<Instance>> {
        let eligible: Vec<Arc<Instance>> = self
            .instances()
            .into_iter()
            .filter(|i| i.is_eligible())
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let untried: Vec<Arc<Instance>> = eligible
            .iter()
            .filter(|i| !exclude.contains(i.id()))
            .cloned()
            .collect();
        let candidates = if untried.is_empty() { eligible } else { untried };

        let sticky_session = session.filter(|_| self.config.sticky_sessions);
        if let Some(key) = sticky_session {
            let pinned = self.sessions.get(key).map(|id| id.value().clone());
            if let Some(pinned) = pinned {
                if let Some(instance) = candidates.iter().find(|i| i.id() == pinned) {
                    return Some(Arc::clone(instance));
                }
            }
        }

        let views: Vec<InstanceView> = candidates.iter().map(|i| i.view()).collect();
        let ctx = SelectionContext {
            session,
            max_connections: self.config.max_connections_per_instance,
            reference_latency_ms: self.config.scoring.reference_latency_ms,
        };
        let chosen = candidates.get(self.policy.select(&views, &ctx)?)?;

        if let Some(key) = sticky_session {
            self.sessions.insert(key.to_string(), chosen.id().to_string());
        }
        Some(Arc::clone(chosen))
    }

    /// Next instance for a request, waiting up to `acquire_timeout` for one
    /// to become eligible
    pub async fn next_instance(&self, session: Option<&str>) -> Result<Arc<Instance>> {
        self.wait_for_instance(session, &HashSet::new()).await
    }

    async fn wait_for_instance(
        &self,
        session: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Result<Arc<Instance>> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ConduitError::ShutDown);
            }
            if let Some(instance) = self.select(session, exclude) {
                return Ok(instance);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConduitError::Unavailable(format!(
                    "no eligible instance after waiting {:?}",
                    started.elapsed()
                )));
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Run `f` against selected instances until it succeeds, fails
    /// permanently or `max_attempts` instances were tried
    pub async fn execute_request<F, Fut, R>(&self, session: Option<&str>, mut f: F) -> Result<R>
    where
        F: FnMut(Arc<Instance>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut tried = HashSet::new();
        let mut last_error = None;

        for attempt in 0..attempts {
            let instance = match self.wait_for_instance(session, &tried).await {
                Ok(instance) => instance,
                Err(e) => return Err(last_error.unwrap_or(e)),
            };
            tried.insert(instance.id().to_string());

            let guard = instance.begin_request();
            let started = Instant::now();
            let result = f(Arc::clone(&instance)).await;
            let elapsed = started.elapsed();
            drop(guard);

            match result {
                Ok(value) => {
                    instance.record_success(elapsed);
                    return Ok(value);
                }
                Err(e) => {
                    instance.record_error(&e, elapsed);
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    warn!(
                        instance = %instance.id(),
                        attempt = attempt + 1,
                        error = %e,
                        "request failed on instance"
                    );
                    last_error = Some(ConduitError::most_informative(last_error.take(), e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ConduitError::Unavailable("no instance attempted the request".into())
        }))
    }

    /// Probe every instance once and apply the outcomes
    ///
    /// Every idle connection of an instance's pool is probed with
    /// `health_check_method`; the instance counts as reachable when any probe
    /// succeeds. Instances with no idle connection are skipped this round.
    pub async fn health_check_all(&self) {
        let method = self.config.health_check_method.clone();
        let timeout = self.config.health_check_timeout;
        let threshold = self.config.unhealthy_threshold;

        for instance in self.instances() {
            if instance.is_draining() {
                continue;
            }
            let report = instance
                .pool()
                .health_check(
                    |conn| {
                        let method = method.clone();
                        async move { conn.call(&method, &[]).await.is_ok() }
                    },
                    timeout,
                )
                .await;
            if report.probed == 0 {
                debug!(instance = %instance.id(), "no idle connection to probe");
                continue;
            }
            if let Some(transition) = instance.record_probe(report.healthy > 0, threshold) {
                debug!(instance = %instance.id(), ?transition, "instance health changed");
            }
        }
    }

    /// Run `health_check_all` every `health_check_interval` until cancelled
    pub fn spawn_health_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let balancer = Arc::clone(self);
        let period = self.config.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => balancer.health_check_all().await,
                }
            }
            debug!("health monitor stopped");
        })
    }

    /// Averages over healthy, non-draining instances
    pub fn cluster_metrics(&self) -> ClusterMetrics {
        let active: Vec<Arc<Instance>> = self
            .instances()
            .into_iter()
            .filter(|i| !i.is_draining())
            .collect();
        let healthy: Vec<&Arc<Instance>> = active.iter().filter(|i| i.is_healthy()).collect();

        let mut metrics = ClusterMetrics {
            instances: active.len(),
            healthy_instances: healthy.len(),
            ..ClusterMetrics::default()
        };
        if healthy.is_empty() {
            return metrics;
        }
        let n = healthy.len() as f64;
        for instance in &healthy {
            let (cpu, memory) = instance.resource_usage();
            metrics.avg_cpu += cpu / n;
            metrics.avg_memory += memory / n;
            metrics.avg_response_time_ms += instance.avg_response_time_ms() / n;
        }
        metrics
    }

    /// Healthy, non-draining instance with the lowest utilization
    pub fn least_utilized(&self) -> Option<Arc<Instance>> {
        self.instances()
            .into_iter()
            .filter(|i| !i.is_draining() && i.is_healthy())
            .min_by(|a, b| a.utilization().total_cmp(&b.utilization()))
    }

    pub fn snapshots(&self) -> Vec<InstanceSnapshot> {
        self.instances().iter().map(|i| i.snapshot()).collect()
    }

    /// Stop accepting requests and close every pool
    ///
    /// All pools share one `drain_timeout` window.
    pub async fn close(&self, drain_timeout: Duration) -> Vec<(String, DrainReport)> {
        self.closed.store(true, Ordering::Release);
        let instances = self.instances();
        for instance in &instances {
            instance.set_draining();
        }
        let closes = instances.iter().map(|instance| async move {
            (
                instance.id().to_string(),
                instance.pool().close(drain_timeout).await,
            )
        });
        futures::future::join_all(closes).await
    }
}
