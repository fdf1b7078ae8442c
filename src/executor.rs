/*!
 * The `Conduit` execution facade
 *
 * A call flows through the response cache, the coalescer, the priority
 * scheduler, the load balancer, the chosen instance's connection pool and
 * finally the retry controller. The leader of a coalesced call owns the
 * execution and stores its result in the cache; every waiter receives a
 * clone of the same outcome.
 *
 * Periodic work (cache sweeps, health probes, autoscaling) runs on tasks
 * tied to a cancellation token that `shutdown()` cancels.
 */

use conduit_core_resilience::{CacheStats, ResponseCache};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::balancer::autoscaler::{Autoscaler, AutoscalerStats, ScalingAction, StaticProvisioner};
use crate::balancer::LoadBalancer;
use crate::cache_key::cache_key;
use crate::coalescer::{Coalescer, CoalescerStats};
use crate::codec::Codec;
use crate::config::ConduitConfig;
use crate::error::{ConduitError, Result};
use crate::metrics::{Gauges, InstanceDetail, MetricsSnapshot, RequestMetrics};
use crate::retry::{execute_with_retry, RetryConfig};
use crate::scheduler::{Priority, PriorityScheduler, SchedulerStats};
use crate::transport::{Connection, HttpTransportFactory, TransportFactory};

/// Per-call options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallOptions {
    /// Serve from and store into the response cache
    pub cacheable: bool,
    /// Cache TTL for this result; the cache default when unset
    #[serde(with = "optional_millis")]
    pub cache_ttl: Option<Duration>,
    pub priority: Priority,
    /// Upper bound on the whole call, queueing included
    #[serde(with = "optional_millis")]
    pub deadline: Option<Duration>,
    /// Session key for sticky routing
    pub session: Option<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            cacheable: true,
            cache_ttl: None,
            priority: Priority::Normal,
            deadline: None,
            session: None,
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// One entry of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub options: CallOptions,
}

impl CallSpec {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            options: CallOptions::default(),
        }
    }
}

/// Outcome of `warmup()`
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmupReport {
    pub succeeded: Vec<String>,
    /// Method and error message
    pub failed: Vec<(String, String)>,
}

/// Outcome of `shutdown()`
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Every connection was released before the drain deadline
    pub drained: bool,
    pub closed_connections: usize,
    /// Connections closed while still checked out
    pub forced_connections: usize,
    pub elapsed_ms: u64,
    pub final_metrics: MetricsSnapshot,
}

struct ConduitInner {
    config: ConduitConfig,
    balancer: Arc<LoadBalancer>,
    cache: Arc<ResponseCache<Value>>,
    coalescer: Coalescer<Value>,
    scheduler: Option<PriorityScheduler>,
    autoscaler: Option<Arc<Autoscaler>>,
    retry: RetryConfig,
    metrics: RequestMetrics,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Drop for ConduitInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a running execution layer; cheap to clone
#[derive(Clone)]
pub struct Conduit {
    inner: Arc<ConduitInner>,
}

impl Conduit {
    /// Build the layer over `factory` and register the configured endpoints
    pub async fn connect(config: ConduitConfig, factory: Arc<TransportFactory>) -> Result<Self> {
        config.validate()?;

        let balancer = Arc::new(LoadBalancer::new(
            config.balancer_config(),
            config.pool_config(),
            factory,
        ));
        for endpoint in config.resolved_endpoints() {
            balancer
                .register(&endpoint, config.weight_for(&endpoint))
                .await?;
        }

        let scheduler = config
            .scheduler
            .enabled
            .then(|| PriorityScheduler::new(scheduler_capacity(&config, &balancer)));
        let autoscaler = config.autoscale.enabled.then(|| {
            Arc::new(Autoscaler::new(
                config.autoscale_config(),
                Box::new(StaticProvisioner::new(config.standby_endpoints.clone())),
            ))
        });

        let inner = Arc::new(ConduitInner {
            balancer,
            cache: Arc::new(ResponseCache::new(config.cache_config())),
            coalescer: Coalescer::new(),
            scheduler,
            autoscaler,
            retry: config.retry_config(),
            metrics: RequestMetrics::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            config,
        });

        let mut tasks = vec![
            spawn_cache_sweeper(
                Arc::clone(&inner.cache),
                inner.config.cache_config().sweep_interval,
                inner.cancel.child_token(),
            ),
            inner
                .balancer
                .spawn_health_monitor(inner.cancel.child_token()),
        ];
        if let Some(autoscaler) = &inner.autoscaler {
            tasks.push(spawn_autoscaler(
                Arc::clone(autoscaler),
                Arc::clone(&inner.balancer),
                inner.scheduler.clone().filter(|_| inner.config.scheduler.max_concurrency == 0),
                inner.cancel.child_token(),
            ));
        }
        *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;

        info!(
            network = inner.config.network.as_str(),
            instances = inner.balancer.instance_count(),
            strategy = inner.balancer.policy_name(),
            scheduler = inner.scheduler.is_some(),
            autoscale = inner.autoscaler.is_some(),
            "conduit connected"
        );
        Ok(Self { inner })
    }

    /// `connect` with JSON-RPC over HTTP connections
    pub async fn connect_http(config: ConduitConfig) -> Result<Self> {
        Self::connect(config, Arc::new(HttpTransportFactory::default())).await
    }

    pub fn config(&self) -> &ConduitConfig {
        &self.inner.config
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.inner.balancer
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Execute `method` with `params` and return the raw result
    pub async fn execute(
        &self,
        method: &str,
        params: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value> {
        if self.is_shut_down() {
            return Err(ConduitError::ShutDown);
        }
        let inner = &self.inner;
        inner.metrics.record_request();

        let key = cache_key(method, &params);
        if options.cacheable {
            if let Some(hit) = inner.cache.get(&key) {
                inner.metrics.record_cache_hit();
                debug!(method, "cache hit");
                return Ok(hit);
            }
            inner.metrics.record_cache_miss();
        }

        let budget = options.deadline;
        let deadline = budget.map(|d| Instant::now() + d);
        let leader = Arc::clone(inner);
        let method_owned = method.to_string();
        let store_key = key.clone();
        let outcome = inner.coalescer.execute_deduped(&key, move || {
            leader.execute_uncached(method_owned, params, options, deadline, store_key)
        });

        // Waiters keep their own deadline, whoever leads the execution
        match (deadline, budget) {
            (Some(at), Some(budget)) => tokio::time::timeout_at(at, outcome)
                .await
                .unwrap_or_else(|_| Err(with_context(ConduitError::Timeout(budget), budget))),
            _ => outcome.await,
        }
    }

    /// Execute and decode the result with `codec`
    pub async fn execute_with_codec<C: Codec>(
        &self,
        codec: &C,
        method: &str,
        params: Vec<Value>,
        options: CallOptions,
    ) -> Result<C::Output> {
        let raw = self.execute(method, params, options).await?;
        codec.decode(method, &raw)
    }

    /// Execute many calls; results come back in input order
    ///
    /// Identical `(method, params)` entries run once and share the outcome,
    /// with the options of their first occurrence. Concurrency is bounded by
    /// the total pool capacity.
    pub async fn batch_execute(&self, specs: Vec<CallSpec>) -> Vec<Result<Value>> {
        let mut unique: Vec<CallSpec> = Vec::new();
        let mut slots: HashMap<String, usize> = HashMap::new();
        let mut positions = Vec::with_capacity(specs.len());

        for spec in specs {
            let key = cache_key(&spec.method, &spec.params);
            let slot = match slots.entry(key) {
                Entry::Occupied(entry) => *entry.get(),
                Entry::Vacant(entry) => {
                    unique.push(spec);
                    *entry.insert(unique.len() - 1)
                }
            };
            positions.push(slot);
        }

        let concurrency = self.inner.balancer.total_capacity().max(1);
        debug!(
            calls = positions.len(),
            unique = unique.len(),
            concurrency,
            "executing batch"
        );
        let results: Vec<Result<Value>> = stream::iter(unique)
            .map(|spec| async move {
                let CallSpec {
                    method,
                    params,
                    options,
                } = spec;
                self.execute(&method, params, options).await
            })
            .buffered(concurrency)
            .collect()
            .await;

        positions
            .into_iter()
            .map(|slot| results[slot].clone())
            .collect()
    }

    /// Call every configured warmup method once, populating the cache
    pub async fn warmup(&self) -> WarmupReport {
        let methods = self.inner.config.warmup_methods.clone();
        let outcomes = futures::future::join_all(methods.iter().map(|method| async move {
            (
                method.clone(),
                self.execute(method, Vec::new(), CallOptions::default()).await,
            )
        }))
        .await;

        let mut report = WarmupReport::default();
        for (method, outcome) in outcomes {
            match outcome {
                Ok(_) => report.succeeded.push(method),
                Err(e) => {
                    warn!(method = %method, error = %e, "warmup call failed");
                    report.failed.push((method, e.to_string()));
                }
            }
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "warmup complete"
        );
        report
    }

    /// Drop a cached result
    pub fn invalidate(&self, method: &str, params: &[Value]) -> bool {
        self.inner.cache.invalidate(&cache_key(method, params))
    }

    /// Store externally observed CPU and memory usage of an instance
    pub fn report_resource_usage(&self, instance_id: &str, cpu: f64, memory: f64) -> bool {
        self.inner
            .balancer
            .report_resource_usage(instance_id, cpu, memory)
    }

    /// Run one autoscaling pass now
    pub async fn autoscale_now(&self) -> Result<ScalingAction> {
        let autoscaler = self
            .inner
            .autoscaler
            .as_ref()
            .ok_or_else(|| ConduitError::Config("autoscaling is disabled".into()))?;
        let action = autoscaler.run_once(&self.inner.balancer).await?;
        if !matches!(action, ScalingAction::Unchanged { .. })
            && self.inner.config.scheduler.max_concurrency == 0
        {
            if let Some(scheduler) = &self.inner.scheduler {
                scheduler.resize(self.inner.balancer.total_capacity());
            }
        }
        Ok(action)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let cluster = inner.balancer.cluster_metrics();
        let coalescer = inner.coalescer.stats();
        inner.metrics.snapshot(Gauges {
            connection_utilization: inner.balancer.connection_utilization(),
            coalesced_requests: coalescer.coalesced,
            in_flight: coalescer.in_flight,
            queued: inner
                .scheduler
                .as_ref()
                .map(|s| s.stats().queued)
                .unwrap_or(0),
            instances: cluster.instances,
            healthy_instances: cluster.healthy_instances,
        })
    }

    /// Per-instance listing with nested per-connection detail
    pub fn details(&self) -> Vec<InstanceDetail> {
        let now = chrono::Utc::now();
        self.inner
            .balancer
            .snapshots()
            .iter()
            .map(|snapshot| InstanceDetail::from_snapshot(snapshot, now))
            .collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn coalescer_stats(&self) -> CoalescerStats {
        self.inner.coalescer.stats()
    }

    pub fn scheduler_stats(&self) -> Option<SchedulerStats> {
        self.inner.scheduler.as_ref().map(|s| s.stats())
    }

    pub fn autoscaler_stats(&self) -> Option<AutoscalerStats> {
        self.inner.autoscaler.as_ref().map(|a| a.stats())
    }

    /// Stop the layer
    ///
    /// Cancels periodic tasks, rejects new calls, drops calls still queued,
    /// then waits up to `drain_timeout` for checked-out connections before
    /// force-closing them. A second call returns immediately.
    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return ShutdownReport {
                drained: true,
                closed_connections: 0,
                forced_connections: 0,
                elapsed_ms: 0,
                final_metrics: self.metrics(),
            };
        }
        let drain_timeout = inner.config.drain_timeout();
        info!(?drain_timeout, "shutting down");

        inner.cancel.cancel();
        if let Some(scheduler) = &inner.scheduler {
            scheduler.close();
        }

        let tasks = std::mem::take(&mut *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for mut task in tasks {
            if tokio::time::timeout(drain_timeout, &mut task).await.is_err() {
                warn!("periodic task did not stop in time, aborting");
                task.abort();
            }
        }

        let reports = inner.balancer.close(drain_timeout).await;
        let drained = reports.iter().all(|(_, r)| r.drained);
        let closed_connections = reports.iter().map(|(_, r)| r.closed).sum();
        let forced_connections = reports.iter().map(|(_, r)| r.forced).sum();
        inner.cache.clear();

        let final_metrics = self.metrics();
        if drained {
            info!(closed_connections, "conduit shut down");
        } else {
            warn!(
                closed_connections,
                forced_connections, "drain timeout exceeded, closed busy connections"
            );
        }
        info!(target: "conduit::metrics", "{}", final_metrics.format_summary());

        ShutdownReport {
            drained,
            closed_connections,
            forced_connections,
            elapsed_ms: started.elapsed().as_millis() as u64,
            final_metrics,
        }
    }
}

impl ConduitInner {
    /// Leader side of a coalesced call
    async fn execute_uncached(
        self: Arc<Self>,
        method: String,
        params: Vec<Value>,
        options: CallOptions,
        deadline: Option<Instant>,
        key: String,
    ) -> Result<Value> {
        let started = Instant::now();
        let dispatch = Arc::clone(&self).dispatch(method.clone(), params, options.clone(), deadline);
        let outcome = match deadline {
            Some(at) => tokio::time::timeout_at(at, dispatch)
                .await
                .unwrap_or_else(|_| Err(ConduitError::Timeout(at.saturating_duration_since(started)))),
            None => dispatch.await,
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(value) => {
                self.metrics.record_success(elapsed);
                if options.cacheable {
                    self.cache.set(key, value.clone(), options.cache_ttl);
                }
                Ok(value)
            }
            Err(e) => {
                let e = with_context(e, elapsed);
                self.metrics.record_failure(&e, elapsed);
                warn!(method = %method, error = %e, "request failed");
                Err(e)
            }
        }
    }

    /// Route through the scheduler when enabled
    async fn dispatch(
        self: Arc<Self>,
        method: String,
        params: Vec<Value>,
        options: CallOptions,
        deadline: Option<Instant>,
    ) -> Result<Value> {
        let priority = options.priority;
        let issued = Instant::now();
        let inner = Arc::clone(&self);
        let job = async move {
            let route = inner.route(&method, &params, options.session.as_deref());
            match deadline {
                // The job itself stops at the deadline so its connection is
                // released even though the waiter is gone
                Some(at) => tokio::time::timeout_at(at, route)
                    .await
                    .unwrap_or_else(|_| Err(ConduitError::Timeout(at.saturating_duration_since(issued)))),
                None => route.await,
            }
        };
        match &self.scheduler {
            Some(scheduler) => scheduler.run(priority, job).await?,
            None => job.await,
        }
    }

    /// Balancer, pool and retry controller for one call
    async fn route(&self, method: &str, params: &[Value], session: Option<&str>) -> Result<Value> {
        let retry = &self.retry;
        let acquire_attempts = self.config.pool.acquire_attempts.max(1);

        self.balancer
            .execute_request(session, |instance| async move {
                let mut last_error = None;
                for _ in 0..acquire_attempts {
                    let conn = match instance.pool().acquire().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            let e = ConduitError::from(e);
                            if !e.is_retryable() {
                                return Err(e);
                            }
                            last_error = Some(ConduitError::most_informative(last_error.take(), e));
                            continue;
                        }
                    };
                    let outcome = execute_with_retry(
                        &conn,
                        retry,
                        retry.max_attempts,
                        retry.base_timeout,
                        |transport: Connection| async move { transport.call(method, params).await },
                    )
                    .await;
                    match outcome {
                        Err(e) if matches!(e.root_cause(), ConduitError::CircuitOpen(_)) => {
                            debug!(instance = %instance.id(), "re-acquiring after circuit opened");
                            last_error = Some(ConduitError::most_informative(last_error.take(), e));
                        }
                        other => return other,
                    }
                }
                Err(last_error.unwrap_or_else(|| {
                    ConduitError::Unavailable(format!("no connection on {}", instance.id()))
                }))
            })
            .await
    }
}

/// Wrap failures that never reached a connection so every execution error
/// carries context
fn with_context(error: ConduitError, elapsed: Duration) -> ConduitError {
    match error {
        ConduitError::Failed { .. } | ConduitError::ShutDown => error,
        cause => ConduitError::Failed {
            endpoint: "none".to_string(),
            attempts: 0,
            elapsed_ms: elapsed.as_millis() as u64,
            cause: Box::new(cause),
        },
    }
}

fn scheduler_capacity(config: &ConduitConfig, balancer: &LoadBalancer) -> usize {
    match config.scheduler.max_concurrency {
        0 => balancer.total_capacity().max(1),
        n => n,
    }
}

fn spawn_cache_sweeper(
    cache: Arc<ResponseCache<Value>>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = cache.sweep();
                    if removed > 0 {
                        debug!(removed, "swept expired cache entries");
                    }
                }
            }
        }
    })
}

fn spawn_autoscaler(
    autoscaler: Arc<Autoscaler>,
    balancer: Arc<LoadBalancer>,
    scheduler: Option<PriorityScheduler>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = autoscaler.config().interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match autoscaler.run_once(&balancer).await {
                    Ok(ScalingAction::Unchanged { reason }) => debug!(%reason, "no scaling"),
                    Ok(action) => {
                        if let Some(scheduler) = &scheduler {
                            scheduler.resize(balancer.total_capacity());
                        }
                        debug!(?action, "scaling applied");
                    }
                    Err(e) => warn!(error = %e, "autoscale pass failed"),
                },
            }
        }
    })
}
