//! Instance autoscaling
//!
//! Every evaluation averages CPU, memory and response time over healthy
//! instances and moves the instance count by at most one. Scale-up and
//! scale-down have independent cooldowns, each measured from the last action
//! in the same direction.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ClusterMetrics, LoadBalancer};
use crate::error::Result;

/// Autoscaler thresholds and timing
#[derive(Debug, Clone)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    pub min_instances: usize,
    pub max_instances: usize,
    /// Average CPU percentage above which to scale up
    pub target_cpu: f64,
    /// Average memory percentage above which to scale up
    pub target_memory: f64,
    pub target_response_time_ms: f64,
    /// Scale down when every metric is below `target x scale_down_threshold`
    pub scale_down_threshold: f64,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    /// Evaluation period
    pub interval: Duration,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_instances: 1,
            max_instances: 10,
            target_cpu: 70.0,
            target_memory: 80.0,
            target_response_time_ms: 1000.0,
            scale_down_threshold: 0.5,
            scale_up_cooldown: Duration::from_secs(300),
            scale_down_cooldown: Duration::from_secs(600),
            interval: Duration::from_secs(60),
        }
    }
}

/// What one evaluation concluded
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingDecision {
    ScaleUp { reason: String },
    ScaleDown { reason: String },
    Hold { reason: String },
}

impl ScalingDecision {
    fn hold(reason: impl Into<String>) -> Self {
        ScalingDecision::Hold {
            reason: reason.into(),
        }
    }
}

/// What one autoscaling pass actually did
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingAction {
    Added { instance_id: String, endpoint: String },
    Removed { instance_id: String, endpoint: String },
    Unchanged { reason: String },
}

/// Timestamps of the last action in each direction
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalingHistory {
    pub last_scale_up: Option<Instant>,
    pub last_scale_down: Option<Instant>,
}

/// Source of endpoints for new instances
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Endpoint for one more instance, or `None` when nothing is available
    async fn provision(&self) -> Result<Option<String>>;

    /// Give back the endpoint of a removed instance
    async fn release(&self, _endpoint: &str) {}
}

/// Hands out a fixed list of standby endpoints
#[derive(Debug, Default)]
pub struct StaticProvisioner {
    standby: Mutex<VecDeque<String>>,
}

impl StaticProvisioner {
    pub fn new(standby: impl IntoIterator<Item = String>) -> Self {
        Self {
            standby: Mutex::new(standby.into_iter().collect()),
        }
    }

    pub fn available(&self) -> usize {
        self.standby
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn provision(&self) -> Result<Option<String>> {
        Ok(self
            .standby
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front())
    }

    async fn release(&self, endpoint: &str) {
        self.standby
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(endpoint.to_string());
    }
}

/// Autoscaling counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoscalerStats {
    pub evaluations: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
}

pub struct Autoscaler {
    config: AutoscaleConfig,
    provisioner: Box<dyn Provisioner>,
    history: tokio::sync::Mutex<ScalingHistory>,
    evaluations: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
}

impl Autoscaler {
    pub fn new(config: AutoscaleConfig, provisioner: Box<dyn Provisioner>) -> Self {
        Self {
            config,
            provisioner,
            history: tokio::sync::Mutex::new(ScalingHistory::default()),
            evaluations: AtomicU64::new(0),
            scale_ups: AtomicU64::new(0),
            scale_downs: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AutoscaleConfig {
        &self.config
    }

    /// Decide the next step from cluster metrics alone
    pub fn evaluate(
        &self,
        metrics: &ClusterMetrics,
        history: &ScalingHistory,
        now: Instant,
    ) -> ScalingDecision {
        let config = &self.config;
        if metrics.healthy_instances == 0 {
            return ScalingDecision::hold("no healthy instances to measure");
        }

        let over = if metrics.avg_cpu > config.target_cpu {
            Some(format!("cpu {:.1}% above {:.1}%", metrics.avg_cpu, config.target_cpu))
        } else if metrics.avg_memory > config.target_memory {
            Some(format!(
                "memory {:.1}% above {:.1}%",
                metrics.avg_memory, config.target_memory
            ))
        } else if metrics.avg_response_time_ms > config.target_response_time_ms {
            Some(format!(
                "response time {:.0}ms above {:.0}ms",
                metrics.avg_response_time_ms, config.target_response_time_ms
            ))
        } else {
            None
        };

        if let Some(reason) = over {
            if metrics.instances >= config.max_instances {
                return ScalingDecision::hold(format!("{}, already at max instances", reason));
            }
            if cooling_down(history.last_scale_up, config.scale_up_cooldown, now) {
                return ScalingDecision::hold(format!("{}, scale-up cooling down", reason));
            }
            return ScalingDecision::ScaleUp { reason };
        }

        let factor = config.scale_down_threshold;
        let under = metrics.avg_cpu < config.target_cpu * factor
            && metrics.avg_memory < config.target_memory * factor
            && metrics.avg_response_time_ms < config.target_response_time_ms * factor;
        if under {
            let reason = format!(
                "cpu {:.1}%, memory {:.1}%, response time {:.0}ms all below scale-down thresholds",
                metrics.avg_cpu, metrics.avg_memory, metrics.avg_response_time_ms
            );
            if metrics.instances <= config.min_instances {
                return ScalingDecision::hold(format!("{}, already at min instances", reason));
            }
            if cooling_down(history.last_scale_down, config.scale_down_cooldown, now) {
                return ScalingDecision::hold(format!("{}, scale-down cooling down", reason));
            }
            return ScalingDecision::ScaleDown { reason };
        }

        ScalingDecision::hold("within targets")
    }

    /// Evaluate once and apply the decision to `balancer`
    ///
    /// A pass that starts while another is still running does nothing.
    pub async fn run_once(&self, balancer: &LoadBalancer) -> Result<ScalingAction> {
        let Ok(mut history) = self.history.try_lock() else {
            return Ok(ScalingAction::Unchanged {
                reason: "evaluation already running".into(),
            });
        };
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let metrics = balancer.cluster_metrics();
        let decision = self.evaluate(&metrics, &history, Instant::now());
        debug!(?metrics, ?decision, "autoscale evaluation");

        match decision {
            ScalingDecision::Hold { reason } => Ok(ScalingAction::Unchanged { reason }),
            ScalingDecision::ScaleUp { reason } => {
                let Some(endpoint) = self.provisioner.provision().await? else {
                    warn!(%reason, "scale-up wanted but no endpoint could be provisioned");
                    return Ok(ScalingAction::Unchanged {
                        reason: "no endpoint available to provision".into(),
                    });
                };
                let instance = match balancer.register(&endpoint, 1).await {
                    Ok(instance) => instance,
                    Err(e) => {
                        self.provisioner.release(&endpoint).await;
                        return Err(e);
                    }
                };
                history.last_scale_up = Some(Instant::now());
                self.scale_ups.fetch_add(1, Ordering::Relaxed);
                info!(
                    instance = %instance.id(),
                    endpoint = %endpoint,
                    instances = metrics.instances + 1,
                    %reason,
                    "scaled up"
                );
                Ok(ScalingAction::Added {
                    instance_id: instance.id().to_string(),
                    endpoint,
                })
            }
            ScalingDecision::ScaleDown { reason } => {
                let Some(victim) = balancer.least_utilized() else {
                    return Ok(ScalingAction::Unchanged {
                        reason: "no healthy instance to remove".into(),
                    });
                };
                balancer.deregister(victim.id()).await?;
                self.provisioner.release(victim.endpoint()).await;
                history.last_scale_down = Some(Instant::now());
                self.scale_downs.fetch_add(1, Ordering::Relaxed);
                info!(
                    instance = %victim.id(),
                    endpoint = %victim.endpoint(),
                    instances = metrics.instances.saturating_sub(1),
                    %reason,
                    "scaled down"
                );
                Ok(ScalingAction::Removed {
                    instance_id: victim.id().to_string(),
                    endpoint: victim.endpoint().to_string(),
                })
            }
        }
    }

    pub fn stats(&self) -> AutoscalerStats {
        AutoscalerStats {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            scale_ups: self.scale_ups.load(Ordering::Relaxed),
            scale_downs: self.scale_downs.load(Ordering::Relaxed),
        }
    }
}

fn cooling_down(last: Option<Instant>, cooldown: Duration, now: Instant) -> bool {
    last.is_some_and(|at| now.saturating_duration_since(at) < cooldown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::BalancerConfig;
    use crate::transport::{Connection, Transport, TransportFactory};
    use conduit_core_resilience::{ConnectionFactory, PoolConfig, ResilienceError};
    use serde_json::Value;
    use std::sync::Arc;

    fn metrics(instances: usize, cpu: f64, memory: f64, rt: f64) -> ClusterMetrics {
        ClusterMetrics {
            instances,
            healthy_instances: instances,
            avg_cpu: cpu,
            avg_memory: memory,
            avg_response_time_ms: rt,
        }
    }

    fn autoscaler(min: usize, max: usize) -> Autoscaler {
        Autoscaler::new(
            AutoscaleConfig {
                enabled: true,
                min_instances: min,
                max_instances: max,
                ..AutoscaleConfig::default()
            },
            Box::new(StaticProvisioner::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_on_high_cpu_bounded_by_max() {
        let scaler = autoscaler(1, 3);
        let now = Instant::now();
        let history = ScalingHistory::default();

        assert!(matches!(
            scaler.evaluate(&metrics(2, 95.0, 40.0, 100.0), &history, now),
            ScalingDecision::ScaleUp { .. }
        ));
        assert!(matches!(
            scaler.evaluate(&metrics(3, 95.0, 40.0, 100.0), &history, now),
            ScalingDecision::Hold { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_on_low_load_bounded_by_min() {
        let scaler = autoscaler(1, 5);
        let now = Instant::now();
        let history = ScalingHistory::default();

        assert!(matches!(
            scaler.evaluate(&metrics(2, 10.0, 10.0, 50.0), &history, now),
            ScalingDecision::ScaleDown { .. }
        ));
        assert!(matches!(
            scaler.evaluate(&metrics(1, 10.0, 10.0, 50.0), &history, now),
            ScalingDecision::Hold { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_responses_trigger_scale_up() {
        let scaler = autoscaler(1, 5);
        let decision = scaler.evaluate(
            &metrics(2, 10.0, 10.0, 2500.0),
            &ScalingHistory::default(),
            Instant::now(),
        );
        assert!(matches!(decision, ScalingDecision::ScaleUp { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_between_thresholds_holds() {
        let scaler = autoscaler(1, 5);
        // cpu 50 is under target 70 but not under 35
        let decision = scaler.evaluate(
            &metrics(2, 50.0, 10.0, 50.0),
            &ScalingHistory::default(),
            Instant::now(),
        );
        assert_eq!(decision, ScalingDecision::hold("within targets"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldowns_are_per_direction() {
        let scaler = autoscaler(1, 5);
        let start = Instant::now();
        let history = ScalingHistory {
            last_scale_up: Some(start),
            last_scale_down: None,
        };

        // Scale-up blocked, scale-down unaffected
        assert!(matches!(
            scaler.evaluate(&metrics(2, 95.0, 10.0, 50.0), &history, start),
            ScalingDecision::Hold { .. }
        ));
        assert!(matches!(
            scaler.evaluate(&metrics(2, 5.0, 5.0, 50.0), &history, start),
            ScalingDecision::ScaleDown { .. }
        ));

        let later = start + Duration::from_secs(301);
        assert!(matches!(
            scaler.evaluate(&metrics(2, 95.0, 10.0, 50.0), &history, later),
            ScalingDecision::ScaleUp { .. }
        ));
    }

    struct NullTransport(String);

    #[async_trait]
    impl Transport for NullTransport {
        async fn call(&self, _method: &str, _params: &[Value]) -> Result<Value> {
            Ok(Value::Null)
        }

        fn endpoint(&self) -> &str {
            &self.0
        }
    }

    struct NullFactory;

    #[async_trait]
    impl ConnectionFactory<Connection> for NullFactory {
        async fn create(&self, endpoint: &str) -> std::result::Result<Connection, ResilienceError> {
            Ok(Arc::new(NullTransport(endpoint.to_string())))
        }
    }

    async fn balancer(endpoints: &[&str]) -> LoadBalancer {
        let balancer = LoadBalancer::new(
            BalancerConfig {
                drain_timeout: Duration::from_millis(50),
                ..BalancerConfig::default()
            },
            PoolConfig {
                min_size: 1,
                max_size: 2,
                ..PoolConfig::default()
            },
            Arc::new(NullFactory) as Arc<TransportFactory>,
        );
        for endpoint in endpoints {
            balancer.register(endpoint, 1).await.unwrap();
        }
        balancer
    }

    #[tokio::test]
    async fn test_run_once_adds_standby_instance() {
        let balancer = balancer(&["mock://a"]).await;
        let scaler = Autoscaler::new(
            AutoscaleConfig {
                enabled: true,
                ..AutoscaleConfig::default()
            },
            Box::new(StaticProvisioner::new(vec!["mock://standby".to_string()])),
        );
        let id = balancer.instances()[0].id().to_string();
        balancer.report_resource_usage(&id, 95.0, 30.0);

        let action = scaler.run_once(&balancer).await.unwrap();
        assert!(matches!(
            action,
            ScalingAction::Added { ref endpoint, .. } if endpoint == "mock://standby"
        ));
        assert_eq!(balancer.instance_count(), 2);

        // Still overloaded, but the scale-up cooldown applies
        for instance in balancer.instances() {
            balancer.report_resource_usage(instance.id(), 95.0, 30.0);
        }
        let action = scaler.run_once(&balancer).await.unwrap();
        assert!(matches!(action, ScalingAction::Unchanged { .. }));
        assert_eq!(scaler.stats().scale_ups, 1);
        assert_eq!(scaler.stats().evaluations, 2);
    }

    #[tokio::test]
    async fn test_run_once_without_standby_is_unchanged() {
        let balancer = balancer(&["mock://a"]).await;
        let scaler = autoscaler(1, 5);
        let id = balancer.instances()[0].id().to_string();
        balancer.report_resource_usage(&id, 95.0, 30.0);

        let action = scaler.run_once(&balancer).await.unwrap();
        assert!(matches!(action, ScalingAction::Unchanged { .. }));
        assert_eq!(balancer.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_run_once_removes_least_utilized() {
        let balancer = balancer(&["mock://a", "mock://b"]).await;
        let provisioner = Arc::new(StaticProvisioner::default());
        let scaler = Autoscaler::new(
            AutoscaleConfig {
                enabled: true,
                ..AutoscaleConfig::default()
            },
            Box::new(SharedProvisioner(Arc::clone(&provisioner))),
        );
        let ids: Vec<String> = balancer.instances().iter().map(|i| i.id().to_string()).collect();
        balancer.report_resource_usage(&ids[0], 20.0, 20.0);
        balancer.report_resource_usage(&ids[1], 5.0, 10.0);

        let action = scaler.run_once(&balancer).await.unwrap();
        assert_eq!(
            action,
            ScalingAction::Removed {
                instance_id: ids[1].clone(),
                endpoint: "mock://b".into(),
            }
        );
        assert_eq!(balancer.instance_count(), 1);
        assert_eq!(provisioner.available(), 1);
    }

    struct SharedProvisioner(Arc<StaticProvisioner>);

    #[async_trait]
    impl Provisioner for SharedProvisioner {
        async fn provision(&self) -> Result<Option<String>> {
            self.0.provision().await
        }

        async fn release(&self, endpoint: &str) {
            self.0.release(endpoint).await
        }
    }
}
