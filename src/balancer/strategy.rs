//! Instance selection strategies
//!
//! Policies choose among the currently eligible instances, seen through
//! point-in-time `InstanceView`s so no instance lock is held while a policy
//! decides. Built-in policies are created from `StrategyKind`; custom ones
//! implement `SelectionPolicy` and are handed to the balancer directly.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::ConduitError;

/// What a policy knows about one eligible instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceView {
    pub id: String,
    pub weight: u32,
    /// Requests currently in flight on the instance
    pub connections: usize,
    pub avg_response_time_ms: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub health_score: f64,
}

/// Request-level inputs to selection
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    /// Session key for affinity-aware policies
    pub session: Option<&'a str>,
    /// Connection count treated as full load
    pub max_connections: usize,
    /// Latency at or below which the latency score is full
    pub reference_latency_ms: f64,
}

/// Core trait for instance selection
pub trait SelectionPolicy: Send + Sync + Debug {
    /// Index into `candidates` of the chosen instance; `None` if empty
    fn select(&self, candidates: &[InstanceView], ctx: &SelectionContext<'_>) -> Option<usize>;

    /// Policy name for logs and metrics
    fn name(&self) -> &'static str;
}

/// Built-in strategies, selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    Hash,
    Random,
    Adaptive,
}

impl StrategyKind {
    pub fn build(&self) -> Arc<dyn SelectionPolicy> {
        match self {
            StrategyKind::RoundRobin => Arc::new(RoundRobinPolicy::default()),
            StrategyKind::WeightedRoundRobin => Arc::new(WeightedRandomPolicy),
            StrategyKind::LeastConnections => Arc::new(LeastConnectionsPolicy),
            StrategyKind::LeastResponseTime => Arc::new(LeastResponseTimePolicy),
            StrategyKind::Hash => Arc::new(HashPolicy::default()),
            StrategyKind::Random => Arc::new(RandomPolicy),
            StrategyKind::Adaptive => Arc::new(AdaptivePolicy::default()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::WeightedRoundRobin => "weighted_round_robin",
            StrategyKind::LeastConnections => "least_connections",
            StrategyKind::LeastResponseTime => "least_response_time",
            StrategyKind::Hash => "hash",
            StrategyKind::Random => "random",
            StrategyKind::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ConduitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").to_ascii_lowercase().as_str() {
            "round_robin" => Ok(StrategyKind::RoundRobin),
            "weighted_round_robin" | "weighted" => Ok(StrategyKind::WeightedRoundRobin),
            "least_connections" => Ok(StrategyKind::LeastConnections),
            "least_response_time" => Ok(StrategyKind::LeastResponseTime),
            "hash" | "ip_hash" => Ok(StrategyKind::Hash),
            "random" => Ok(StrategyKind::Random),
            "adaptive" => Ok(StrategyKind::Adaptive),
            other => Err(ConduitError::Config(format!("unknown strategy '{}'", other))),
        }
    }
}

/// Cycles through the eligible instances
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    counter: AtomicUsize,
}

impl SelectionPolicy for RoundRobinPolicy {
    fn select(&self, candidates: &[InstanceView], _ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Weight-proportional random draw
#[derive(Debug, Default)]
pub struct WeightedRandomPolicy;

impl SelectionPolicy for WeightedRandomPolicy {
    fn select(&self, candidates: &[InstanceView], _ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let total: u64 = candidates.iter().map(|c| u64::from(c.weight.max(1))).sum();
        let mut draw = rand::rng().random_range(0..total);
        for (idx, candidate) in candidates.iter().enumerate() {
            let weight = u64::from(candidate.weight.max(1));
            if draw < weight {
                return Some(idx);
            }
            draw -= weight;
        }
        Some(candidates.len() - 1)
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

/// Fewest requests in flight; ties go to the first candidate
#[derive(Debug, Default)]
pub struct LeastConnectionsPolicy;

impl SelectionPolicy for LeastConnectionsPolicy {
    fn select(&self, candidates: &[InstanceView], _ctx: &SelectionContext<'_>) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.connections)
            .map(|(idx, _)| idx)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// Lowest smoothed latency; instances without samples go first
#[derive(Debug, Default)]
pub struct LeastResponseTimePolicy;

impl SelectionPolicy for LeastResponseTimePolicy {
    fn select(&self, candidates: &[InstanceView], _ctx: &SelectionContext<'_>) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.avg_response_time_ms.total_cmp(&b.avg_response_time_ms))
            .map(|(idx, _)| idx)
    }

    fn name(&self) -> &'static str {
        "least_response_time"
    }
}

/// Stable hash of the session key; round-robin for calls without one
#[derive(Debug, Default)]
pub struct HashPolicy {
    fallback: RoundRobinPolicy,
}

impl SelectionPolicy for HashPolicy {
    fn select(&self, candidates: &[InstanceView], ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match ctx.session {
            Some(session) => Some((session_hash(session) % candidates.len() as u64) as usize),
            None => self.fallback.select(candidates, ctx),
        }
    }

    fn name(&self) -> &'static str {
        "hash"
    }
}

/// Session key digest, identical across processes and builds
pub fn session_hash(session: &str) -> u64 {
    let digest = blake3::hash(session.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// Uniform random choice
#[derive(Debug, Default)]
pub struct RandomPolicy;

impl SelectionPolicy for RandomPolicy {
    fn select(&self, candidates: &[InstanceView], _ctx: &SelectionContext<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::rng().random_range(0..candidates.len()))
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Weighted blend of connection headroom, latency and resource headroom
///
/// `score = w_conn x (1 - connections / max) + w_latency x min(1, ref / avg)
///        + w_resource x (1 - (cpu + memory) / 200)`
#[derive(Debug, Clone)]
pub struct AdaptivePolicy {
    pub connection_weight: f64,
    pub latency_weight: f64,
    pub resource_weight: f64,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            connection_weight: 0.3,
            latency_weight: 0.4,
            resource_weight: 0.3,
        }
    }
}

impl AdaptivePolicy {
    pub fn score(&self, view: &InstanceView, ctx: &SelectionContext<'_>) -> f64 {
        let max = ctx.max_connections.max(1) as f64;
        let connection_headroom = (1.0 - view.connections as f64 / max).max(0.0);
        let latency = if view.avg_response_time_ms <= 0.0 {
            1.0
        } else {
            (ctx.reference_latency_ms / view.avg_response_time_ms).min(1.0)
        };
        let resource_headroom = (1.0 - (view.cpu_usage + view.memory_usage) / 200.0).max(0.0);

        self.connection_weight * connection_headroom
            + self.latency_weight * latency
            + self.resource_weight * resource_headroom
    }
}

impl SelectionPolicy for AdaptivePolicy {
    fn select(&self, candidates: &[InstanceView], ctx: &SelectionContext<'_>) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                // Earlier candidates win ties
                self.score(a, ctx)
                    .total_cmp(&self.score(b, ctx))
                    .then_with(|| ib.cmp(ia))
            })
            .map(|(idx, _)| idx)
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: &str) -> InstanceView {
        InstanceView {
            id: id.to_string(),
            weight: 1,
            connections: 0,
            avg_response_time_ms: 0.0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            health_score: 100.0,
        }
    }

    fn ctx(session: Option<&str>) -> SelectionContext<'_> {
        SelectionContext {
            session,
            max_connections: 10,
            reference_latency_ms: 500.0,
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let policy = RoundRobinPolicy::default();
        let candidates = vec![view("a"), view("b"), view("c")];
        let picks: Vec<_> = (0..6)
            .map(|_| policy.select(&candidates, &ctx(None)).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
        assert!(policy.select(&[], &ctx(None)).is_none());
    }

    #[test]
    fn test_weighted_draw_follows_weights() {
        let policy = WeightedRandomPolicy;
        let mut heavy = view("heavy");
        heavy.weight = 9;
        let candidates = vec![view("light"), heavy];

        let mut counts = [0usize; 2];
        for _ in 0..2000 {
            counts[policy.select(&candidates, &ctx(None)).unwrap()] += 1;
        }
        // Expected 200 / 1800
        assert!(counts[1] > counts[0] * 4);
    }

    #[test]
    fn test_least_connections() {
        let mut busy = view("busy");
        busy.connections = 5;
        let mut idle = view("idle");
        idle.connections = 1;
        let candidates = vec![busy, idle];
        assert_eq!(
            LeastConnectionsPolicy.select(&candidates, &ctx(None)),
            Some(1)
        );
    }

    #[test]
    fn test_least_response_time() {
        let mut slow = view("slow");
        slow.avg_response_time_ms = 900.0;
        let mut fast = view("fast");
        fast.avg_response_time_ms = 40.0;
        assert_eq!(
            LeastResponseTimePolicy.select(&[slow, fast], &ctx(None)),
            Some(1)
        );
    }

    #[test]
    fn test_hash_is_sticky_per_session() {
        let policy = HashPolicy::default();
        let candidates = vec![view("a"), view("b"), view("c"), view("d")];
        let first = policy.select(&candidates, &ctx(Some("wallet-7"))).unwrap();
        for _ in 0..10 {
            assert_eq!(
                policy.select(&candidates, &ctx(Some("wallet-7"))),
                Some(first)
            );
        }
    }

    #[test]
    fn test_session_hash_is_fixed() {
        // First eight bytes of the BLAKE3 digest of the empty input
        assert_eq!(session_hash(""), 0xa6a1_f9f5_b949_13af);
        let candidates = vec![view("a"), view("b"), view("c"), view("d")];
        assert_eq!(HashPolicy::default().select(&candidates, &ctx(Some(""))), Some(3));
    }

    #[test]
    fn test_random_in_range() {
        let candidates = vec![view("a"), view("b")];
        for _ in 0..50 {
            assert!(RandomPolicy.select(&candidates, &ctx(None)).unwrap() < 2);
        }
    }

    #[test]
    fn test_adaptive_prefers_headroom() {
        let policy = AdaptivePolicy::default();
        let mut loaded = view("loaded");
        loaded.connections = 8;
        loaded.avg_response_time_ms = 2000.0;
        loaded.cpu_usage = 90.0;
        loaded.memory_usage = 85.0;
        let fresh = view("fresh");

        assert!((policy.score(&fresh, &ctx(None)) - 1.0).abs() < 1e-9);
        // 0.3 x 0.2 + 0.4 x 0.25 + 0.3 x 0.125
        assert!((policy.score(&loaded, &ctx(None)) - 0.1975).abs() < 1e-9);
        assert_eq!(policy.select(&[loaded, fresh], &ctx(None)), Some(1));
    }

    #[test]
    fn test_adaptive_ties_go_to_first() {
        let policy = AdaptivePolicy::default();
        assert_eq!(policy.select(&[view("a"), view("b")], &ctx(None)), Some(0));
    }

    #[test]
    fn test_strategy_kind_builds_named_policy() {
        for kind in [
            StrategyKind::RoundRobin,
            StrategyKind::WeightedRoundRobin,
            StrategyKind::LeastConnections,
            StrategyKind::LeastResponseTime,
            StrategyKind::Hash,
            StrategyKind::Random,
            StrategyKind::Adaptive,
        ] {
            assert_eq!(kind.build().name(), kind.as_str());
            assert_eq!(kind.as_str().parse::<StrategyKind>().unwrap(), kind);
        }
    }
}
