/*!
 * Request metrics and detail listings
 */

use chrono::{DateTime, Utc};
use conduit_core_resilience::{CircuitState, ConnectionSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::balancer::InstanceSnapshot;
use crate::error::{ConduitError, ErrorCategory};

/// Thread-safe counters for the execution path
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    inner: Arc<RequestMetricsInner>,
}

#[derive(Debug)]
struct RequestMetricsInner {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    // Executions that reached the balancer
    successful_executions: AtomicU64,
    failed_executions: AtomicU64,
    response_time_us: AtomicU64,

    // Error categorization
    capacity_errors: AtomicU64,
    timeout_errors: AtomicU64,
    remote_errors: AtomicU64,
    isolation_errors: AtomicU64,
    network_errors: AtomicU64,
    codec_errors: AtomicU64,
    other_errors: AtomicU64,

    start_time: Instant,
}

/// Point-in-time gauges supplied by the components that own them
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Gauges {
    pub connection_utilization: f64,
    pub coalesced_requests: u64,
    pub in_flight: usize,
    pub queued: usize,
    pub instances: usize,
    pub healthy_instances: usize,
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RequestMetricsInner {
                total_requests: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                successful_executions: AtomicU64::new(0),
                failed_executions: AtomicU64::new(0),
                response_time_us: AtomicU64::new(0),
                capacity_errors: AtomicU64::new(0),
                timeout_errors: AtomicU64::new(0),
                remote_errors: AtomicU64::new(0),
                isolation_errors: AtomicU64::new(0),
                network_errors: AtomicU64::new(0),
                codec_errors: AtomicU64::new(0),
                other_errors: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    /// Count a call entering the layer
    pub fn record_request(&self) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed execution
    pub fn record_success(&self, elapsed: Duration) {
        self.inner
            .successful_executions
            .fetch_add(1, Ordering::Relaxed);
        self.add_response_time(elapsed);
    }

    /// Record a failed execution
    pub fn record_failure(&self, error: &ConduitError, elapsed: Duration) {
        self.inner.failed_executions.fetch_add(1, Ordering::Relaxed);
        self.add_response_time(elapsed);

        let counter = match error.category() {
            ErrorCategory::Capacity => &self.inner.capacity_errors,
            ErrorCategory::Timeout => &self.inner.timeout_errors,
            ErrorCategory::Remote => &self.inner.remote_errors,
            ErrorCategory::Isolation => &self.inner.isolation_errors,
            ErrorCategory::Network => &self.inner.network_errors,
            ErrorCategory::Codec => &self.inner.codec_errors,
            _ => &self.inner.other_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add_response_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.inner
            .response_time_us
            .fetch_add(micros, Ordering::Relaxed);
    }

    /// Combine counters with the supplied gauges
    pub fn snapshot(&self, gauges: Gauges) -> MetricsSnapshot {
        let successful = self.inner.successful_executions.load(Ordering::Relaxed);
        let failed = self.inner.failed_executions.load(Ordering::Relaxed);
        let executions = successful + failed;
        let response_time_us = self.inner.response_time_us.load(Ordering::Relaxed);

        let (avg_response_time_ms, error_rate) = if executions == 0 {
            (0.0, 0.0)
        } else {
            (
                response_time_us as f64 / 1000.0 / executions as f64,
                failed as f64 / executions as f64,
            )
        };

        MetricsSnapshot {
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.cache_misses.load(Ordering::Relaxed),
            avg_response_time_ms,
            error_rate,
            connection_utilization: gauges.connection_utilization,
            coalesced_requests: gauges.coalesced_requests,
            successful_executions: successful,
            failed_executions: failed,
            errors: ErrorBreakdown {
                capacity: self.inner.capacity_errors.load(Ordering::Relaxed),
                timeout: self.inner.timeout_errors.load(Ordering::Relaxed),
                remote: self.inner.remote_errors.load(Ordering::Relaxed),
                isolation: self.inner.isolation_errors.load(Ordering::Relaxed),
                network: self.inner.network_errors.load(Ordering::Relaxed),
                codec: self.inner.codec_errors.load(Ordering::Relaxed),
                other: self.inner.other_errors.load(Ordering::Relaxed),
            },
            in_flight: gauges.in_flight,
            queued: gauges.queued,
            instances: gauges.instances,
            healthy_instances: gauges.healthy_instances,
            uptime_secs: self.inner.start_time.elapsed().as_secs(),
            timestamp: Utc::now(),
        }
    }
}

/// Failed executions per error category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBreakdown {
    pub capacity: u64,
    pub timeout: u64,
    pub remote: u64,
    pub isolation: u64,
    pub network: u64,
    pub codec: u64,
    pub other: u64,
}

/// Aggregate view returned by `Conduit::metrics`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Mean over executions that reached an instance
    pub avg_response_time_ms: f64,
    /// Failed executions over all executions, in `[0, 1]`
    pub error_rate: f64,
    /// Checked-out connections over total pool capacity, in `[0, 1]`
    pub connection_utilization: f64,
    pub coalesced_requests: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub errors: ErrorBreakdown,
    pub in_flight: usize,
    pub queued: usize,
    pub instances: usize,
    pub healthy_instances: usize,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Cache hits over cache lookups, in `[0, 1]`
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    pub fn format_summary(&self) -> String {
        format!(
            "Requests: {} total, {} cache hits ({:.1}%), {} coalesced\n\
             Executions: {} ok, {} failed ({:.1}% error rate), {:.1}ms avg\n\
             Instances: {} healthy of {}, {:.0}% connection utilization",
            self.total_requests,
            self.cache_hits,
            self.cache_hit_rate() * 100.0,
            self.coalesced_requests,
            self.successful_executions,
            self.failed_executions,
            self.error_rate * 100.0,
            self.avg_response_time_ms,
            self.healthy_instances,
            self.instances,
            self.connection_utilization * 100.0
        )
    }
}

/// One pooled connection in `Conduit::details`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDetail {
    pub id: u64,
    pub endpoint: String,
    pub in_use: bool,
    pub health_score: f64,
    pub circuit_state: String,
    pub request_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub avg_response_time_ms: f64,
    pub last_used: DateTime<Utc>,
}

impl ConnectionDetail {
    /// Convert a snapshot, anchoring its idle time to `now`
    pub fn from_snapshot(snapshot: &ConnectionSnapshot, now: DateTime<Utc>) -> Self {
        let idle = chrono::Duration::from_std(snapshot.idle_for).unwrap_or(chrono::Duration::zero());
        Self {
            id: snapshot.id,
            endpoint: snapshot.endpoint.clone(),
            in_use: snapshot.in_use,
            health_score: snapshot.health_score,
            circuit_state: snapshot.circuit_state.to_string(),
            request_count: snapshot.request_count,
            error_count: snapshot.error_count,
            consecutive_errors: snapshot.consecutive_errors,
            avg_response_time_ms: snapshot.avg_response_time_ms,
            last_used: now - idle,
        }
    }
}

/// One instance in `Conduit::details`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDetail {
    pub id: String,
    pub endpoint: String,
    pub weight: u32,
    pub healthy: bool,
    pub draining: bool,
    pub circuit_state: String,
    pub active_requests: usize,
    pub request_count: u64,
    pub error_count: u64,
    pub avg_response_time_ms: f64,
    pub health_score: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub uptime_secs: u64,
    pub connections: Vec<ConnectionDetail>,
}

impl InstanceDetail {
    pub fn from_snapshot(snapshot: &InstanceSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            id: snapshot.id.clone(),
            endpoint: snapshot.endpoint.clone(),
            weight: snapshot.weight,
            healthy: snapshot.healthy,
            draining: snapshot.draining,
            circuit_state: snapshot.circuit_state.to_string(),
            active_requests: snapshot.active_requests,
            request_count: snapshot.request_count,
            error_count: snapshot.error_count,
            avg_response_time_ms: snapshot.avg_response_time_ms,
            health_score: snapshot.health_score,
            cpu_usage: snapshot.cpu_usage,
            memory_usage: snapshot.memory_usage,
            uptime_secs: snapshot.uptime.as_secs(),
            connections: snapshot
                .connections
                .iter()
                .map(|c| ConnectionDetail::from_snapshot(c, now))
                .collect(),
        }
    }

    /// Whether regular traffic can reach this instance
    pub fn is_routable(&self) -> bool {
        self.healthy && !self.draining && self.circuit_state != CircuitState::Open.as_str()
    }
}
