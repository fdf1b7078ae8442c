//! Health statistics: smoothed latency, error rate and a 0-100 health score
//!
//! Both pooled connections and balanced instances keep one `HealthStats`.
//! The score combines the lifetime error rate with the smoothed latency:
//!
//! ```text
//! score = clamp(0, 100, (1 - error_rate) * 50 + min(1, reference_ms / avg_ms) * 50)
//! ```
//!
//! # Example
//!
//! ```
//! use conduit_core_resilience::health::{HealthScoring, HealthStats};
//! use std::time::Duration;
//!
//! let mut stats = HealthStats::new();
//! stats.record(Duration::from_millis(250), true, &HealthScoring::default());
//! assert_eq!(stats.health_score(), 100.0);
//! ```

use std::time::Duration;

/// Tunable constants for health scoring
#[derive(Debug, Clone)]
pub struct HealthScoring {
    /// EWMA smoothing factor applied to each new latency sample
    pub ewma_alpha: f64,
    /// Latency at or below which the latency half of the score is full
    pub reference_latency_ms: f64,
}

impl Default for HealthScoring {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.1,
            reference_latency_ms: 500.0,
        }
    }
}

/// Rolling request statistics for one target
#[derive(Debug, Clone)]
pub struct HealthStats {
    request_count: u64,
    error_count: u64,
    avg_response_time_ms: f64,
    health_score: f64,
}

impl Default for HealthStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthStats {
    /// Fresh statistics; an untested target starts fully healthy
    pub fn new() -> Self {
        Self {
            request_count: 0,
            error_count: 0,
            avg_response_time_ms: 0.0,
            health_score: 100.0,
        }
    }

    /// Record one completed call and recompute the health score
    ///
    /// Failed calls count toward the error rate but their latency is not
    /// folded into the average, since a timeout says nothing about the
    /// target's normal response time.
    pub fn record(&mut self, elapsed: Duration, success: bool, scoring: &HealthScoring) {
        self.request_count += 1;
        if success {
            let sample = elapsed.as_secs_f64() * 1000.0;
            self.avg_response_time_ms = if self.request_count == 1 || self.avg_response_time_ms == 0.0
            {
                sample
            } else {
                scoring.ewma_alpha * sample + (1.0 - scoring.ewma_alpha) * self.avg_response_time_ms
            };
        } else {
            self.error_count += 1;
        }
        self.health_score = self.compute_score(scoring);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        self.avg_response_time_ms
    }

    pub fn health_score(&self) -> f64 {
        self.health_score
    }

    /// Override the score, for owners that derive health from other signals
    pub fn set_health_score(&mut self, score: f64) {
        self.health_score = score.clamp(0.0, 100.0);
    }

    /// Lifetime error ratio in `[0, 1]`
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }

    /// Latency component in `[0, 1]`; a target with no latency samples scores 1
    pub fn response_time_score(&self, scoring: &HealthScoring) -> f64 {
        if self.avg_response_time_ms <= 0.0 {
            1.0
        } else {
            (scoring.reference_latency_ms / self.avg_response_time_ms).min(1.0)
        }
    }

    /// Zero all counters and restore the initial score
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn compute_score(&self, scoring: &HealthScoring) -> f64 {
        let score =
            (1.0 - self.error_rate()) * 50.0 + self.response_time_score(scoring) * 50.0;
        score.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_stats_are_healthy() {
        let stats = HealthStats::new();
        assert_eq!(stats.health_score(), 100.0);
        assert_eq!(stats.error_rate(), 0.0);
    }

    #[test]
    fn test_ewma_smoothing() {
        let scoring = HealthScoring::default();
        let mut stats = HealthStats::new();
        stats.record(Duration::from_millis(100), true, &scoring);
        assert_eq!(stats.avg_response_time_ms(), 100.0);

        stats.record(Duration::from_millis(200), true, &scoring);
        assert!((stats.avg_response_time_ms() - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_errors_lower_score() {
        let scoring = HealthScoring::default();
        let mut stats = HealthStats::new();
        stats.record(Duration::from_millis(100), true, &scoring);
        stats.record(Duration::from_millis(100), false, &scoring);

        assert_eq!(stats.error_rate(), 0.5);
        assert!((stats.health_score() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_slow_responses_lower_score() {
        let scoring = HealthScoring::default();
        let mut stats = HealthStats::new();
        stats.record(Duration::from_millis(1000), true, &scoring);

        // error half full, latency half 500/1000
        assert!((stats.health_score() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_is_clamped() {
        let mut stats = HealthStats::new();
        stats.set_health_score(140.0);
        assert_eq!(stats.health_score(), 100.0);
        stats.set_health_score(-3.0);
        assert_eq!(stats.health_score(), 0.0);
    }
}
