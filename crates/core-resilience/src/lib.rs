//! Conduit Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks the request execution layer is
//! assembled from. It includes:
//!
//! - **Circuit Breaker**: Isolates a connection or instance after repeated failures
//! - **Health Statistics**: Smoothed latency, error rate and a 0-100 health score
//! - **Connection Pool**: Health-scored selection over a bounded set of connections
//! - **Response Cache**: Bounded TTL cache with FIFO eviction
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Wire protocols (JSON-RPC, HTTP)
//! - Request routing and scheduling
//! - Application-specific concerns
//!
//! Connections are opaque handles produced by a [`ConnectionFactory`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Response Cache                    │  ← Skip repeated reads
//! │  (TTL per entry, FIFO eviction)         │
//! └─────────────┬───────────────────────────┘
//!               │ miss
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Connection Pool                   │  ← Pick the healthiest connection
//! │  (Health score, LRU tiebreak, growth)   │
//! └─────────────┬───────────────────────────┘
//!               │ per connection
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker + HealthStats     │  ← Fail-fast isolation
//! │  (Opens on threshold, cooldown probe)   │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         Remote endpoint
//! ```
//!
//! # Usage Example
//!
//! ```
//! use conduit_core_resilience::{BreakerTarget, CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use std::time::Duration;
//!
//! let mut breaker = CircuitBreaker::new(
//!     BreakerTarget::connection("node-1#0"),
//!     CircuitBreakerConfig {
//!         failure_threshold: 2,
//!         cooldown: Duration::from_secs(60),
//!         ..Default::default()
//!     },
//! );
//!
//! breaker.record_failure();
//! breaker.record_failure();
//! assert_eq!(breaker.peek_state(), CircuitState::Open);
//! ```

pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod health;
pub mod response_cache;

// Re-export main types for convenience
pub use circuit_breaker::{
    BreakerTarget, CircuitBreaker, CircuitBreakerConfig, CircuitState, TargetKind,
};
pub use connection_pool::{
    ConnectionFactory, ConnectionPool, ConnectionSnapshot, DrainReport, HealthCheckReport,
    PoolConfig, PoolStats, PooledConnection,
};
pub use error::ResilienceError;
pub use health::{HealthScoring, HealthStats};
pub use response_cache::{CacheConfig, CacheStats, ResponseCache};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use conduit_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::connection_pool::{
        ConnectionFactory, ConnectionPool, PoolConfig, PooledConnection,
    };
    pub use super::error::ResilienceError;
    pub use super::health::{HealthScoring, HealthStats};
    pub use super::response_cache::{CacheConfig, ResponseCache};
}
