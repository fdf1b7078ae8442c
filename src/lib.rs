/*!
 * Conduit - Adaptive Request Execution Layer
 *
 * Client-side execution of remote calls against a set of node endpoints:
 * - Connection pooling with health scoring and per-connection circuit breakers
 * - Response caching with TTL and FIFO eviction
 * - Retries with exponential backoff and adaptive timeouts
 * - Priority scheduling and request coalescing
 * - Load balancing across instances with health monitoring and autoscaling
 *
 * ```no_run
 * use conduit::{CallOptions, Conduit, ConduitConfig};
 *
 * # async fn demo() -> conduit::Result<()> {
 * let conduit = Conduit::connect_http(ConduitConfig::default()).await?;
 * let slot = conduit.execute("getSlot", vec![], CallOptions::default()).await?;
 * println!("{}", slot);
 * conduit.shutdown().await;
 * # Ok(())
 * # }
 * ```
 */

pub mod balancer;
pub mod cache_key;
pub mod coalescer;
pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod transport;

// Re-export commonly used types
pub use balancer::{LoadBalancer, SelectionPolicy, StrategyKind};
pub use codec::{Codec, JsonCodec, RawCodec};
pub use config::{ConduitConfig, Network};
pub use error::{ConduitError, ErrorCategory, Result};
pub use executor::{CallOptions, CallSpec, Conduit, ShutdownReport, WarmupReport};
pub use metrics::{InstanceDetail, MetricsSnapshot};
pub use scheduler::Priority;
pub use transport::{Connection, HttpTransport, HttpTransportFactory, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
