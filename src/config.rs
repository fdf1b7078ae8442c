/*!
 * Configuration types for Conduit
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use conduit_core_resilience::{CacheConfig, CircuitBreakerConfig, HealthScoring, PoolConfig};

use crate::balancer::autoscaler::AutoscaleConfig;
use crate::balancer::strategy::StrategyKind;
use crate::balancer::BalancerConfig;
use crate::error::{ConduitError, Result};
use crate::retry::{AdaptiveTimeoutConfig, RetryConfig};

/// Environment variable holding a comma-separated endpoint list
pub const ENV_ENDPOINTS: &str = "CONDUIT_ENDPOINTS";
/// Environment variable overriding the log level
pub const ENV_LOG_LEVEL: &str = "CONDUIT_LOG_LEVEL";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitConfig {
    /// Network preset supplying defaults when no endpoint is configured
    #[serde(default)]
    pub network: Network,

    /// Endpoints served from startup, one balanced instance each
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Endpoints the autoscaler may bring into service
    #[serde(default)]
    pub standby_endpoints: Vec<String>,

    /// Cheap read methods called by `warmup()`
    #[serde(default = "default_warmup_methods")]
    pub warmup_methods: Vec<String>,

    /// Upper bound on waiting for in-flight calls during shutdown
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub balancer: BalancerSettings,

    #[serde(default)]
    pub autoscale: AutoscaleSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            endpoints: Vec::new(),
            standby_endpoints: Vec::new(),
            warmup_methods: default_warmup_methods(),
            drain_timeout_ms: default_drain_timeout_ms(),
            pool: PoolSettings::default(),
            retry: RetrySettings::default(),
            cache: CacheSettings::default(),
            breaker: BreakerSettings::default(),
            balancer: BalancerSettings::default(),
            autoscale: AutoscaleSettings::default(),
            scheduler: SchedulerSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Known networks and their client defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Localnet,
    Devnet,
    Testnet,
    Mainnet,
    /// No default endpoint; `endpoints` must be set
    Custom,
}

impl Network {
    pub fn default_endpoint(&self) -> Option<&'static str> {
        match self {
            Network::Localnet => Some("http://127.0.0.1:8899"),
            Network::Devnet => Some("https://api.devnet.solana.com"),
            Network::Testnet => Some("https://api.testnet.solana.com"),
            Network::Mainnet => Some("https://api.mainnet-beta.solana.com"),
            Network::Custom => None,
        }
    }

    /// Per-attempt request timeout
    pub fn request_timeout_ms(&self) -> u64 {
        match self {
            Network::Mainnet => 60_000,
            _ => 30_000,
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Network::Localnet | Network::Custom => 3,
            _ => 5,
        }
    }

    pub fn retry_delay_ms(&self) -> u64 {
        match self {
            Network::Localnet | Network::Custom => 1000,
            Network::Devnet | Network::Testnet => 2000,
            Network::Mainnet => 3000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Localnet => "localnet",
            Network::Devnet => "devnet",
            Network::Testnet => "testnet",
            Network::Mainnet => "mainnet",
            Network::Custom => "custom",
        }
    }
}

impl FromStr for Network {
    type Err = ConduitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "localnet" | "local" => Ok(Network::Localnet),
            "devnet" => Ok(Network::Devnet),
            "testnet" => Ok(Network::Testnet),
            "mainnet" | "mainnet-beta" => Ok(Network::Mainnet),
            "custom" => Ok(Network::Custom),
            other => Err(ConduitError::Config(format!("unknown network '{}'", other))),
        }
    }
}

/// Connection pool settings, applied to every instance's pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Open connections on demand up to `max_connections`
    #[serde(default = "default_true")]
    pub allow_growth: bool,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Times the executor re-acquires after `Unavailable` or an opened circuit
    #[serde(default = "default_acquire_attempts")]
    pub acquire_attempts: u32,

    #[serde(default = "default_min_health_score")]
    pub min_health_score: f64,

    #[serde(default = "default_consecutive_error_penalty")]
    pub consecutive_error_penalty: f64,

    #[serde(default = "default_slow_response_ms")]
    pub slow_response_ms: f64,

    #[serde(default = "default_slow_response_penalty")]
    pub slow_response_penalty: f64,

    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,

    #[serde(default = "default_reference_latency_ms")]
    pub reference_latency_ms: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            allow_growth: true,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            acquire_attempts: default_acquire_attempts(),
            min_health_score: default_min_health_score(),
            consecutive_error_penalty: default_consecutive_error_penalty(),
            slow_response_ms: default_slow_response_ms(),
            slow_response_penalty: default_slow_response_penalty(),
            ewma_alpha: default_ewma_alpha(),
            reference_latency_ms: default_reference_latency_ms(),
        }
    }
}

/// Retry and adaptive timeout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Per-attempt timeout before adaptive scaling
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,

    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: f64,

    #[serde(default = "default_slow_factor")]
    pub slow_factor: f64,

    #[serde(default = "default_elevated_threshold_ms")]
    pub elevated_threshold_ms: f64,

    #[serde(default = "default_elevated_factor")]
    pub elevated_factor: f64,

    /// Consecutive errors above which `error_factor` applies
    #[serde(default = "default_error_streak")]
    pub error_streak: u32,

    #[serde(default = "default_error_factor")]
    pub error_factor: f64,

    /// Adaptive timeout never exceeds `base_timeout x max_timeout_multiplier`
    #[serde(default = "default_max_timeout_multiplier")]
    pub max_timeout_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            base_timeout_ms: default_base_timeout_ms(),
            slow_threshold_ms: default_slow_threshold_ms(),
            slow_factor: default_slow_factor(),
            elevated_threshold_ms: default_elevated_threshold_ms(),
            elevated_factor: default_elevated_factor(),
            error_streak: default_error_streak(),
            error_factor: default_error_factor(),
            max_timeout_multiplier: default_max_timeout_multiplier(),
        }
    }
}

/// Response cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Maximum entries; 0 disables caching
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    #[serde(default = "default_cache_ttl_ms")]
    pub default_ttl_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            default_ttl_ms: default_cache_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Circuit breaker settings for connections and instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Load balancer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerSettings {
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Pin a session key to the instance it first landed on
    #[serde(default)]
    pub sticky_sessions: bool,

    /// Instances tried per request before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_balancer_poll_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Method used to probe connections and instances
    #[serde(default = "default_health_check_method")]
    pub health_check_method: String,

    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,

    /// Consecutive failed probes before an instance is marked unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Static weight per endpoint; unlisted endpoints weigh 1
    #[serde(default)]
    pub weights: HashMap<String, u32>,

    /// Reference connection count for headroom scoring
    #[serde(default = "default_max_connections")]
    pub max_connections_per_instance: usize,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            sticky_sessions: false,
            max_attempts: default_max_attempts(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            poll_interval_ms: default_balancer_poll_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_method: default_health_check_method(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            unhealthy_threshold: default_unhealthy_threshold(),
            weights: HashMap::new(),
            max_connections_per_instance: default_max_connections(),
        }
    }
}

/// Autoscaler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscaleSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_min_instances")]
    pub min_instances: usize,

    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    #[serde(default = "default_target_cpu")]
    pub target_cpu: f64,

    #[serde(default = "default_target_memory")]
    pub target_memory: f64,

    #[serde(default = "default_target_response_time_ms")]
    pub target_response_time_ms: f64,

    /// Scale down when every metric is below `target x scale_down_threshold`
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,

    #[serde(default = "default_scale_up_cooldown_ms")]
    pub scale_up_cooldown_ms: u64,

    #[serde(default = "default_scale_down_cooldown_ms")]
    pub scale_down_cooldown_ms: u64,

    #[serde(default = "default_autoscale_interval_ms")]
    pub interval_ms: u64,
}

impl Default for AutoscaleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_instances: default_min_instances(),
            max_instances: default_max_instances(),
            target_cpu: default_target_cpu(),
            target_memory: default_target_memory(),
            target_response_time_ms: default_target_response_time_ms(),
            scale_down_threshold: default_scale_down_threshold(),
            scale_up_cooldown_ms: default_scale_up_cooldown_ms(),
            scale_down_cooldown_ms: default_scale_down_cooldown_ms(),
            interval_ms: default_autoscale_interval_ms(),
        }
    }
}

/// Priority scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Route calls through the priority queue
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Concurrent jobs admitted; 0 means total pool capacity
    #[serde(default)]
    pub max_concurrency: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: 0,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConduitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(ConduitError::Config(format!("unknown log level '{}'", other))),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_warmup_methods() -> Vec<String> {
    vec![
        "getHealth".to_string(),
        "getVersion".to_string(),
        "getSlot".to_string(),
    ]
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_min_connections() -> usize {
    2
}

fn default_max_connections() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_acquire_attempts() -> u32 {
    2
}

fn default_min_health_score() -> f64 {
    50.0
}

fn default_consecutive_error_penalty() -> f64 {
    10.0
}

fn default_slow_response_ms() -> f64 {
    1000.0
}

fn default_slow_response_penalty() -> f64 {
    20.0
}

fn default_ewma_alpha() -> f64 {
    0.1
}

fn default_reference_latency_ms() -> f64 {
    500.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_base_timeout_ms() -> u64 {
    30_000
}

fn default_slow_threshold_ms() -> f64 {
    1000.0
}

fn default_slow_factor() -> f64 {
    1.5
}

fn default_elevated_threshold_ms() -> f64 {
    500.0
}

fn default_elevated_factor() -> f64 {
    1.2
}

fn default_error_streak() -> u32 {
    3
}

fn default_error_factor() -> f64 {
    1.3
}

fn default_max_timeout_multiplier() -> f64 {
    2.0
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_cache_ttl_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_cooldown_ms() -> u64 {
    60_000
}

fn default_balancer_poll_ms() -> u64 {
    50
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_health_check_method() -> String {
    "getHealth".to_string()
}

fn default_health_check_timeout_ms() -> u64 {
    5_000
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_min_instances() -> usize {
    1
}

fn default_max_instances() -> usize {
    10
}

fn default_target_cpu() -> f64 {
    70.0
}

fn default_target_memory() -> f64 {
    80.0
}

fn default_target_response_time_ms() -> f64 {
    1000.0
}

fn default_scale_down_threshold() -> f64 {
    0.5
}

fn default_scale_up_cooldown_ms() -> u64 {
    5 * 60 * 1000
}

fn default_scale_down_cooldown_ms() -> u64 {
    10 * 60 * 1000
}

fn default_autoscale_interval_ms() -> u64 {
    60_000
}

impl ConduitConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConduitError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ConduitError::Config(format!("invalid TOML: {}", e)))
    }

    /// Serialize to TOML text
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConduitError::Config(e.to_string()))
    }

    /// `<config dir>/conduit/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("conduit").join("config.toml"))
    }

    /// Load the default config file if it exists, otherwise use defaults
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Defaults for a network: its endpoint, timeout and retry policy
    pub fn for_network(network: Network) -> Self {
        let mut config = Self {
            network,
            ..Self::default()
        };
        config.apply_network_defaults();
        config
    }

    fn apply_network_defaults(&mut self) {
        self.retry.base_timeout_ms = self.network.request_timeout_ms();
        self.retry.max_attempts = self.network.max_retries();
        self.retry.base_delay_ms = self.network.retry_delay_ms();
    }

    /// Apply `CONDUIT_ENDPOINTS` and `CONDUIT_LOG_LEVEL`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoints) = lookup(ENV_ENDPOINTS) {
            let parsed: Vec<String> = endpoints
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !parsed.is_empty() {
                self.endpoints = parsed;
            }
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.log_level = level.parse()?;
        }
        Ok(())
    }

    /// Configured endpoints, or the network's default endpoint
    pub fn resolved_endpoints(&self) -> Vec<String> {
        if !self.endpoints.is_empty() {
            return self.endpoints.clone();
        }
        self.network
            .default_endpoint()
            .map(|endpoint| vec![endpoint.to_string()])
            .unwrap_or_default()
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.resolved_endpoints().is_empty() {
            return Err(ConduitError::Config(
                "no endpoints configured and the network has no default".into(),
            ));
        }
        if self.pool.max_connections == 0 {
            return Err(ConduitError::Config(
                "pool.max_connections must be at least 1".into(),
            ));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(ConduitError::Config(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if self.retry.max_attempts == 0 || self.balancer.max_attempts == 0 {
            return Err(ConduitError::Config("max_attempts must be at least 1".into()));
        }
        if self.pool.acquire_attempts == 0 {
            return Err(ConduitError::Config(
                "pool.acquire_attempts must be at least 1".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(ConduitError::Config(
                "breaker thresholds must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pool.ewma_alpha) || self.pool.ewma_alpha == 0.0 {
            return Err(ConduitError::Config(
                "pool.ewma_alpha must be in (0, 1]".into(),
            ));
        }
        if let Some((endpoint, _)) = self.balancer.weights.iter().find(|(_, w)| **w == 0) {
            return Err(ConduitError::Config(format!(
                "weight for {} must be at least 1",
                endpoint
            )));
        }
        if self.autoscale.min_instances > self.autoscale.max_instances {
            return Err(ConduitError::Config(format!(
                "autoscale.min_instances ({}) exceeds autoscale.max_instances ({})",
                self.autoscale.min_instances, self.autoscale.max_instances
            )));
        }
        if !(0.0..=1.0).contains(&self.autoscale.scale_down_threshold) {
            return Err(ConduitError::Config(
                "autoscale.scale_down_threshold must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            success_threshold: self.breaker.success_threshold,
            cooldown: Duration::from_millis(self.breaker.cooldown_ms),
        }
    }

    pub fn health_scoring(&self) -> HealthScoring {
        HealthScoring {
            ewma_alpha: self.pool.ewma_alpha,
            reference_latency_ms: self.pool.reference_latency_ms,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_size: self.pool.min_connections,
            max_size: self.pool.max_connections,
            allow_growth: self.pool.allow_growth,
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
            poll_interval: Duration::from_millis(self.pool.poll_interval_ms),
            min_health_score: self.pool.min_health_score,
            consecutive_error_penalty: self.pool.consecutive_error_penalty,
            slow_response_ms: self.pool.slow_response_ms,
            slow_response_penalty: self.pool.slow_response_penalty,
            breaker: self.breaker_config(),
            scoring: self.health_scoring(),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache.capacity,
            default_ttl: Duration::from_millis(self.cache.default_ttl_ms),
            sweep_interval: Duration::from_millis(self.cache.sweep_interval_ms),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            base_timeout: Duration::from_millis(self.retry.base_timeout_ms),
            adaptive: AdaptiveTimeoutConfig {
                slow_threshold_ms: self.retry.slow_threshold_ms,
                slow_factor: self.retry.slow_factor,
                elevated_threshold_ms: self.retry.elevated_threshold_ms,
                elevated_factor: self.retry.elevated_factor,
                error_streak: self.retry.error_streak,
                error_factor: self.retry.error_factor,
                max_multiplier: self.retry.max_timeout_multiplier,
            },
        }
    }

    pub fn balancer_config(&self) -> BalancerConfig {
        BalancerConfig {
            strategy: self.balancer.strategy,
            sticky_sessions: self.balancer.sticky_sessions,
            max_attempts: self.balancer.max_attempts,
            acquire_timeout: Duration::from_millis(self.balancer.acquire_timeout_ms),
            poll_interval: Duration::from_millis(self.balancer.poll_interval_ms),
            health_check_interval: Duration::from_millis(self.balancer.health_check_interval_ms),
            health_check_method: self.balancer.health_check_method.clone(),
            health_check_timeout: Duration::from_millis(self.balancer.health_check_timeout_ms),
            unhealthy_threshold: self.balancer.unhealthy_threshold,
            max_connections_per_instance: self.balancer.max_connections_per_instance,
            breaker: self.breaker_config(),
            scoring: self.health_scoring(),
            drain_timeout: self.drain_timeout(),
        }
    }

    pub fn autoscale_config(&self) -> AutoscaleConfig {
        AutoscaleConfig {
            enabled: self.autoscale.enabled,
            min_instances: self.autoscale.min_instances,
            max_instances: self.autoscale.max_instances,
            target_cpu: self.autoscale.target_cpu,
            target_memory: self.autoscale.target_memory,
            target_response_time_ms: self.autoscale.target_response_time_ms,
            scale_down_threshold: self.autoscale.scale_down_threshold,
            scale_up_cooldown: Duration::from_millis(self.autoscale.scale_up_cooldown_ms),
            scale_down_cooldown: Duration::from_millis(self.autoscale.scale_down_cooldown_ms),
            interval: Duration::from_millis(self.autoscale.interval_ms),
        }
    }

    /// Static weight of an endpoint
    pub fn weight_for(&self, endpoint: &str) -> u32 {
        self.balancer.weights.get(endpoint).copied().unwrap_or(1)
    }
}
