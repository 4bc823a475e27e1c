/*!
 * Configuration types for Switchyard
 *
 * Every field has a default, so an empty file is a valid configuration.
 * Durations are plain integers with the unit in the key name.
 */

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use switchyard_core_resilience::{
    AnomalyConfig, CircuitBreakerConfig, LimiterConfig, PoolConfig, ScalingPolicy,
};

use crate::error::{GatewayError, Result};
use crate::registry::ServerSpec;
use crate::router::BalancePolicy;

/// Top-level gateway configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub logging: LoggingConfig,
    pub breaker: BreakerConfig,
    pub pool: PoolSection,
    pub rate_limit: RateLimitConfig,
    pub health: HealthConfig,
    pub router: RouterConfig,
    pub store: StoreConfig,
    pub frontend: FrontendConfig,
    pub audit: AuditConfig,

    /// Servers registered at startup, after persisted ones
    pub servers: Vec<ServerSpec>,
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

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,

    /// Log file path (None = stdout)
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker
    pub failure_threshold: usize,

    /// Trial successes that close a half-open breaker
    pub success_threshold: usize,

    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_secs: 60,
        }
    }
}

impl BreakerConfig {
    pub fn to_core(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub min_size: usize,
    pub max_size: usize,

    /// 0 disables the idle timeout
    pub idle_timeout_secs: u64,

    /// 0 disables the lifetime limit
    pub max_lifetime_secs: u64,

    pub acquire_timeout_ms: u64,

    /// How often the scaling evaluator samples and rescales
    pub scale_interval_secs: u64,

    /// Pools with nothing leased for this long are torn down
    pub idle_pool_ttl_secs: u64,

    pub scaling: ScalingConfig,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            idle_timeout_secs: 300,
            max_lifetime_secs: 1800,
            acquire_timeout_ms: 5000,
            scale_interval_secs: 60,
            idle_pool_ttl_secs: 900,
            scaling: ScalingConfig::default(),
        }
    }
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl PoolSection {
    pub fn to_core(&self) -> PoolConfig {
        PoolConfig {
            min_size: self.min_size,
            max_size: self.max_size,
            idle_timeout: optional_secs(self.idle_timeout_secs),
            max_lifetime: optional_secs(self.max_lifetime_secs),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            scaling: self.scaling.to_core(),
        }
    }

    pub fn scale_interval(&self) -> Duration {
        Duration::from_secs(self.scale_interval_secs)
    }

    pub fn idle_pool_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_pool_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub high_water: f64,
    pub low_water: f64,
    pub growth_factor: f64,
    pub evaluation_window: usize,
    pub history_capacity: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        let core = ScalingPolicy::default();
        Self {
            high_water: core.high_water,
            low_water: core.low_water,
            growth_factor: core.growth_factor,
            evaluation_window: core.evaluation_window,
            history_capacity: core.history_capacity,
        }
    }
}

impl ScalingConfig {
    pub fn to_core(&self) -> ScalingPolicy {
        ScalingPolicy {
            high_water: self.high_water,
            low_water: self.low_water,
            growth_factor: self.growth_factor,
            evaluation_window: self.evaluation_window,
            history_capacity: self.history_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Global admissions per window
    pub capacity: u64,
    pub window_secs: u64,
    pub burst_factor: f64,
    pub default_weight: f64,
    pub tenant_idle_ttl_secs: u64,

    /// How often idle tenant state is collected
    pub gc_interval_secs: u64,

    /// Per-tenant fairness weights
    pub weights: BTreeMap<String, f64>,

    pub anomaly: AnomalySection,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 3000,
            window_secs: 300,
            burst_factor: 1.5,
            default_weight: 1.0,
            tenant_idle_ttl_secs: 900,
            gc_interval_secs: 60,
            weights: BTreeMap::new(),
            anomaly: AnomalySection::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn to_core(&self) -> LimiterConfig {
        LimiterConfig {
            capacity: self.capacity,
            window: Duration::from_secs(self.window_secs),
            burst_factor: self.burst_factor,
            default_weight: self.default_weight,
            weights: self
                .weights
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            tenant_idle_ttl: Duration::from_secs(self.tenant_idle_ttl_secs),
            anomaly: self.anomaly.to_core(),
        }
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalySection {
    pub enabled: bool,
    pub sub_window_secs: u64,
    pub ceiling: u64,
    pub block_duration_secs: u64,
}

impl Default for AnomalySection {
    fn default() -> Self {
        Self {
            enabled: true,
            sub_window_secs: 10,
            ceiling: 1000,
            block_duration_secs: 300,
        }
    }
}

impl AnomalySection {
    pub fn to_core(&self) -> AnomalyConfig {
        AnomalyConfig {
            enabled: self.enabled,
            sub_window: Duration::from_secs(self.sub_window_secs),
            ceiling: self.ceiling,
            block_duration: Duration::from_secs(self.block_duration_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub probe_timeout_ms: u64,

    /// Upper bound of the random delay before each probe
    pub jitter_ms: u64,

    /// Successful probes slower than this mark the server degraded
    pub degraded_latency_ms: u64,

    /// Consecutive failed probes before a server is unhealthy
    pub unhealthy_threshold: u32,

    /// Consecutive failed probes before a server is deregistered (0 = never)
    pub evict_after: u32,

    pub max_concurrent_probes: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            probe_timeout_ms: 2000,
            jitter_ms: 1000,
            degraded_latency_ms: 1000,
            unhealthy_threshold: 3,
            evict_after: 0,
            max_concurrent_probes: 16,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn degraded_latency(&self) -> Duration {
        Duration::from_millis(self.degraded_latency_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub policy: BalancePolicy,

    /// Additional candidates tried after the first transport failure
    pub max_failover: usize,

    /// Per-attempt backend call timeout
    pub invoke_timeout_ms: u64,

    /// Deadline applied when the caller supplies none
    pub default_deadline_ms: u64,

    pub connect_timeout_ms: u64,

    /// Ring points per unit of weight for consistent hashing
    pub virtual_nodes: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            policy: BalancePolicy::RoundRobin,
            max_failover: 2,
            invoke_timeout_ms: 10_000,
            default_deadline_ms: 30_000,
            connect_timeout_ms: 3000,
            virtual_nodes: 64,
        }
    }
}

impl RouterConfig {
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Registry file; registrations are not persisted when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub listen: String,

    /// Longest accepted request line
    pub max_line_bytes: usize,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7400".to_string(),
            max_line_bytes: 1024 * 1024, // 1 MB
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,

    /// Events buffered before new ones are dropped
    pub capacity: usize,

    /// JSON Lines file; events go to the log when unset
    pub file: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 4096,
            file: None,
        }
    }
}

impl GatewayConfig {
    /// Load and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GatewayError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Reject inconsistent thresholds and bad bootstrap servers
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(GatewayError::Config(msg));

        self.breaker.to_core().validate()?;
        self.pool.to_core().validate()?;
        self.rate_limit.to_core().validate()?;

        if self.pool.acquire_timeout_ms == 0 {
            return invalid("pool acquire_timeout_ms must be non-zero".to_string());
        }
        if self.pool.scale_interval_secs == 0 {
            return invalid("pool scale_interval_secs must be non-zero".to_string());
        }
        if self.rate_limit.gc_interval_secs == 0 {
            return invalid("rate_limit gc_interval_secs must be non-zero".to_string());
        }

        let h = &self.health;
        if h.interval_secs == 0 || h.probe_timeout_ms == 0 {
            return invalid("health interval and probe timeout must be non-zero".to_string());
        }
        if h.unhealthy_threshold == 0 {
            return invalid("health unhealthy_threshold must be at least 1".to_string());
        }
        if h.evict_after != 0 && h.evict_after < h.unhealthy_threshold {
            return invalid(format!(
                "health evict_after ({}) must be 0 or at least unhealthy_threshold ({})",
                h.evict_after, h.unhealthy_threshold
            ));
        }
        if h.max_concurrent_probes == 0 {
            return invalid("health max_concurrent_probes must be at least 1".to_string());
        }

        let r = &self.router;
        if r.invoke_timeout_ms == 0 || r.default_deadline_ms == 0 || r.connect_timeout_ms == 0 {
            return invalid("router timeouts must be non-zero".to_string());
        }
        if r.virtual_nodes == 0 {
            return invalid("router virtual_nodes must be at least 1".to_string());
        }

        if self.frontend.listen.parse::<SocketAddr>().is_err() {
            return invalid(format!(
                "frontend listen address '{}' is not a socket address",
                self.frontend.listen
            ));
        }
        if self.frontend.max_line_bytes == 0 {
            return invalid("frontend max_line_bytes must be non-zero".to_string());
        }
        if self.audit.enabled && self.audit.capacity == 0 {
            return invalid("audit capacity must be non-zero".to_string());
        }

        let mut ids = HashSet::new();
        for spec in &self.servers {
            let record = spec.clone().into_record().map_err(|e| {
                GatewayError::Config(format!("Invalid server '{}': {}", spec.endpoint, e))
            })?;
            if spec.id.is_some() && !ids.insert(record.id.clone()) {
                return invalid(format!("server id '{}' is listed twice", record.id));
            }
        }
        Ok(())
    }
}
