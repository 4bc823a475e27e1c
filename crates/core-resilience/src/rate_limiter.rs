//! Fair-share admission control
//!
//! A global window capacity `C` is divided among the tenants that have sent
//! traffic within the last window, in proportion to their weights:
//!
//! ```text
//! fair_share(t) = C * weight(t) / sum(weight(active tenants))
//! ```
//!
//! The active set and weights are recomputed on every admission, so shares
//! move as tenants come and go. Each tenant keeps a sliding-window log of
//! admitted costs (no clock-aligned buckets). Usage up to the fair share is
//! always admitted; usage beyond it, up to `fair_share * burst_factor`, is
//! paid for with burst tokens, which only accrue while the tenant runs below
//! its share. The token balance never exceeds `fair_share * (burst_factor - 1)`,
//! so a tenant that stays at its share earns nothing and cannot exceed it
//! across consecutive windows.
//!
//! Independently, an anomaly guard counts every attempt per key over a short
//! sub-window and blocks keys that exceed a hard ceiling.

use super::error::ResilienceError;
use super::shard::ShardedMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const EPSILON: f64 = 1e-9;

/// Hard per-key ceiling over a short sub-window
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub enabled: bool,
    pub sub_window: Duration,
    /// Attempts (by cost) tolerated within one sub-window
    pub ceiling: u64,
    pub block_duration: Duration,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sub_window: Duration::from_secs(10),
            ceiling: 1000,
            block_duration: Duration::from_secs(300),
        }
    }
}

/// Configuration for the fair-share limiter
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Global admissions (by cost) per window
    pub capacity: u64,
    pub window: Duration,
    /// Multiple of the fair share a tenant may reach using burst tokens
    pub burst_factor: f64,
    /// Weight for tenants without an explicit entry
    pub default_weight: f64,
    pub weights: HashMap<String, f64>,
    /// Tenant state untouched for this long is garbage-collected
    pub tenant_idle_ttl: Duration,
    pub anomaly: AnomalyConfig,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 3000,
            window: Duration::from_secs(300),
            burst_factor: 1.5,
            default_weight: 1.0,
            weights: HashMap::new(),
            tenant_idle_ttl: Duration::from_secs(900),
            anomaly: AnomalyConfig::default(),
        }
    }
}

impl LimiterConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        let invalid = |msg: String| Err(ResilienceError::InvalidConfig(msg));
        if self.capacity == 0 {
            return invalid("rate limit capacity must be at least 1".to_string());
        }
        if self.window.is_zero() {
            return invalid("rate limit window must be non-zero".to_string());
        }
        if self.burst_factor < 1.0 {
            return invalid(format!(
                "burst_factor ({}) must be at least 1.0",
                self.burst_factor
            ));
        }
        if self.default_weight <= 0.0 {
            return invalid("default_weight must be positive".to_string());
        }
        if let Some((tenant, w)) = self.weights.iter().find(|(_, w)| **w <= 0.0) {
            return invalid(format!("weight for tenant '{tenant}' must be positive, got {w}"));
        }
        if self.anomaly.enabled && (self.anomaly.ceiling == 0 || self.anomaly.sub_window.is_zero())
        {
            return invalid("anomaly ceiling and sub_window must be non-zero".to_string());
        }
        Ok(())
    }

    fn weight_of(&self, tenant: &str) -> f64 {
        self.weights
            .get(tenant)
            .copied()
            .unwrap_or(self.default_weight)
    }
}

/// Why a request was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Tenant is at its fair share and has no burst tokens left
    FairShareExceeded,
    /// Anomaly guard tripped for this key
    Blocked,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::FairShareExceeded => "fair_share_exceeded",
            DenyReason::Blocked => "blocked",
        }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Admitted; `burst` is set when burst tokens paid for part of it
    Allowed { burst: bool },
    Denied {
        retry_after: Duration,
        reason: DenyReason,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }

    /// Convert a denial into [`ResilienceError::RateLimitExceeded`]
    pub fn into_result(self) -> Result<(), ResilienceError> {
        match self {
            Admission::Allowed { .. } => Ok(()),
            Admission::Denied { retry_after, .. } => {
                Err(ResilienceError::RateLimitExceeded { retry_after })
            }
        }
    }
}

/// Point-in-time usage of one tenant
#[derive(Debug, Clone, PartialEq)]
pub struct TenantUsage {
    pub consumed: u64,
    pub burst_tokens: f64,
    pub blocked: bool,
}

#[derive(Debug)]
struct TenantQuota {
    /// Admitted costs, oldest first
    log: VecDeque<(Instant, u64)>,
    consumed: u64,
    burst_tokens: f64,
    last_refill: Instant,
    /// Start of the current stretch below the fair share; `None` while at or above it
    below_share_since: Option<Instant>,
    /// Last honest request; blocked attempts do not count
    last_seen: Instant,
    /// Every attempt within the anomaly sub-window
    attempts: VecDeque<(Instant, u64)>,
    attempt_total: u64,
    blocked_until: Option<Instant>,
}

impl TenantQuota {
    fn new(now: Instant) -> Self {
        Self {
            log: VecDeque::new(),
            consumed: 0,
            burst_tokens: 0.0,
            last_refill: now,
            below_share_since: Some(now),
            last_seen: now,
            attempts: VecDeque::new(),
            attempt_total: 0,
            blocked_until: None,
        }
    }

    /// Drop entries older than `window`, noting when usage fell below `fair_share`
    fn expire(&mut self, window: Duration, fair_share: f64, now: Instant) {
        while let Some(&(at, cost)) = self.log.front() {
            let expires_at = at + window;
            if expires_at > now {
                break;
            }
            self.log.pop_front();
            let was_at_share = self.consumed as f64 + EPSILON >= fair_share;
            self.consumed -= cost;
            if was_at_share && (self.consumed as f64) + EPSILON < fair_share {
                self.below_share_since = Some(expires_at);
            }
        }
    }

    /// Accrue tokens for the time spent below `fair_share` since the last refill
    fn refill(&mut self, fair_share: f64, token_cap: f64, window: Duration, now: Instant) {
        if (self.consumed as f64) + EPSILON < fair_share {
            let since = *self.below_share_since.get_or_insert(now);
            let from = since.max(self.last_refill);
            let below_for = now.saturating_duration_since(from).as_secs_f64();
            self.burst_tokens += fair_share / window.as_secs_f64() * below_for;
        } else {
            self.below_share_since = None;
        }
        self.burst_tokens = self.burst_tokens.min(token_cap);
        self.last_refill = now;
    }

    fn expire_attempts(&mut self, sub_window: Duration, now: Instant) {
        while let Some(&(at, cost)) = self.attempts.front() {
            if at + sub_window > now {
                break;
            }
            self.attempts.pop_front();
            self.attempt_total -= cost;
        }
    }

    fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }

    /// Time until enough of the log expires for `cost` to fit under `allowance`
    fn retry_after(&self, cost: u64, allowance: f64, window: Duration, now: Instant) -> Duration {
        let allowance = (allowance + EPSILON).floor() as u64;
        if cost > allowance {
            return window;
        }
        let must_free = (self.consumed + cost).saturating_sub(allowance);
        let mut freed = 0;
        for &(at, c) in &self.log {
            freed += c;
            if freed >= must_free {
                return (at + window).saturating_duration_since(now);
            }
        }
        window
    }
}

/// Per-tenant fair-share rate limiter
///
/// # Example
/// ```
/// use switchyard_core_resilience::{FairShareLimiter, LimiterConfig};
///
/// let limiter = FairShareLimiter::new(LimiterConfig::default());
/// assert!(limiter.admit("tenant-a", 1).is_allowed());
/// ```
#[derive(Debug)]
pub struct FairShareLimiter {
    config: RwLock<LimiterConfig>,
    tenants: ShardedMap<TenantQuota>,
}

impl FairShareLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config: RwLock::new(config),
            tenants: ShardedMap::new(),
        }
    }

    fn config(&self) -> RwLockReadGuard<'_, LimiterConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the live configuration
    pub fn current_config(&self) -> LimiterConfig {
        self.config().clone()
    }

    /// Admit `cost` units for `tenant` now
    pub fn admit(&self, tenant: &str, cost: u64) -> Admission {
        self.admit_at(tenant, cost, Instant::now())
    }

    /// Admit `cost` units for `tenant` as of `now`
    pub fn admit_at(&self, tenant: &str, cost: u64, now: Instant) -> Admission {
        let config = self.config();

        if config.anomaly.enabled {
            if let Some(denied) = self.check_anomaly(&config, tenant, cost, now) {
                return denied;
            }
        }

        let fair_share = self.fair_share_locked(&config, tenant, now);
        let hard_cap = fair_share * config.burst_factor;
        let token_cap = hard_cap - fair_share;
        let window = config.window;

        self.tenants.with_entry(tenant, |map| {
            let quota = map
                .entry(tenant.to_string())
                .or_insert_with(|| TenantQuota::new(now));
            quota.expire(window, fair_share, now);
            quota.last_seen = now;
            quota.refill(fair_share, token_cap, window, now);

            let after = (quota.consumed + cost) as f64;
            let admitted = if after <= fair_share + EPSILON {
                Some(false)
            } else if after <= hard_cap + EPSILON {
                let over = after - fair_share.max(quota.consumed as f64);
                if quota.burst_tokens + EPSILON >= over {
                    quota.burst_tokens = (quota.burst_tokens - over).max(0.0);
                    Some(true)
                } else {
                    None
                }
            } else {
                None
            };

            match admitted {
                Some(burst) => {
                    quota.log.push_back((now, cost));
                    quota.consumed += cost;
                    if quota.consumed as f64 + EPSILON >= fair_share {
                        quota.below_share_since = None;
                    }
                    Admission::Allowed { burst }
                }
                None => {
                    let retry_after = quota.retry_after(cost, fair_share, window, now);
                    debug!(
                        tenant = %tenant,
                        consumed = quota.consumed,
                        fair_share,
                        ?retry_after,
                        "Admission denied"
                    );
                    Admission::Denied {
                        retry_after,
                        reason: DenyReason::FairShareExceeded,
                    }
                }
            }
        })
    }

    fn check_anomaly(
        &self,
        config: &LimiterConfig,
        tenant: &str,
        cost: u64,
        now: Instant,
    ) -> Option<Admission> {
        let anomaly = &config.anomaly;
        self.tenants.with_entry(tenant, |map| {
            let quota = map
                .entry(tenant.to_string())
                .or_insert_with(|| TenantQuota::new(now));

            if let Some(until) = quota.blocked_until.filter(|until| *until > now) {
                return Some(Admission::Denied {
                    retry_after: until - now,
                    reason: DenyReason::Blocked,
                });
            }

            quota.expire_attempts(anomaly.sub_window, now);
            quota.attempts.push_back((now, cost));
            quota.attempt_total += cost;
            if quota.attempt_total > anomaly.ceiling {
                warn!(
                    tenant = %tenant,
                    attempts = quota.attempt_total,
                    ceiling = anomaly.ceiling,
                    block_secs = anomaly.block_duration.as_secs(),
                    "Anomalous request rate, blocking key"
                );
                quota.blocked_until = Some(now + anomaly.block_duration);
                quota.attempts.clear();
                quota.attempt_total = 0;
                return Some(Admission::Denied {
                    retry_after: anomaly.block_duration,
                    reason: DenyReason::Blocked,
                });
            }
            None
        })
    }

    /// Sum of weights over tenants active within the window, plus `tenant`
    ///
    /// Blocked keys are left out of the active set.
    fn fair_share_locked(&self, config: &LimiterConfig, tenant: &str, now: Instant) -> f64 {
        let own = config.weight_of(tenant);
        let mut total = own;
        self.tenants.for_each(|key, quota| {
            if key != tenant
                && !quota.is_blocked(now)
                && now.saturating_duration_since(quota.last_seen) < config.window
            {
                total += config.weight_of(key);
            }
        });
        config.capacity as f64 * own / total
    }

    /// Current fair share of `tenant` as of `now`
    pub fn fair_share_at(&self, tenant: &str, now: Instant) -> f64 {
        let config = self.config();
        self.fair_share_locked(&config, tenant, now)
    }

    pub fn usage(&self, tenant: &str) -> Option<TenantUsage> {
        let now = Instant::now();
        self.tenants.with(tenant, |q| {
            q.map(|q| TenantUsage {
                consumed: q.consumed,
                burst_tokens: q.burst_tokens,
                blocked: q.is_blocked(now),
            })
        })
    }

    /// Number of tenants with live state
    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    /// Drop state for tenants idle beyond `tenant_idle_ttl`
    pub fn collect_idle(&self) -> usize {
        self.collect_idle_at(Instant::now())
    }

    pub fn collect_idle_at(&self, now: Instant) -> usize {
        let ttl = self.config().tenant_idle_ttl;
        let removed = self.tenants.retain(|_, q| {
            q.is_blocked(now) || now.saturating_duration_since(q.last_seen) < ttl
        });
        if !removed.is_empty() {
            debug!(count = removed.len(), "Collected idle tenant quotas");
        }
        removed.len()
    }

    /// Set or replace the fairness weight for one tenant
    pub fn set_weight(&self, tenant: &str, weight: f64) -> Result<(), ResilienceError> {
        if weight <= 0.0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "weight for tenant '{tenant}' must be positive, got {weight}"
            )));
        }
        self.write_config(|c| {
            c.weights.insert(tenant.to_string(), weight);
        });
        Ok(())
    }

    pub fn set_capacity(&self, capacity: u64) -> Result<(), ResilienceError> {
        if capacity == 0 {
            return Err(ResilienceError::InvalidConfig(
                "rate limit capacity must be at least 1".to_string(),
            ));
        }
        self.write_config(|c| c.capacity = capacity);
        Ok(())
    }

    /// Replace the whole configuration; tenant state is kept
    pub fn update_config(&self, config: LimiterConfig) -> Result<(), ResilienceError> {
        config.validate()?;
        self.write_config(|c| *c = config);
        Ok(())
    }

    fn write_config(&self, f: impl FnOnce(&mut LimiterConfig)) {
        let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }
}

impl Default for FairShareLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: u64, window_secs: u64, burst_factor: f64) -> LimiterConfig {
        LimiterConfig {
            capacity,
            window: Duration::from_secs(window_secs),
            burst_factor,
            anomaly: AnomalyConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_single_tenant_gets_full_capacity() {
        let limiter = FairShareLimiter::new(config(10, 60, 1.0));
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.admit_at("a", 1, now).is_allowed());
        }
        assert!(!limiter.admit_at("a", 1, now).is_allowed());
        assert_eq!(limiter.usage("a").unwrap().consumed, 10);
    }

    #[test]
    fn test_equal_weights_converge_to_equal_share() {
        let limiter = FairShareLimiter::new(config(300, 300, 1.5));
        let now = Instant::now();
        let tenants = ["a", "b", "c"];
        let mut admitted = [0u32; 3];

        for _ in 0..1000 {
            for (i, t) in tenants.iter().enumerate() {
                if limiter.admit_at(t, 1, now).is_allowed() {
                    admitted[i] += 1;
                }
            }
        }
        for count in admitted {
            assert!((100..=150).contains(&count), "admitted {count}");
        }
        assert!(admitted.iter().sum::<u32>() <= 300 + 150);
    }

    #[test]
    fn test_double_weight_gets_double_share() {
        let mut cfg = config(300, 300, 1.0);
        cfg.weights.insert("gold".to_string(), 2.0);
        let limiter = FairShareLimiter::new(cfg);
        let now = Instant::now();

        let (mut gold, mut basic) = (0, 0);
        for _ in 0..1000 {
            if limiter.admit_at("gold", 1, now).is_allowed() {
                gold += 1;
            }
            if limiter.admit_at("basic", 1, now).is_allowed() {
                basic += 1;
            }
        }
        assert_eq!(gold, 200);
        assert_eq!(basic, 100);
    }

    #[test]
    fn test_denied_then_recovers_after_retry_after() {
        let limiter = FairShareLimiter::new(config(5, 60, 1.0));
        let start = Instant::now();
        for i in 0..5 {
            assert!(limiter.admit_at("a", 1, start + secs(i)).is_allowed());
        }

        let now = start + secs(10);
        let retry_after = match limiter.admit_at("a", 1, now) {
            Admission::Denied {
                retry_after,
                reason: DenyReason::FairShareExceeded,
            } => retry_after,
            other => panic!("expected denial, got {other:?}"),
        };
        // oldest entry (t=0) leaves the window at t=60
        assert_eq!(retry_after, secs(50));

        assert!(!limiter.admit_at("a", 1, now + retry_after - secs(1)).is_allowed());
        assert!(limiter.admit_at("a", 1, now + retry_after).is_allowed());
    }

    #[test]
    fn test_window_slides_instead_of_resetting() {
        let limiter = FairShareLimiter::new(config(4, 10, 1.0));
        let start = Instant::now();
        assert!(limiter.admit_at("a", 2, start).is_allowed());
        assert!(limiter.admit_at("a", 2, start + secs(9)).is_allowed());
        // At t=10 the first entry has expired, the second has not
        assert!(limiter.admit_at("a", 2, start + secs(10)).is_allowed());
        assert!(!limiter.admit_at("a", 1, start + secs(11)).is_allowed());
    }

    #[test]
    fn test_burst_tokens_accrue_below_fair_share() {
        let limiter = FairShareLimiter::new(config(10, 100, 1.5));
        let start = Instant::now();
        // Quiet tenant accrues tokens at fair_share / window = 0.1/s
        assert!(limiter.admit_at("a", 1, start).is_allowed());
        for i in 1..=9 {
            assert!(limiter.admit_at("a", 1, start + secs(50) + Duration::from_millis(i)).is_allowed());
        }
        // 10 consumed, ~5 tokens saved: bursts up to 15
        let at = start + secs(51);
        let mut burst = 0;
        while let Admission::Allowed { burst: true } = limiter.admit_at("a", 1, at) {
            burst += 1;
        }
        assert_eq!(burst, 5);
        assert!(!limiter.admit_at("a", 1, at).is_allowed());
    }

    #[test]
    fn test_saturating_tenant_never_bursts_across_windows() {
        let limiter = FairShareLimiter::new(config(10, 100, 1.5));
        let start = Instant::now();
        for window in 0..6 {
            let at = start + secs(window * 100);
            let mut admitted = 0;
            let mut bursts = 0;
            while let Admission::Allowed { burst } = limiter.admit_at("a", 1, at) {
                admitted += 1;
                if burst {
                    bursts += 1;
                }
            }
            assert_eq!(admitted, 10, "window {window}");
            assert_eq!(bursts, 0, "window {window}");
        }
    }

    #[test]
    fn test_burst_tokens_prorated_to_time_below_share() {
        let limiter = FairShareLimiter::new(config(10, 100, 2.0));
        let start = Instant::now();
        for _ in 0..10 {
            assert!(limiter.admit_at("a", 1, start).is_allowed());
        }
        // Usage drops below the share at t=100 and stays there for 20s
        let at = start + secs(120);
        for _ in 0..10 {
            assert!(limiter.admit_at("a", 1, at).is_allowed());
        }
        let mut burst = 0;
        while let Admission::Allowed { burst: true } = limiter.admit_at("a", 1, at) {
            burst += 1;
        }
        assert_eq!(burst, 2);
    }

    #[test]
    fn test_no_burst_without_savings() {
        let limiter = FairShareLimiter::new(config(10, 100, 2.0));
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.admit_at("a", 1, now).is_allowed());
        }
        assert!(!limiter.admit_at("a", 1, now).is_allowed());
    }

    #[test]
    fn test_share_adapts_when_tenant_goes_idle() {
        let limiter = FairShareLimiter::new(config(100, 10, 1.0));
        let start = Instant::now();
        limiter.admit_at("a", 1, start);
        limiter.admit_at("b", 1, start);
        assert!((limiter.fair_share_at("a", start) - 50.0).abs() < 1e-6);
        // b is no longer active after one window
        assert!((limiter.fair_share_at("a", start + secs(10)) - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_request_larger_than_share_waits_full_window() {
        let limiter = FairShareLimiter::new(config(5, 60, 1.0));
        match limiter.admit_at("a", 10, Instant::now()) {
            Admission::Denied { retry_after, .. } => assert_eq!(retry_after, secs(60)),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn test_anomaly_guard_blocks_key() {
        let mut cfg = config(1_000_000, 300, 1.0);
        cfg.anomaly = AnomalyConfig {
            enabled: true,
            sub_window: secs(1),
            ceiling: 20,
            block_duration: secs(30),
        };
        let limiter = FairShareLimiter::new(cfg);
        let now = Instant::now();

        for _ in 0..20 {
            assert!(limiter.admit_at("ip:10.0.0.9", 1, now).is_allowed());
        }
        assert_eq!(
            limiter.admit_at("ip:10.0.0.9", 1, now),
            Admission::Denied {
                retry_after: secs(30),
                reason: DenyReason::Blocked
            }
        );
        // Other keys are unaffected
        assert!(limiter.admit_at("tenant-b", 1, now).is_allowed());

        match limiter.admit_at("ip:10.0.0.9", 1, now + secs(10)) {
            Admission::Denied { retry_after, reason } => {
                assert_eq!(reason, DenyReason::Blocked);
                assert_eq!(retry_after, secs(20));
            }
            other => panic!("expected block, got {other:?}"),
        }
        assert!(limiter.admit_at("ip:10.0.0.9", 1, now + secs(30)).is_allowed());
    }

    #[test]
    fn test_blocked_key_leaves_active_set() {
        let mut cfg = config(100, 10, 1.0);
        cfg.anomaly = AnomalyConfig {
            enabled: true,
            sub_window: secs(1),
            ceiling: 20,
            block_duration: secs(30),
        };
        let limiter = FairShareLimiter::new(cfg);
        let start = Instant::now();
        assert!(limiter.admit_at("a", 1, start).is_allowed());
        for _ in 0..30 {
            limiter.admit_at("noisy", 1, start);
        }
        assert!(limiter.usage("noisy").unwrap().blocked);
        assert!((limiter.fair_share_at("a", start + secs(1)) - 100.0).abs() < 1e-6);

        // Hammering while blocked does not keep the key active
        for _ in 0..50 {
            assert!(!limiter.admit_at("noisy", 1, start + secs(25)).is_allowed());
        }
        assert!((limiter.fair_share_at("a", start + secs(31)) - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_collect_idle() {
        let mut cfg = config(10, 10, 1.0);
        cfg.tenant_idle_ttl = secs(60);
        let limiter = FairShareLimiter::new(cfg);
        let start = Instant::now();
        limiter.admit_at("a", 1, start);
        limiter.admit_at("b", 1, start + secs(30));

        assert_eq!(limiter.collect_idle_at(start + secs(61)), 1);
        assert_eq!(limiter.tenant_count(), 1);
        assert!(limiter.usage("b").is_some());
    }

    #[test]
    fn test_hot_weight_and_capacity_changes() {
        let limiter = FairShareLimiter::new(config(100, 60, 1.0));
        let now = Instant::now();
        limiter.admit_at("a", 1, now);
        limiter.admit_at("b", 1, now);

        limiter.set_weight("a", 3.0).unwrap();
        assert!((limiter.fair_share_at("a", now) - 75.0).abs() < 1e-6);

        limiter.set_capacity(200).unwrap();
        assert!((limiter.fair_share_at("b", now) - 50.0).abs() < 1e-6);

        assert!(limiter.set_weight("a", 0.0).is_err());
        assert!(limiter.set_capacity(0).is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(LimiterConfig::default().validate().is_ok());
        let mut cfg = LimiterConfig::default();
        cfg.burst_factor = 0.5;
        assert!(cfg.validate().is_err());
        let mut cfg = LimiterConfig::default();
        cfg.weights.insert("x".to_string(), -1.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_into_result() {
        let denied = Admission::Denied {
            retry_after: secs(3),
            reason: DenyReason::FairShareExceeded,
        };
        assert_eq!(
            denied.into_result(),
            Err(ResilienceError::RateLimitExceeded {
                retry_after: secs(3)
            })
        );
        assert!(Admission::Allowed { burst: false }.into_result().is_ok());
    }
}
