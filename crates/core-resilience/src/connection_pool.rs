//! Adaptive connection pool for reusable backend connections
//!
//! A pool owns `current_size` connection *slots*. Every slot is either in use
//! (leased to a caller) or idle; an idle slot may hold a cached physical
//! connection or be empty, in which case it is connected lazily the next time
//! it is handed out. Because idle is derived as `current_size - in_use`, the
//! accounting identity `idle + in_use == current_size` cannot drift.
//!
//! Acquire order:
//! 1. an idle slot (cached connection validated first, empty slot connected)
//! 2. a new slot, if `current_size < max_size`
//! 3. wait for a slot to be returned, up to the acquire timeout, then fail
//!    with [`ResilienceError::PoolExhausted`]
//!
//! A periodic evaluator ([`ConnectionPool::sample_utilization`] +
//! [`ConnectionPool::scale`]) grows or shrinks `current_size` from the
//! utilization history, by at most a factor of two per evaluation and never
//! outside `[min_size, max_size]` or below the number of leased slots.

use super::error::ResilienceError;
use super::shard::ShardedMap;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

/// Weight given to the newest sample in the acquire latency average
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Utilization thresholds driving the scaling evaluator
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    /// Grow when every sample in the evaluation window is at or above this
    pub high_water: f64,
    /// Shrink when every sample in the evaluation window is at or below this
    pub low_water: f64,
    /// Multiplier applied on growth (divisor on shrink)
    pub growth_factor: f64,
    /// Number of consecutive samples a decision is based on
    pub evaluation_window: usize,
    /// Samples kept in the utilization ring buffer
    pub history_capacity: usize,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            high_water: 0.8,
            low_water: 0.2,
            growth_factor: 1.5,
            evaluation_window: 5,
            // 24h at one sample per minute
            history_capacity: 1440,
        }
    }
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Slots the pool never shrinks below
    pub min_size: usize,
    /// Hard ceiling on slots
    pub max_size: usize,
    /// Maximum time a cached connection can remain idle before being closed
    pub idle_timeout: Option<Duration>,
    /// Maximum lifetime of a connection
    pub max_lifetime: Option<Duration>,
    /// Default timeout for acquiring a connection from the pool
    pub acquire_timeout: Duration,
    pub scaling: ScalingPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            idle_timeout: Some(Duration::from_secs(300)), // 5 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
            acquire_timeout: Duration::from_secs(5),
            scaling: ScalingPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Check sizes and scaling thresholds for consistency
    pub fn validate(&self) -> Result<(), ResilienceError> {
        let invalid = |msg: String| Err(ResilienceError::InvalidConfig(msg));
        if self.max_size == 0 {
            return invalid("pool max_size must be at least 1".to_string());
        }
        if self.min_size > self.max_size {
            return invalid(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            ));
        }
        let s = &self.scaling;
        if !(0.0..=1.0).contains(&s.low_water) || !(0.0..=1.0).contains(&s.high_water) {
            return invalid("pool water marks must be within 0.0..=1.0".to_string());
        }
        if s.low_water >= s.high_water {
            return invalid(format!(
                "pool low_water ({}) must be below high_water ({})",
                s.low_water, s.high_water
            ));
        }
        if s.growth_factor <= 1.0 {
            return invalid("pool growth_factor must be greater than 1.0".to_string());
        }
        if s.evaluation_window == 0 || s.history_capacity < s.evaluation_window {
            return invalid(
                "pool history_capacity must hold at least one evaluation window".to_string(),
            );
        }
        Ok(())
    }
}

/// Factory trait for creating and validating connections
#[async_trait::async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Create a new connection
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Check if a connection is still fit for reuse
    async fn is_healthy(&self, conn: &T) -> bool;

    /// Close a connection (optional cleanup)
    async fn close(&self, conn: T) {
        drop(conn);
    }
}

/// A cached connection plus lifecycle metadata
#[derive(Debug)]
struct PooledConnection<T> {
    conn: T,
    created_at: Instant,
    last_used: Instant,
}

impl<T> PooledConnection<T> {
    fn new(conn: T) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, config: &PoolConfig, now: Instant) -> bool {
        if let Some(idle_timeout) = config.idle_timeout {
            if now.duration_since(self.last_used) > idle_timeout {
                return true;
            }
        }
        if let Some(max_lifetime) = config.max_lifetime {
            if now.duration_since(self.created_at) > max_lifetime {
                return true;
            }
        }
        false
    }
}

/// Result of one evaluation of the scaling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    Grow { from: usize, to: usize },
    Shrink { from: usize, to: usize },
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub current_size: usize,
    /// Idle slots, cached or empty
    pub idle: usize,
    pub in_use: usize,
    /// Idle slots currently holding a physical connection
    pub cached: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Exponentially weighted acquire latency
    pub avg_acquire_latency_ms: f64,
}

impl PoolStats {
    /// Fraction of slots in use, 0.0 for an empty pool
    pub fn utilization(&self) -> f64 {
        if self.current_size == 0 {
            0.0
        } else {
            self.in_use as f64 / self.current_size as f64
        }
    }
}

struct PoolState<T> {
    current_size: usize,
    in_use: usize,
    /// Physical connections sitting in idle slots, oldest first
    cached: Vec<PooledConnection<T>>,
    history: VecDeque<f64>,
    samples_since_scale: usize,
    avg_acquire_latency_ms: Option<f64>,
    last_activity: Instant,
    closed: bool,
}

impl<T> PoolState<T> {
    fn idle(&self) -> usize {
        self.current_size - self.in_use
    }

    fn utilization(&self) -> f64 {
        if self.current_size == 0 {
            0.0
        } else {
            self.in_use as f64 / self.current_size as f64
        }
    }
}

enum Reserve<T> {
    Cached(PooledConnection<T>),
    Connect,
    Wait,
    Closed,
}

struct PoolShared<T: Send + 'static> {
    name: String,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<T>>,
    state: Mutex<PoolState<T>>,
    notify: Notify,
}

impl<T: Send + 'static> PoolShared<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a slot if one is free, pruning expired cached connections
    fn reserve(&self) -> (Reserve<T>, Vec<PooledConnection<T>>) {
        let now = Instant::now();
        let mut state = self.lock();
        if state.closed {
            return (Reserve::Closed, Vec::new());
        }

        let (expired, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut state.cached)
            .into_iter()
            .partition(|p| p.is_expired(&self.config, now));
        state.cached = fresh;
        state.last_activity = now;

        let step = if state.idle() > 0 {
            state.in_use += 1;
            match state.cached.pop() {
                Some(pooled) => Reserve::Cached(pooled),
                None => Reserve::Connect,
            }
        } else if state.current_size < self.config.max_size {
            state.current_size += 1;
            state.in_use += 1;
            Reserve::Connect
        } else {
            Reserve::Wait
        };
        (step, expired)
    }

    /// Give a leased slot back without a connection
    ///
    /// With `shrink`, the slot itself is removed unless that would take the
    /// pool below `min_size`; otherwise it stays as an empty idle slot.
    fn free_slot(&self, shrink: bool) {
        {
            let mut state = self.lock();
            state.in_use = state.in_use.saturating_sub(1);
            if shrink && state.current_size > self.config.min_size {
                state.current_size -= 1;
            }
            state.last_activity = Instant::now();
        }
        self.notify.notify_one();
    }

    /// Put a healthy connection back into an idle slot
    ///
    /// Returns the connection if the pool was closed in the meantime.
    fn return_slot(&self, conn: T, created_at: Instant) -> Option<T> {
        let leftover = {
            let mut state = self.lock();
            let now = Instant::now();
            state.in_use = state.in_use.saturating_sub(1);
            state.last_activity = now;
            if state.closed {
                Some(conn)
            } else {
                state.cached.push(PooledConnection {
                    conn,
                    created_at,
                    last_used: now,
                });
                None
            }
        };
        self.notify.notify_one();
        leftover
    }

    fn record_acquire_latency(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut state = self.lock();
        state.avg_acquire_latency_ms = Some(match state.avg_acquire_latency_ms {
            Some(avg) => LATENCY_EWMA_ALPHA * sample + (1.0 - LATENCY_EWMA_ALPHA) * avg,
            None => sample,
        });
    }

    fn evaluate(&self) -> (ScaleDecision, Vec<PooledConnection<T>>) {
        let policy = &self.config.scaling;
        let mut state = self.lock();
        let window = policy.evaluation_window;
        if state.closed || state.samples_since_scale < window || state.history.len() < window {
            return (ScaleDecision::Hold, Vec::new());
        }

        let current = state.current_size;
        let all_high = state
            .history
            .iter()
            .rev()
            .take(window)
            .all(|u| *u >= policy.high_water);
        let all_low = state
            .history
            .iter()
            .rev()
            .take(window)
            .all(|u| *u <= policy.low_water);

        if all_high {
            let grown = (current as f64 * policy.growth_factor).ceil() as usize;
            let target = grown
                .min(current.saturating_mul(2))
                .min(self.config.max_size)
                .max(current);
            if target > current {
                state.current_size = target;
                state.samples_since_scale = 0;
                return (
                    ScaleDecision::Grow {
                        from: current,
                        to: target,
                    },
                    Vec::new(),
                );
            }
        } else if all_low {
            let shrunk = (current as f64 / policy.growth_factor).floor() as usize;
            let floor = current
                .div_ceil(2)
                .max(self.config.min_size)
                .max(state.in_use);
            let target = shrunk.max(floor);
            if target < current {
                state.current_size = target;
                state.samples_since_scale = 0;
                let excess = state.cached.len().saturating_sub(state.idle());
                let trimmed = state.cached.drain(..excess).collect();
                return (
                    ScaleDecision::Shrink {
                        from: current,
                        to: target,
                    },
                    trimmed,
                );
            }
        }
        (ScaleDecision::Hold, Vec::new())
    }
}

/// Frees a leased slot when dropped while armed
struct SlotGuard<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
    armed: bool,
}

impl<T: Send + 'static> SlotGuard<T> {
    fn new(shared: Arc<PoolShared<T>>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn disarm(mut self) -> Arc<PoolShared<T>> {
        self.armed = false;
        self.shared.clone()
    }
}

impl<T: Send + 'static> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.free_slot(true);
        }
    }
}

/// A connection leased from a pool
///
/// Hand it back with [`Lease::release`] when the connection is still usable or
/// [`Lease::discard`] when it failed. Dropping a lease counts as a discard, so
/// a cancelled caller never leaks a slot.
pub struct Lease<T: Send + 'static> {
    conn: T,
    created_at: Instant,
    slot: SlotGuard<T>,
}

impl<T: Send + 'static> Lease<T> {
    /// Return the connection to the pool for reuse
    pub async fn release(self) {
        let Lease {
            conn,
            created_at,
            slot,
        } = self;
        let shared = slot.disarm();
        if !shared.factory.is_healthy(&conn).await {
            debug!(pool = %shared.name, "Released connection failed health check");
            shared.factory.close(conn).await;
            shared.free_slot(true);
            return;
        }
        if let Some(conn) = shared.return_slot(conn, created_at) {
            shared.factory.close(conn).await;
        }
    }

    /// Close the connection and free its slot
    pub async fn discard(self) {
        let Lease { conn, slot, .. } = self;
        let shared = slot.disarm();
        shared.factory.close(conn).await;
        shared.free_slot(true);
    }

    /// When the underlying connection was established
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl<T: Send + 'static> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

impl<T: Send + 'static> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.conn
    }
}

impl<T: Send + std::fmt::Debug + 'static> std::fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.slot.shared.name)
            .field("conn", &self.conn)
            .finish()
    }
}

/// A scalable pool of connections to one backend
///
/// # Example
/// ```no_run
/// use switchyard_core_resilience::{ConnectionPool, PoolConfig, ConnectionFactory, ResilienceError};
/// use std::sync::Arc;
///
/// # struct MyConnection { id: usize }
/// struct MyConnectionFactory;
///
/// #[async_trait::async_trait]
/// impl ConnectionFactory<MyConnection> for MyConnectionFactory {
///     async fn create(&self) -> Result<MyConnection, ResilienceError> {
///         Ok(MyConnection { id: 1 })
///     }
///
///     async fn is_healthy(&self, _conn: &MyConnection) -> bool {
///         true
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ConnectionPool::new("backend-a", Arc::new(MyConnectionFactory), PoolConfig::default());
///
/// let conn = pool.acquire().await?;
/// // Use connection...
/// conn.release().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// Create a pool with `min_size` empty slots
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn ConnectionFactory<T>>,
        config: PoolConfig,
    ) -> Self {
        let state = PoolState {
            current_size: config.min_size,
            in_use: 0,
            cached: Vec::new(),
            history: VecDeque::with_capacity(config.scaling.history_capacity.min(64)),
            samples_since_scale: 0,
            avg_acquire_latency_ms: None,
            last_activity: Instant::now(),
            closed: false,
        };
        Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                config,
                factory,
                state: Mutex::new(state),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Acquire with the configured default timeout
    pub async fn acquire(&self) -> Result<Lease<T>, ResilienceError> {
        self.acquire_timeout(self.shared.config.acquire_timeout).await
    }

    /// Acquire a connection, waiting at most `timeout` for a free slot
    ///
    /// Fails with [`ResilienceError::PoolExhausted`] when no slot frees up in
    /// time, or with the factory's error when a connection cannot be
    /// established. Dropping the returned future at any point is safe.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Lease<T>, ResilienceError> {
        let start = Instant::now();
        let deadline = start + timeout;
        let shared = &self.shared;

        loop {
            // Register interest before inspecting state so a release between
            // the check and the wait is not missed.
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (step, expired) = shared.reserve();
            for pooled in expired {
                shared.factory.close(pooled.conn).await;
            }

            let pooled = match step {
                Reserve::Closed => return Err(ResilienceError::PoolClosed),
                Reserve::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(ResilienceError::PoolExhausted {
                            waited: start.elapsed(),
                        });
                    }
                    continue;
                }
                Reserve::Cached(pooled) => {
                    let guard = SlotGuard::new(shared.clone());
                    if shared.factory.is_healthy(&pooled.conn).await {
                        (pooled, guard)
                    } else {
                        debug!(pool = %shared.name, "Replacing unhealthy idle connection");
                        shared.factory.close(pooled.conn).await;
                        (self.connect(deadline, timeout).await?, guard)
                    }
                }
                Reserve::Connect => {
                    let guard = SlotGuard::new(shared.clone());
                    (self.connect(deadline, timeout).await?, guard)
                }
            };

            let (pooled, guard) = pooled;
            shared.record_acquire_latency(start.elapsed());
            return Ok(Lease {
                conn: pooled.conn,
                created_at: pooled.created_at,
                slot: guard,
            });
        }
    }

    async fn connect(
        &self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<PooledConnection<T>, ResilienceError> {
        let conn = tokio::time::timeout_at(deadline, self.shared.factory.create())
            .await
            .map_err(|_| ResilienceError::Timeout(timeout))??;
        Ok(PooledConnection::new(conn))
    }

    /// Return a connection to the pool
    pub async fn release(&self, lease: Lease<T>) {
        lease.release().await;
    }

    /// Close a connection that errored during use
    pub async fn discard(&self, lease: Lease<T>) {
        lease.discard().await;
    }

    /// Slots currently leased out
    pub fn in_use(&self) -> usize {
        self.shared.lock().in_use
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            current_size: state.current_size,
            idle: state.idle(),
            in_use: state.in_use,
            cached: state.cached.len(),
            min_size: self.shared.config.min_size,
            max_size: self.shared.config.max_size,
            avg_acquire_latency_ms: state.avg_acquire_latency_ms.unwrap_or(0.0),
        }
    }

    /// Push the current utilization into the history ring buffer
    pub fn sample_utilization(&self) -> f64 {
        let capacity = self.shared.config.scaling.history_capacity;
        let mut state = self.shared.lock();
        let utilization = state.utilization();
        if state.history.len() == capacity {
            state.history.pop_front();
        }
        state.history.push_back(utilization);
        state.samples_since_scale += 1;
        utilization
    }

    /// Number of utilization samples held
    pub fn history_len(&self) -> usize {
        self.shared.lock().history.len()
    }

    /// Run the scaling policy over the recent utilization history
    pub async fn scale(&self) -> ScaleDecision {
        let (decision, trimmed) = self.shared.evaluate();
        for pooled in trimmed {
            self.shared.factory.close(pooled.conn).await;
        }
        match decision {
            ScaleDecision::Grow { from, to } => {
                info!(pool = %self.shared.name, from, to, "Pool scaled up")
            }
            ScaleDecision::Shrink { from, to } => {
                info!(pool = %self.shared.name, from, to, "Pool scaled down")
            }
            ScaleDecision::Hold => {}
        }
        decision
    }

    /// Time since the last acquire or return
    pub fn idle_for(&self) -> Duration {
        self.shared.lock().last_activity.elapsed()
    }

    /// Close cached connections and fail all current and future acquires
    ///
    /// Leased connections are closed as they come back.
    pub async fn close(&self) {
        let cached = {
            let mut state = self.shared.lock();
            state.closed = true;
            std::mem::take(&mut state.cached)
        };
        self.shared.notify.notify_waiters();
        for pooled in cached {
            self.shared.factory.close(pooled.conn).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// One pool per pool key (normally a backend id)
pub struct PoolManager<T: Send + 'static> {
    config: PoolConfig,
    pools: ShardedMap<Arc<ConnectionPool<T>>>,
}

impl<T: Send + 'static> PoolManager<T> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: ShardedMap::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get the pool for `key`, creating it with a factory from `make` on first use
    pub fn get_or_create(
        &self,
        key: &str,
        make: impl FnOnce() -> Arc<dyn ConnectionFactory<T>>,
    ) -> Arc<ConnectionPool<T>> {
        self.pools.get_or_insert_with(key, || {
            debug!(pool = %key, "Creating connection pool");
            Arc::new(ConnectionPool::new(key, make(), self.config.clone()))
        })
    }

    pub fn get(&self, key: &str) -> Option<Arc<ConnectionPool<T>>> {
        self.pools.get_cloned(key)
    }

    /// Leased connections for `key`, 0 if no pool exists
    pub fn in_use(&self, key: &str) -> usize {
        self.pools.with(key, |p| p.map_or(0, |p| p.in_use()))
    }

    pub fn stats(&self, key: &str) -> Option<PoolStats> {
        self.pools.with(key, |p| p.map(|p| p.stats()))
    }

    /// Tear down the pool for `key`
    pub async fn remove(&self, key: &str) -> bool {
        match self.pools.remove(key) {
            Some(pool) => {
                pool.close().await;
                true
            }
            None => false,
        }
    }

    /// Sample utilization and evaluate scaling for every pool
    pub async fn scale_all(&self) -> Vec<(String, ScaleDecision)> {
        let mut decisions = Vec::new();
        for pool in self.pools.values() {
            pool.sample_utilization();
            let decision = pool.scale().await;
            if decision != ScaleDecision::Hold {
                decisions.push((pool.name().to_string(), decision));
            }
        }
        decisions
    }

    /// Tear down pools with nothing leased and no activity for `ttl`
    pub async fn evict_idle(&self, ttl: Duration) -> Vec<String> {
        let removed = self
            .pools
            .retain(|_, pool| pool.in_use() > 0 || pool.idle_for() < ttl);
        let mut keys = Vec::with_capacity(removed.len());
        for (key, pool) in removed {
            pool.close().await;
            info!(pool = %key, "Evicted idle connection pool");
            keys.push(key);
        }
        keys
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.pools.for_each(|k, _| keys.push(k.to_string()));
        keys
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
