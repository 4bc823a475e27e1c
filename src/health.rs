/*!
 * Background health monitoring
 *
 * Every interval each registered server gets a lightweight liveness probe
 * (after a random jitter so probes do not land together). The result is
 * advisory: it drives `HealthState` in the registry and feeds a passive
 * success into the server's breaker, but never opens a breaker by itself.
 *
 * - probe succeeded: `healthy`, or `degraded` when slower than `degraded_latency`
 * - probe failed: `degraded`, then `unhealthy` after `unhealthy_threshold`
 *   consecutive failures
 * - `evict_after` consecutive failures (when non-zero) deregisters the server
 *   and tears down its pool, breaker and any balancing state left unused
 */

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use switchyard_core_resilience::{BreakerBank, PoolManager};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::GatewayError;
use crate::registry::{HealthState, Registry, ServerRecord};
use crate::router::Balancer;
use crate::transport::{BoxedConnection, InvokeError, Transport, PING_METHOD};

/// Liveness check against one server
#[async_trait]
pub trait Prober: Send + Sync {
    /// `Err` carries a short reason for the log
    async fn probe(&self, server: &ServerRecord) -> Result<(), String>;
}

/// Sends `ping` over a fresh connection, outside the pool
pub struct TransportProber {
    transport: Arc<dyn Transport>,
}

impl TransportProber {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Prober for TransportProber {
    async fn probe(&self, server: &ServerRecord) -> Result<(), String> {
        let mut conn = self
            .transport
            .connect(&server.endpoint)
            .await
            .map_err(|e| e.to_string())?;
        let result = conn.call(PING_METHOD, None).await;
        conn.close().await;
        match result {
            Ok(_) => Ok(()),
            // Any JSON-RPC answer means the backend is alive
            Err(InvokeError::Application { .. }) => Ok(()),
            Err(InvokeError::Transport(message)) => Err(message),
        }
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSweep {
    pub probed: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub evicted: Vec<String>,
}

pub struct HealthMonitor {
    registry: Arc<Registry>,
    breakers: Arc<BreakerBank>,
    pools: Arc<PoolManager<BoxedConnection>>,
    prober: Arc<dyn Prober>,
    config: HealthConfig,
    balancer: Option<Arc<Balancer>>,
    /// Consecutive failed probes per server id
    failures: Mutex<HashMap<String, u32>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<Registry>,
        breakers: Arc<BreakerBank>,
        pools: Arc<PoolManager<BoxedConnection>>,
        prober: Arc<dyn Prober>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            pools,
            prober,
            config,
            balancer: None,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Forget balancing state for capabilities an eviction leaves unserved
    pub fn with_balancer(mut self, balancer: Arc<Balancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn consecutive_failures(&self, id: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Probe until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval_secs,
                probe_timeout_ms = self.config.probe_timeout_ms,
                "Health monitor started"
            );
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    sweep = self.check_all() => {
                        debug!(
                            probed = sweep.probed,
                            healthy = sweep.healthy,
                            degraded = sweep.degraded,
                            unhealthy = sweep.unhealthy,
                            "Health sweep complete"
                        );
                    }
                }
            }
            info!("Health monitor stopped");
        })
    }

    /// Probe every registered server once
    pub async fn check_all(&self) -> HealthSweep {
        let servers = self.registry.list(&Default::default());
        {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            failures.retain(|id, _| servers.iter().any(|s| &s.id == id));
        }

        let results: Vec<(String, HealthState, bool)> = stream::iter(servers)
            .map(|server| self.check_one(server))
            .buffer_unordered(self.config.max_concurrent_probes.max(1))
            .collect()
            .await;

        let mut sweep = HealthSweep {
            probed: results.len(),
            ..HealthSweep::default()
        };
        for (id, state, evicted) in results {
            if evicted {
                sweep.evicted.push(id);
                continue;
            }
            match state {
                HealthState::Healthy => sweep.healthy += 1,
                HealthState::Degraded => sweep.degraded += 1,
                HealthState::Unhealthy => sweep.unhealthy += 1,
                HealthState::Unknown => {}
            }
        }
        sweep
    }

    async fn check_one(&self, server: ServerRecord) -> (String, HealthState, bool) {
        if self.config.jitter_ms > 0 {
            let delay = rand::rng().random_range(0..=self.config.jitter_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.config.probe_timeout(),
            self.prober.probe(&server),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(format!(
                "probe timed out after {}ms",
                self.config.probe_timeout_ms
            )),
        };
        let latency = started.elapsed();

        match outcome {
            Ok(()) => {
                self.set_failures(&server.id, 0);
                let state = if latency >= self.config.degraded_latency() {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                };
                let ms = latency.as_secs_f64() * 1000.0;
                if self.registry.update_health(&server.id, state, Some(ms)).is_ok() {
                    self.breakers.record_passive_success(&server.id);
                }
                (server.id, state, false)
            }
            Err(reason) => {
                let count = self.set_failures(&server.id, 1);
                let state = if count >= self.config.unhealthy_threshold {
                    HealthState::Unhealthy
                } else {
                    HealthState::Degraded
                };
                warn!(
                    server_id = %server.id,
                    failures = count,
                    error = %reason,
                    "Health probe failed"
                );

                if self.config.evict_after > 0 && count >= self.config.evict_after {
                    match self.evict(&server.id).await {
                        Ok(record) => {
                            warn!(server_id = %server.id, failures = count, "Evicting unresponsive server");
                            teardown(&server.id, &self.breakers, &self.pools).await;
                            if let Some(balancer) = &self.balancer {
                                balancer.forget_unserved(&self.registry, &record.capabilities);
                            }
                            self.set_failures(&server.id, 0);
                            return (server.id, HealthState::Unhealthy, true);
                        }
                        Err(e) => debug!(server_id = %server.id, "Eviction skipped: {}", e),
                    }
                }
                if let Err(e) = self.registry.update_health(&server.id, state, None) {
                    debug!(server_id = %server.id, "Health update skipped: {}", e);
                }
                (server.id, state, false)
            }
        }
    }

    /// Deregister on the blocking pool; the store write may touch disk
    async fn evict(&self, id: &str) -> Result<ServerRecord, GatewayError> {
        let registry = self.registry.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || registry.deregister(&id))
            .await
            .map_err(|e| GatewayError::Internal(format!("eviction task failed: {e}")))?
    }

    /// Reset the counter (`delta == 0`) or bump it, returning the new value
    fn set_failures(&self, id: &str, delta: u32) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if delta == 0 {
            failures.remove(id);
            return 0;
        }
        let count = failures.entry(id.to_string()).or_insert(0);
        *count = count.saturating_add(delta);
        *count
    }
}

/// Drop the pool and breaker that belonged to a removed server
///
/// The pool goes first: a lease released after this point finds its pool
/// closed, and its breaker outcome finds no breaker to record into.
pub async fn teardown(id: &str, breakers: &BreakerBank, pools: &PoolManager<BoxedConnection>) {
    if pools.remove(id).await {
        debug!(server_id = %id, "Connection pool closed");
    }
    breakers.remove(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServerSpec;
    use crate::transport::DefaultTransport;
    use serde_json::{json, Value};
    use switchyard_core_resilience::{CallOutcome, CircuitBreakerConfig, PoolConfig};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[derive(Clone)]
    enum Script {
        Up,
        Down,
        Slow(Duration),
    }

    #[derive(Default)]
    struct ScriptedProber {
        scripts: Mutex<HashMap<String, Script>>,
    }

    impl ScriptedProber {
        fn set(&self, id: &str, script: Script) {
            self.scripts.lock().unwrap().insert(id.to_string(), script);
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, server: &ServerRecord) -> Result<(), String> {
            let script = self.scripts.lock().unwrap().get(&server.id).cloned();
            match script.unwrap_or(Script::Down) {
                Script::Up => Ok(()),
                Script::Down => Err("connection refused".into()),
                Script::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
            }
        }
    }

    struct Fixture {
        monitor: HealthMonitor,
        prober: Arc<ScriptedProber>,
        registry: Arc<Registry>,
        breakers: Arc<BreakerBank>,
    }

    fn fixture(config: HealthConfig, ids: &[&str]) -> Fixture {
        let registry = Arc::new(Registry::new());
        for id in ids {
            registry
                .register(
                    ServerSpec::new(format!("tcp://{id}:9000"))
                        .with_id(*id)
                        .with_capability("search"),
                )
                .unwrap();
        }
        let breakers = Arc::new(BreakerBank::new(CircuitBreakerConfig::default()));
        let pools = Arc::new(PoolManager::new(PoolConfig::default()));
        let prober = Arc::new(ScriptedProber::default());
        let monitor = HealthMonitor::new(
            registry.clone(),
            breakers.clone(),
            pools,
            prober.clone(),
            config,
        );
        Fixture {
            monitor,
            prober,
            registry,
            breakers,
        }
    }

    fn quiet() -> HealthConfig {
        HealthConfig {
            jitter_ms: 0,
            ..HealthConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_results_drive_health() {
        let f = fixture(quiet(), &["up", "slow", "down"]);
        f.prober.set("up", Script::Up);
        f.prober.set("slow", Script::Slow(Duration::from_millis(1500)));

        let sweep = f.monitor.check_all().await;
        assert_eq!(sweep.probed, 3);
        assert_eq!(sweep.healthy, 1);
        assert_eq!(sweep.degraded, 2);
        assert_eq!(f.registry.health_of("up"), Some(HealthState::Healthy));
        assert_eq!(f.registry.health_of("slow"), Some(HealthState::Degraded));
        assert_eq!(f.registry.health_of("down"), Some(HealthState::Degraded));
        assert!(f.registry.get("slow").unwrap().avg_response_time_ms >= 1500.0);
        assert!(f.registry.get("up").unwrap().last_health_check.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_mark_unhealthy() {
        let f = fixture(quiet(), &["a"]);
        for _ in 0..2 {
            f.monitor.check_all().await;
            assert_eq!(f.registry.health_of("a"), Some(HealthState::Degraded));
        }
        let sweep = f.monitor.check_all().await;
        assert_eq!(sweep.unhealthy, 1);
        assert_eq!(f.registry.health_of("a"), Some(HealthState::Unhealthy));
        assert_eq!(f.monitor.consecutive_failures("a"), 3);

        f.prober.set("a", Script::Up);
        f.monitor.check_all().await;
        assert_eq!(f.registry.health_of("a"), Some(HealthState::Healthy));
        assert_eq!(f.monitor.consecutive_failures("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let f = fixture(
            HealthConfig {
                probe_timeout_ms: 100,
                ..quiet()
            },
            &["a"],
        );
        f.prober.set("a", Script::Slow(Duration::from_secs(10)));
        f.monitor.check_all().await;
        assert_eq!(f.monitor.consecutive_failures("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_passive_breaker_signal() {
        let f = fixture(quiet(), &["a"]);
        f.prober.set("a", Script::Up);
        f.breakers.record_outcome("a", CallOutcome::Failure);
        f.breakers.record_outcome("a", CallOutcome::Failure);
        assert_eq!(f.breakers.breaker("a").failure_count(), 2);

        f.monitor.check_all().await;
        assert_eq!(f.breakers.breaker("a").failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_after_threshold() {
        let f = fixture(
            HealthConfig {
                evict_after: 2,
                ..quiet()
            },
            &["a", "b"],
        );
        f.prober.set("b", Script::Up);
        f.breakers.breaker("a");

        assert!(f.monitor.check_all().await.evicted.is_empty());
        let sweep = f.monitor.check_all().await;
        assert_eq!(sweep.evicted, vec!["a".to_string()]);
        assert!(!f.registry.contains("a"));
        assert!(f.registry.contains("b"));
        assert!(f.breakers.get("a").is_none());
        assert_eq!(f.monitor.consecutive_failures("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_forgets_unserved_capability() {
        use crate::router::BalancePolicy;

        let f = fixture(
            HealthConfig {
                evict_after: 1,
                ..quiet()
            },
            &["a", "b"],
        );
        f.prober.set("b", Script::Up);
        let balancer = Arc::new(Balancer::new(BalancePolicy::RoundRobin, 16));
        let monitor = f.monitor.with_balancer(balancer.clone());
        balancer.order(
            "search",
            "k",
            f.registry.list(&Default::default()),
            |_| 0,
        );
        assert!(balancer.is_tracking("search"));

        monitor.check_all().await;
        assert!(!f.registry.contains("a"));
        assert!(balancer.is_tracking("search"));

        f.prober.set("b", Script::Down);
        monitor.check_all().await;
        assert!(f.registry.is_empty());
        assert!(!balancer.is_tracking("search"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_stops_on_shutdown() {
        let f = fixture(quiet(), &["a"]);
        f.prober.set("a", Script::Up);
        let monitor = Arc::new(f.monitor);
        let shutdown = CancellationToken::new();
        let handle = monitor.clone().spawn(shutdown.clone());

        while f.registry.health_of("a") != Some(HealthState::Healthy) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();
    }

    async fn spawn_ping_server(reply: Value) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let reply = reply.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let req: Value = serde_json::from_str(&line).unwrap();
                        let mut out = reply.clone();
                        out["jsonrpc"] = json!("2.0");
                        out["id"] = req["id"].clone();
                        let _ = write.write_all(format!("{out}\n").as_bytes()).await;
                    }
                });
            }
        });
        addr
    }

    fn record_for(addr: &str) -> ServerRecord {
        ServerSpec::new(format!("tcp://{addr}"))
            .with_id("ping-target")
            .with_capability("search")
            .into_record()
            .unwrap()
    }

    #[tokio::test]
    async fn test_transport_prober() {
        let transport: Arc<dyn Transport> =
            Arc::new(DefaultTransport::new(Duration::from_secs(1)).unwrap());
        let prober = TransportProber::new(transport);

        let addr = spawn_ping_server(json!({"result": {}})).await;
        assert!(prober.probe(&record_for(&addr)).await.is_ok());

        let addr = spawn_ping_server(json!({"error": {"code": -32601, "message": "nope"}})).await;
        assert!(prober.probe(&record_for(&addr)).await.is_ok());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(prober.probe(&record_for(&closed)).await.is_err());
    }
}
