/*!
 * Gateway assembly and background task lifecycle
 *
 * [`Gateway::start`] builds every store from a [`GatewayConfig`], restores
 * persisted registrations, applies the bootstrap `[[servers]]` list and
 * spawns the background tasks:
 *
 * - health monitor
 * - pool maintenance (scaling evaluation, idle pool eviction)
 * - rate limiter garbage collection
 * - audit drain
 *
 * [`Gateway::shutdown`] cancels them all, waits for them and closes the
 * connection pools.
 */

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core_resilience::{BreakerBank, FairShareLimiter, PoolManager, ScaleDecision};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditEmitter, AuditSink, JsonLinesSink, TracingSink};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::frontend;
use crate::health::{self, HealthMonitor, Prober, TransportProber};
use crate::registry::{Registry, ServerRecord, ServerSpec};
use crate::reload::ConfigReloader;
use crate::router::Router;
use crate::store::{JsonFileStore, RegistryStore};
use crate::transport::{BoxedConnection, DefaultTransport, Transport};

/// Replaceable collaborators; unset ones are built from the configuration
#[derive(Default)]
pub struct GatewayOptions {
    pub transport: Option<Arc<dyn Transport>>,
    pub store: Option<Arc<dyn RegistryStore>>,
    pub prober: Option<Arc<dyn Prober>>,
    pub audit_sink: Option<Arc<dyn AuditSink>>,
}

/// A running dispatch engine
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<Registry>,
    breakers: Arc<BreakerBank>,
    pools: Arc<PoolManager<BoxedConnection>>,
    limiter: Arc<FairShareLimiter>,
    router: Arc<Router>,
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Gateway {
    /// Build from `config` and start the background tasks
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(config: GatewayConfig, options: GatewayOptions) -> Result<Self> {
        config.validate()?;

        let transport: Arc<dyn Transport> = match options.transport {
            Some(transport) => transport,
            None => Arc::new(
                DefaultTransport::new(config.router.connect_timeout())
                    .map_err(|e| GatewayError::Internal(e.to_string()))?,
            ),
        };

        let store: Option<Arc<dyn RegistryStore>> = match options.store {
            Some(store) => Some(store),
            None => match &config.store.path {
                Some(path) => Some(Arc::new(JsonFileStore::open(path.clone())?)),
                None => None,
            },
        };
        let registry = Arc::new(match &store {
            Some(store) => Registry::with_store(store.clone()),
            None => Registry::new(),
        });
        if let Some(store) = &store {
            let mut restored = 0;
            for record in store.load()? {
                let id = record.id.clone();
                match registry.restore(record) {
                    Ok(_) => restored += 1,
                    Err(e) => warn!(server_id = %id, "Skipping stored registration: {}", e),
                }
            }
            info!(count = restored, "Restored persisted registrations");
        }
        for spec in config.servers.iter().cloned() {
            match registry.register(spec) {
                Ok(id) => debug!(server_id = %id, "Bootstrap server registered"),
                Err(GatewayError::DuplicateName(name)) => {
                    debug!(%name, "Bootstrap server already registered")
                }
                Err(e) => return Err(e),
            }
        }

        let breakers = Arc::new(BreakerBank::new(config.breaker.to_core()));
        let pools = Arc::new(PoolManager::new(config.pool.to_core()));
        let limiter = Arc::new(FairShareLimiter::new(config.rate_limit.to_core()));
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let mut router = Router::new(
            registry.clone(),
            breakers.clone(),
            pools.clone(),
            limiter.clone(),
            transport.clone(),
            config.router.clone(),
        );
        if config.audit.enabled {
            let (emitter, rx) = AuditEmitter::channel(config.audit.capacity);
            let sink: Arc<dyn AuditSink> = match (options.audit_sink, &config.audit.file) {
                (Some(sink), _) => sink,
                (None, Some(path)) => Arc::new(JsonLinesSink::open(path)?),
                (None, None) => Arc::new(TracingSink),
            };
            tasks.push(("audit", audit::spawn_drain(rx, sink, shutdown.clone())));
            router = router.with_audit(emitter);
        }
        let router = Arc::new(router);

        if config.health.enabled {
            let prober: Arc<dyn Prober> = match options.prober {
                Some(prober) => prober,
                None => Arc::new(TransportProber::new(transport.clone())),
            };
            let monitor = Arc::new(
                HealthMonitor::new(
                    registry.clone(),
                    breakers.clone(),
                    pools.clone(),
                    prober,
                    config.health.clone(),
                )
                .with_balancer(router.balancer().clone()),
            );
            tasks.push(("health", monitor.spawn(shutdown.clone())));
        }

        tasks.push((
            "pool-maintenance",
            spawn_pool_maintenance(
                registry.clone(),
                breakers.clone(),
                pools.clone(),
                config.pool.scale_interval(),
                config.pool.idle_pool_ttl(),
                shutdown.clone(),
            ),
        ));
        tasks.push((
            "limiter-gc",
            spawn_limiter_gc(
                limiter.clone(),
                config.rate_limit.gc_interval(),
                shutdown.clone(),
            ),
        ));

        info!(
            servers = registry.len(),
            policy = router.policy().as_str(),
            "Gateway started"
        );

        Ok(Self {
            config,
            registry,
            breakers,
            pools,
            limiter,
            router,
            shutdown,
            tasks,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerBank> {
        &self.breakers
    }

    pub fn pools(&self) -> &Arc<PoolManager<BoxedConnection>> {
        &self.pools
    }

    pub fn limiter(&self) -> &Arc<FairShareLimiter> {
        &self.limiter
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a server, writing it through to the store off the runtime
    pub async fn register(&self, spec: ServerSpec) -> Result<String> {
        let registry = self.registry.clone();
        let id = tokio::task::spawn_blocking(move || registry.register(spec))
            .await
            .map_err(|e| GatewayError::Internal(format!("registration task failed: {e}")))??;
        // A breaker left behind by an earlier server with this id must not leak its state
        if self.breakers.remove(&id) {
            debug!(server_id = %id, "Cleared stale breaker");
        }
        Ok(id)
    }

    /// Deregister a server and tear down its pool, breaker and balancing state
    pub async fn deregister(&self, id: &str) -> Result<ServerRecord> {
        let registry = self.registry.clone();
        let owned = id.to_string();
        let record = tokio::task::spawn_blocking(move || registry.deregister(&owned))
            .await
            .map_err(|e| GatewayError::Internal(format!("deregistration task failed: {e}")))??;
        health::teardown(id, &self.breakers, &self.pools).await;
        self.router
            .balancer()
            .forget_unserved(&self.registry, &record.capabilities);
        Ok(record)
    }

    /// Serve the JSON-lines frontend on `listener` until shutdown
    pub fn spawn_frontend(&mut self, listener: TcpListener) -> Result<SocketAddr> {
        let addr = listener.local_addr()?;
        let router = self.router.clone();
        let max_line_bytes = self.config.frontend.max_line_bytes;
        let shutdown = self.shutdown.clone();
        self.tasks.push((
            "frontend",
            tokio::spawn(async move {
                if let Err(e) = frontend::serve(listener, router, max_line_bytes, shutdown).await {
                    warn!("Frontend stopped with error: {}", e);
                }
            }),
        ));
        Ok(addr)
    }

    /// Apply live-tunable changes from `path` as the file changes
    pub fn watch_config(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let reloader = Arc::new(ConfigReloader::new(
            path,
            self.config.clone(),
            self.router.clone(),
        ));
        let handle = reloader.spawn_watcher(self.shutdown.clone())?;
        self.tasks.push(("config-watcher", handle));
        Ok(())
    }

    /// Stop background tasks and close every pool
    pub async fn shutdown(self) {
        info!("Gateway shutting down");
        self.shutdown.cancel();
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!(task = name, "Background task failed: {}", e);
            }
        }
        for key in self.pools.keys() {
            self.pools.remove(&key).await;
        }
        info!("Gateway stopped");
    }
}

/// Periodic scaling evaluation and idle pool eviction
fn spawn_pool_maintenance(
    registry: Arc<Registry>,
    breakers: Arc<BreakerBank>,
    pools: Arc<PoolManager<BoxedConnection>>,
    every: Duration,
    idle_ttl: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so pools get a full window
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            for (key, decision) in pools.scale_all().await {
                if decision != ScaleDecision::Hold {
                    debug!(pool = %key, ?decision, "Pool resized");
                }
            }
            for key in pools.keys() {
                if !registry.contains(&key) {
                    pools.remove(&key).await;
                }
            }
            let orphaned = breakers.retain(|id| registry.contains(id));
            if !orphaned.is_empty() {
                debug!(breakers = ?orphaned, "Dropped breakers of deregistered servers");
            }
            let evicted = pools.evict_idle(idle_ttl).await;
            if !evicted.is_empty() {
                debug!(pools = ?evicted, "Evicted idle pools");
            }
        }
        debug!("Pool maintenance stopped");
    })
}

fn spawn_limiter_gc(
    limiter: Arc<FairShareLimiter>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let collected = limiter.collect_idle();
            if collected > 0 {
                debug!(collected, tenants = limiter.tenant_count(), "Collected idle tenant state");
            }
        }
        debug!("Limiter GC stopped");
    })
}
