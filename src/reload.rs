/*!
 * Configuration hot reload
 *
 * A `notify` watcher on the configuration file's directory triggers a
 * re-read. Tenant weights, limiter capacity, burst factor and the balancing
 * policy take effect immediately; any other difference is logged as needing
 * a restart. A file that fails to parse or validate is rejected and the
 * running configuration stays in place.
 *
 * The reloader remembers what is actually running, not what the file last
 * said: restart-only sections keep their startup values, so reverting the
 * file to them reports nothing.
 */

use notify::{Event, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{GatewayConfig, RateLimitConfig};
use crate::error::{GatewayError, Result};
use crate::router::Router;

/// Quiet period that coalesces the burst of events an editor save produces
const DEBOUNCE: Duration = Duration::from_millis(250);

/// What a reload changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Settings now in effect
    pub applied: Vec<String>,
    /// Sections that changed but only take effect after a restart
    pub restart_required: Vec<String>,
}

impl ReloadReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.restart_required.is_empty()
    }
}

/// Push the live-tunable part of `next` into the running router
///
/// `next` must already be validated.
pub fn apply(current: &GatewayConfig, next: &GatewayConfig, router: &Router) -> Result<ReloadReport> {
    let mut report = ReloadReport::default();

    let (old_rl, new_rl) = (&current.rate_limit, &next.rate_limit);
    let limiter_view = |c: &RateLimitConfig| RateLimitConfig {
        gc_interval_secs: 0,
        ..c.clone()
    };
    if limiter_view(old_rl) != limiter_view(new_rl) {
        router.limiter().update_config(new_rl.to_core())?;
        if old_rl.weights != new_rl.weights || old_rl.default_weight != new_rl.default_weight {
            report.applied.push("rate_limit.weights".to_string());
        }
        if old_rl.capacity != new_rl.capacity {
            report.applied.push("rate_limit.capacity".to_string());
        }
        if old_rl.burst_factor != new_rl.burst_factor {
            report.applied.push("rate_limit.burst_factor".to_string());
        }
        if old_rl.window_secs != new_rl.window_secs {
            report.applied.push("rate_limit.window_secs".to_string());
        }
        if old_rl.tenant_idle_ttl_secs != new_rl.tenant_idle_ttl_secs {
            report.applied.push("rate_limit.tenant_idle_ttl_secs".to_string());
        }
        if old_rl.anomaly != new_rl.anomaly {
            report.applied.push("rate_limit.anomaly".to_string());
        }
    }
    if old_rl.gc_interval_secs != new_rl.gc_interval_secs {
        report
            .restart_required
            .push("rate_limit.gc_interval_secs".to_string());
    }

    if current.router.policy != next.router.policy {
        router.set_policy(next.router.policy);
        report.applied.push("router.policy".to_string());
    }
    let router_rest = |c: &GatewayConfig| {
        let mut r = c.router.clone();
        r.policy = Default::default();
        r
    };
    if router_rest(current) != router_rest(next) {
        report.restart_required.push("router".to_string());
    }

    let mut restart = |name: &str, changed: bool| {
        if changed {
            report.restart_required.push(name.to_string());
        }
    };
    restart("logging", current.logging != next.logging);
    restart("breaker", current.breaker != next.breaker);
    restart("pool", current.pool != next.pool);
    restart("health", current.health != next.health);
    restart("store", current.store != next.store);
    restart("frontend", current.frontend != next.frontend);
    restart("audit", current.audit != next.audit);
    restart("servers", current.servers != next.servers);

    Ok(report)
}

/// `current` with the live-tunable settings of `next` swapped in
fn running_after(current: &GatewayConfig, next: &GatewayConfig) -> GatewayConfig {
    let mut running = current.clone();
    running.rate_limit = RateLimitConfig {
        gc_interval_secs: current.rate_limit.gc_interval_secs,
        ..next.rate_limit.clone()
    };
    running.router.policy = next.router.policy;
    running
}

/// Re-reads one configuration file into a running router
pub struct ConfigReloader {
    path: PathBuf,
    current: Mutex<GatewayConfig>,
    router: Arc<Router>,
}

impl ConfigReloader {
    pub fn new(path: impl Into<PathBuf>, current: GatewayConfig, router: Arc<Router>) -> Self {
        Self {
            path: path.into(),
            current: Mutex::new(current),
            router,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configuration currently in effect
    pub fn current(&self) -> GatewayConfig {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Load the file and apply it; on error the running configuration is kept
    pub fn reload_now(&self) -> Result<ReloadReport> {
        let next = GatewayConfig::load(&self.path)?;
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let report = apply(&current, &next, &self.router)?;
        *current = running_after(&current, &next);
        Ok(report)
    }

    /// Watch the file until `shutdown` fires
    pub fn spawn_watcher(self: Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            let relevant = event.kind.is_modify() || event.kind.is_create();
            let ours = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if relevant && ours {
                let _ = tx.send(());
            }
        })
        .map_err(|e| GatewayError::Config(format!("Failed to create config watcher: {}", e)))?;

        let watch_dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::Config(format!("Failed to watch {}: {}", watch_dir.display(), e)))?;
        info!(path = %self.path.display(), "Watching configuration for changes");

        Ok(tokio::spawn(async move {
            // Dropping the watcher stops notifications
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                    }
                }
                tokio::time::sleep(DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                match self.reload_now() {
                    Ok(report) if report.is_empty() => debug!("Configuration unchanged"),
                    Ok(report) => {
                        if !report.applied.is_empty() {
                            info!(settings = ?report.applied, "Configuration reloaded");
                        }
                        if !report.restart_required.is_empty() {
                            warn!(
                                sections = ?report.restart_required,
                                "Configuration changes require a restart to take effect"
                            );
                        }
                    }
                    Err(e) => error!("Rejected configuration reload, keeping previous: {}", e),
                }
            }
            debug!("Configuration watcher stopped");
        }))
    }
}
