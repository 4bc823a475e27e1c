/*!
 * Dispatch audit events
 *
 * The router emits one [`DispatchEvent`] per dispatch, whatever the outcome.
 * Emission is fire-and-forget: events go onto a bounded channel with
 * `try_send` and are dropped when the channel is full, so a slow sink can
 * never hold up a request. A drain task moves events from the channel into
 * an [`AuditSink`].
 *
 * # Example
 *
 * ```no_run
 * use std::sync::Arc;
 * use switchyard::audit::{AuditEmitter, TracingSink};
 * use tokio_util::sync::CancellationToken;
 *
 * # async fn demo() {
 * let (emitter, rx) = AuditEmitter::channel(1024);
 * let drain = switchyard::audit::spawn_drain(rx, Arc::new(TracingSink), CancellationToken::new());
 * # }
 * ```
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};

/// Outcome code for a dispatch that returned a result
pub const OUTCOME_OK: &str = "OK";

/// Log target [`TracingSink`] writes under
pub const AUDIT_TARGET: &str = "switchyard::audit";

/// What the rate limiter decided for the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitDecision {
    Allowed,
    /// Admitted using burst tokens
    Burst,
    Denied,
}

/// One dispatch, as seen by the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub timestamp: DateTime<Utc>,

    /// Client-supplied request id, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Tenant id or anonymous `ip:` key
    pub tenant: String,
    pub capability: String,
    pub method: String,

    /// Server that produced the final outcome
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    /// Backend calls actually attempted
    pub attempts: u32,
    pub latency_ms: u64,

    /// `OK` or the error code
    pub outcome: String,

    /// Breaker state of `server_id` after the outcome was recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker_state: Option<String>,

    pub rate_limit: RateLimitDecision,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchEvent {
    pub fn is_success(&self) -> bool {
        self.outcome == OUTCOME_OK
    }
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &DispatchEvent);

    async fn flush(&self) {}
}

/// Logs events under the `switchyard::audit` target
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn record(&self, event: &DispatchEvent) {
        info!(
            target: AUDIT_TARGET,
            tenant = %event.tenant,
            capability = %event.capability,
            method = %event.method,
            server_id = event.server_id.as_deref().unwrap_or("-"),
            attempts = event.attempts,
            latency_ms = event.latency_ms,
            outcome = %event.outcome,
            breaker = event.breaker_state.as_deref().unwrap_or("-"),
            rate_limit = ?event.rate_limit,
            "dispatch"
        );
    }
}

/// Appends one JSON object per line to a file
///
/// Writes go through `tokio::fs`, so the drain task never blocks a runtime
/// worker on disk I/O.
pub struct JsonLinesSink {
    writer: tokio::sync::Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Open for append, creating the file if needed
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                GatewayError::Config(format!(
                    "Failed to open audit log {}: {}",
                    path.display(),
                    e
                ))
            })?;
        Ok(Self {
            writer: tokio::sync::Mutex::new(BufWriter::new(File::from_std(file))),
        })
    }
}

#[async_trait]
impl AuditSink for JsonLinesSink {
    async fn record(&self, event: &DispatchEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        let mut line = line.into_bytes();
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&line).await {
            warn!("Failed to write audit event: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!("Failed to flush audit log: {}", e);
        }
    }

    async fn flush(&self) {
        if let Err(e) = self.writer.lock().await.flush().await {
            warn!("Failed to flush audit log: {}", e);
        }
    }
}

/// Keeps events in memory
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<DispatchEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditSink for CollectingSink {
    async fn record(&self, event: &DispatchEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Non-blocking handle the router emits through
#[derive(Clone)]
pub struct AuditEmitter {
    tx: Option<mpsc::Sender<DispatchEvent>>,
    dropped: Arc<AtomicU64>,
}

impl AuditEmitter {
    /// Emitter plus the receiving end for [`spawn_drain`]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DispatchEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Emitter that discards everything
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: DispatchEvent) {
        let Some(tx) = &self.tx else { return };
        if let Err(e) = tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => debug!("Audit channel full, event dropped"),
                mpsc::error::TrySendError::Closed(_) => debug!("Audit channel closed, event dropped"),
            }
        }
    }

    /// Events dropped because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Move events from `rx` into `sink` until every emitter is gone or
/// `shutdown` fires, then drain what is left and flush
pub fn spawn_drain(
    mut rx: mpsc::Receiver<DispatchEvent>,
    sink: Arc<dyn AuditSink>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => sink.record(&event).await,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    rx.close();
                    while let Some(event) = rx.recv().await {
                        sink.record(&event).await;
                    }
                    break;
                }
            }
        }
        sink.flush().await;
        debug!("Audit drain stopped");
    })
}
