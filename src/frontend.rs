/*!
 * Inbound JSON-lines frontend
 *
 * Each TCP connection carries one JSON request per line:
 *
 * ```text
 * {"id": 1, "tenant": "acme", "capability": "search", "method": "tools/call", "params": {...}, "timeout_ms": 5000}
 * ```
 *
 * and receives one JSON response per line, in completion order:
 *
 * ```text
 * {"id": 1, "result": {...}}
 * {"id": 2, "error": {"code": "RATE_LIMIT_EXCEEDED", "class": "transient", "message": "...", "retry_after_ms": 1200}}
 * ```
 *
 * `tenant` is trusted as-is; an authenticating proxy in front is expected
 * to set it. Requests without one are accounted against the peer IP.
 *
 * Lines longer than the configured limit are skipped with an error
 * response. Requests on a connection are dispatched concurrently. After EOF the
 * connection stays open for writing until in-flight requests complete. If
 * a response cannot be written, or the gateway shuts down, the remaining
 * in-flight requests on that connection are cancelled.
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::router::{Caller, DispatchRequest, Router};

/// Method used when a request names none
pub const DEFAULT_METHOD: &str = "tools/call";

/// Responses buffered per connection before dispatch tasks wait on the writer
const RESPONSE_BUFFER: usize = 64;

/// One inbound request line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendRequest {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub tenant: Option<String>,
    pub capability: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    DEFAULT_METHOD.to_string()
}

/// Error object on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    /// `transient`, `permanent`, `backend`, `client` or `internal`
    pub class: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&GatewayError> for ErrorBody {
    fn from(err: &GatewayError) -> Self {
        Self {
            code: err.code().to_string(),
            class: err.class().to_string(),
            message: err.to_string(),
            retry_after_ms: err
                .retry_after()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            data: err.context(),
        }
    }
}

/// One outbound response line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendResponse {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl FrontendResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: ErrorBody) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Accept connections until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    router: Arc<Router>,
    max_line_bytes: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Frontend listening");
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Connection accepted");
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        router.clone(),
                        max_line_bytes,
                        shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    while connections.join_next().await.is_some() {}
    info!("Frontend stopped");
    Ok(())
}

enum Line {
    Data,
    TooLong,
    Eof,
}

/// Read one line of at most `max` bytes into `buf`
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() != Some(&b'\n') && buf.len() > max {
        return Ok(Line::TooLong);
    }
    Ok(Line::Data)
}

/// Discard input up to and including the next newline
async fn skip_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let len = available.len();
        reader.consume(len);
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    max_line_bytes: usize,
    cancel: CancellationToken,
) {
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::channel::<String>(RESPONSE_BUFFER);
    let writer = tokio::spawn(write_responses(write, rx, cancel.clone()));

    let mut reader = BufReader::new(read);
    let mut inflight = JoinSet::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = read_line(&mut reader, &mut buf, max_line_bytes) => line,
        };
        match line {
            Ok(Line::Eof) => break,
            Ok(Line::TooLong) => {
                if let Err(e) = skip_line(&mut reader).await {
                    debug!(%peer, "Read failed: {}", e);
                    break;
                }
                let err = GatewayError::InvalidRequest(format!(
                    "request line exceeds {} bytes",
                    max_line_bytes
                ));
                send(&tx, &FrontendResponse::failure(Value::Null, ErrorBody::from(&err))).await;
            }
            Ok(Line::Data) => {
                let text = buf.trim_ascii();
                if text.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<FrontendRequest>(text) {
                    Ok(request) => {
                        let router = router.clone();
                        let tx = tx.clone();
                        let cancel = cancel.clone();
                        inflight.spawn(async move {
                            let response = dispatch_one(&router, request, peer.ip(), &cancel).await;
                            send(&tx, &response).await;
                        });
                    }
                    Err(e) => {
                        let err = GatewayError::InvalidRequest(format!("malformed request: {}", e));
                        send(&tx, &FrontendResponse::failure(Value::Null, ErrorBody::from(&err)))
                            .await;
                    }
                }
            }
            Err(e) => {
                debug!(%peer, "Read failed: {}", e);
                break;
            }
        }
        while inflight.try_join_next().is_some() {}
    }

    while inflight.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;
    debug!(%peer, "Connection closed");
}

async fn dispatch_one(
    router: &Router,
    request: FrontendRequest,
    peer: IpAddr,
    cancel: &CancellationToken,
) -> FrontendResponse {
    let id = request.id.unwrap_or(Value::Null);
    let caller = Caller {
        tenant_id: request.tenant.filter(|t| !t.is_empty()),
        peer: Some(peer),
    };
    let mut dispatch = DispatchRequest::new(caller, request.capability, request.method);
    dispatch.params = request.params;
    dispatch.timeout = request.timeout_ms.map(Duration::from_millis);
    dispatch.request_id = match &id {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    };

    match router.dispatch_with_cancel(dispatch, cancel).await {
        Ok(response) => FrontendResponse::success(id, response.result),
        Err(e) => FrontendResponse::failure(id, ErrorBody::from(&e)),
    }
}

async fn send(tx: &mpsc::Sender<String>, response: &FrontendResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            let _ = tx.send(line).await;
        }
        Err(e) => warn!("Failed to serialize response: {}", e),
    }
}

async fn write_responses(
    mut write: OwnedWriteHalf,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = write.write_all(line.as_bytes()).await {
            debug!("Peer went away, cancelling in-flight requests: {}", e);
            cancel.cancel();
            return;
        }
    }
    let _ = write.shutdown().await;
}
