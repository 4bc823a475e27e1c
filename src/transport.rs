/*!
 * Backend transports
 *
 * Every backend speaks JSON-RPC 2.0. Two framings are supported:
 *
 * - `tcp://host:port`: one request per line over a persistent stream,
 *   responses matched by id (the MCP stream style); a response line longer
 *   than [`MAX_RESPONSE_LINE_BYTES`] breaks the connection
 * - `http(s)://...`: the envelope is POSTed and the response body parsed
 *
 * The split that matters to the router is [`InvokeError`]: transport
 * failures trip breakers and fail over, application errors are the
 * backend's answer and go back to the caller as-is.
 */

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core_resilience::{ConnectionFactory, ResilienceError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, trace};

use crate::registry::{Endpoint, TransportKind};

/// MCP liveness method
pub const PING_METHOD: &str = "ping";

/// Longest response line accepted from a TCP backend
pub const MAX_RESPONSE_LINE_BYTES: usize = 8 * 1024 * 1024;

const JSONRPC_VERSION: &str = "2.0";

/// Outcome of a failed backend call
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvokeError {
    /// I/O, framing, closed connection, gateway-class HTTP status
    #[error("transport failure: {0}")]
    Transport(String),

    /// JSON-RPC error object from a live backend
    #[error("backend error {code}: {message}")]
    Application {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl InvokeError {
    pub fn is_transport(&self) -> bool {
        matches!(self, InvokeError::Transport(_))
    }
}

/// Failure to establish a connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// An established connection to one backend
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Issue one JSON-RPC call and wait for its response
    async fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value, InvokeError>;

    /// False once the connection is known to be unusable
    fn is_reusable(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

pub type BoxedConnection = Box<dyn BackendConnection>;

/// Opens connections for endpoints
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedConnection, TransportError>;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl JsonRpcResponse {
    fn into_result(self) -> Result<Value, InvokeError> {
        match (self.error, self.result) {
            (Some(err), _) => Err(InvokeError::Application {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            (None, Some(result)) => Ok(result),
            (None, None) => Err(InvokeError::Transport(
                "response carries neither result nor error".to_string(),
            )),
        }
    }
}

/// Newline-delimited JSON-RPC over TCP
pub struct TcpConnection {
    lines: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: OwnedWriteHalf,
    next_id: u64,
    broken: bool,
}

impl TcpConnection {
    pub async fn connect(addr: &str) -> io::Result<Self> {
        Self::connect_with_limit(addr, MAX_RESPONSE_LINE_BYTES).await
    }

    /// Connect, refusing response lines longer than `max_line_bytes`
    pub async fn connect_with_limit(addr: &str, max_line_bytes: usize) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: FramedRead::new(read, LinesCodec::new_with_max_length(max_line_bytes)),
            writer: write,
            next_id: 1,
            broken: false,
        })
    }

    fn fail(&mut self, message: String) -> InvokeError {
        self.broken = true;
        InvokeError::Transport(message)
    }

    async fn exchange(&mut self, id: u64, line: String) -> Result<Value, InvokeError> {
        if let Err(e) = self.writer.write_all(line.as_bytes()).await {
            return Err(self.fail(format!("write failed: {e}")));
        }
        if let Err(e) = self.writer.flush().await {
            return Err(self.fail(format!("flush failed: {e}")));
        }

        loop {
            let line = match self.lines.next().await {
                Some(Ok(line)) => line,
                None => return Err(self.fail("connection closed by backend".to_string())),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(self.fail("response line exceeds the size limit".to_string()))
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    return Err(self.fail(format!("read failed: {e}")))
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let response: JsonRpcResponse = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => return Err(self.fail(format!("malformed response: {e}"))),
            };
            // Server-initiated requests and notifications, or a reply to a
            // call abandoned earlier on this connection.
            if response.method.is_some() || response.id != Some(Value::from(id)) {
                trace!(received = ?response.id, expected = id, "Skipping unrelated message");
                continue;
            }
            return response.into_result();
        }
    }
}

#[async_trait]
impl BackendConnection for TcpConnection {
    async fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value, InvokeError> {
        if self.broken {
            return Err(InvokeError::Transport("connection is broken".to_string()));
        }
        let id = self.next_id;
        self.next_id += 1;

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| InvokeError::Transport(format!("failed to encode request: {e}")))?;
        line.push('\n');
        self.exchange(id, line).await
    }

    fn is_reusable(&self) -> bool {
        !self.broken
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// JSON-RPC POSTed to an HTTP endpoint
pub struct HttpConnection {
    client: reqwest::Client,
    url: String,
    next_id: u64,
}

impl HttpConnection {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            next_id: 1,
        }
    }
}

#[async_trait]
impl BackendConnection for HttpConnection {
    async fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value, InvokeError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| InvokeError::Transport(format!("request failed: {e}")))?;

        let status = response.status();
        if matches!(status.as_u16(), 502..=504) {
            return Err(InvokeError::Transport(format!("upstream returned {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| InvokeError::Transport(format!("failed to read body: {e}")))?;

        match serde_json::from_str::<JsonRpcResponse>(&body) {
            Ok(rpc) => rpc.into_result(),
            Err(_) if !status.is_success() => Err(InvokeError::Application {
                code: i64::from(status.as_u16()),
                message: format!("HTTP {status}"),
                data: (!body.is_empty()).then(|| Value::String(body)),
            }),
            Err(e) => Err(InvokeError::Transport(format!("malformed response: {e}"))),
        }
    }
}

/// Connects TCP endpoints with a connect timeout and HTTP endpoints
/// through one shared `reqwest` client
#[derive(Clone)]
pub struct DefaultTransport {
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl DefaultTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self {
            http,
            connect_timeout,
        })
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedConnection, TransportError> {
        match endpoint.transport() {
            TransportKind::Tcp => {
                let addr = endpoint.authority();
                let connect_err = |source| TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                };
                let conn = tokio::time::timeout(self.connect_timeout, TcpConnection::connect(&addr))
                    .await
                    .map_err(|_| connect_err(io::Error::from(io::ErrorKind::TimedOut)))?
                    .map_err(connect_err)?;
                debug!(endpoint = %endpoint, "TCP connection established");
                Ok(Box::new(conn))
            }
            TransportKind::Http => Ok(Box::new(HttpConnection::new(
                self.http.clone(),
                endpoint.url().as_str(),
            ))),
        }
    }
}

/// Pool factory producing connections to one backend
pub struct EndpointFactory {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
}

impl EndpointFactory {
    pub fn new(transport: Arc<dyn Transport>, endpoint: Endpoint) -> Self {
        Self {
            transport,
            endpoint,
        }
    }
}

#[async_trait]
impl ConnectionFactory<BoxedConnection> for EndpointFactory {
    async fn create(&self) -> Result<BoxedConnection, ResilienceError> {
        self.transport
            .connect(&self.endpoint)
            .await
            .map_err(|e| ResilienceError::ConnectionCreation(e.to_string()))
    }

    async fn is_healthy(&self, conn: &BoxedConnection) -> bool {
        conn.is_reusable()
    }

    async fn close(&self, mut conn: BoxedConnection) {
        conn.close().await;
    }
}
