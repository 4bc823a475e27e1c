/*!
 * Error types for Switchyard
 *
 * Every dispatch failure maps to exactly one [`GatewayError`] variant. The
 * protocol layer uses [`GatewayError::code`] and [`GatewayError::class`] to
 * tell clients whether to try again later, give up, or fix their request.
 */

use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use switchyard_core_resilience::{DenyReason, ResilienceError};
use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// One failed attempt against a specific backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    pub server_id: String,
    pub reason: String,
}

/// State of a candidate at the time it was filtered out
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateState {
    pub server_id: String,
    pub breaker: String,
    pub health: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// No registered server declares the capability
    #[error("No registered server provides capability '{capability}'")]
    NoCapableServer { capability: String },

    /// Candidates exist but every one is open, unhealthy or was rejected
    #[error("All servers for capability '{capability}' are unavailable")]
    AllServersUnavailable {
        capability: String,
        considered: Vec<CandidateState>,
        attempts: Vec<AttemptFailure>,
    },

    #[error("Rate limit exceeded for '{tenant}', retry after {}ms", retry_after.as_millis())]
    RateLimitExceeded {
        tenant: String,
        retry_after: Duration,
        reason: DenyReason,
    },

    /// Every candidate tried had no free connection slot
    #[error("Connection pools exhausted for capability '{capability}'")]
    PoolExhausted {
        capability: String,
        attempts: Vec<AttemptFailure>,
    },

    /// Network or timeout failure, after failover was exhausted
    #[error("Transport error talking to '{server_id}': {message}")]
    BackendTransport {
        server_id: String,
        message: String,
        attempts: Vec<AttemptFailure>,
    },

    /// Error returned by a live backend, passed through verbatim
    #[error("Server '{server_id}' returned error {code}: {message}")]
    BackendApplication {
        server_id: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("Request cancelled")]
    Cancelled { server_id: Option<String> },

    #[error("Request deadline of {}ms exceeded", timeout.as_millis())]
    DeadlineExceeded {
        timeout: Duration,
        attempts: Vec<AttemptFailure>,
    },

    #[error("Server '{0}' is already registered")]
    DuplicateName(String),

    #[error("Server not found: {0}")]
    NotFound(String),

    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a client should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Try again later
    Transient,
    /// Will not work until the registry changes
    Permanent,
    /// The backend itself rejected the request
    Backend,
    /// The request or administrative call was wrong
    Client,
    /// Gateway-side fault
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Backend => write!(f, "backend"),
            ErrorClass::Client => write!(f, "client"),
            ErrorClass::Internal => write!(f, "internal"),
        }
    }
}

impl GatewayError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NoCapableServer { .. } => "NO_CAPABLE_SERVER",
            GatewayError::AllServersUnavailable { .. } => "ALL_SERVERS_UNAVAILABLE",
            GatewayError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::PoolExhausted { .. } => "POOL_EXHAUSTED",
            GatewayError::BackendTransport { .. } => "BACKEND_TRANSPORT_ERROR",
            GatewayError::BackendApplication { .. } => "BACKEND_APPLICATION_ERROR",
            GatewayError::Cancelled { .. } => "CANCELLED",
            GatewayError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            GatewayError::DuplicateName(_) => "DUPLICATE_SERVER",
            GatewayError::NotFound(_) => "SERVER_NOT_FOUND",
            GatewayError::InvalidEndpoint { .. } => "INVALID_ENDPOINT",
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Store(_) => "STORE_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::AllServersUnavailable { .. }
            | GatewayError::RateLimitExceeded { .. }
            | GatewayError::PoolExhausted { .. }
            | GatewayError::BackendTransport { .. }
            | GatewayError::DeadlineExceeded { .. } => ErrorClass::Transient,
            GatewayError::NoCapableServer { .. } => ErrorClass::Permanent,
            GatewayError::BackendApplication { .. } => ErrorClass::Backend,
            GatewayError::Cancelled { .. }
            | GatewayError::DuplicateName(_)
            | GatewayError::NotFound(_)
            | GatewayError::InvalidEndpoint { .. }
            | GatewayError::InvalidRequest(_) => ErrorClass::Client,
            GatewayError::Config(_)
            | GatewayError::Store(_)
            | GatewayError::Io(_)
            | GatewayError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Check if the caller may usefully retry later
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Backend that produced or last saw the error, if any
    pub fn server_id(&self) -> Option<&str> {
        match self {
            GatewayError::BackendTransport { server_id, .. }
            | GatewayError::BackendApplication { server_id, .. } => Some(server_id),
            GatewayError::Cancelled { server_id } => server_id.as_deref(),
            _ => None,
        }
    }

    /// Structured debugging context for the wire response
    ///
    /// Application errors carry the backend's own `data` untouched.
    pub fn context(&self) -> Option<Value> {
        match self {
            GatewayError::BackendApplication { data, .. } => data.clone(),
            GatewayError::AllServersUnavailable {
                capability,
                considered,
                attempts,
            } => Some(json!({
                "capability": capability,
                "considered": considered,
                "attempts": attempts,
            })),
            GatewayError::PoolExhausted {
                capability,
                attempts,
            } => Some(json!({ "capability": capability, "attempts": attempts })),
            GatewayError::BackendTransport {
                server_id,
                attempts,
                ..
            } => Some(json!({ "server_id": server_id, "attempts": attempts })),
            GatewayError::DeadlineExceeded { attempts, .. } if !attempts.is_empty() => {
                Some(json!({ "attempts": attempts }))
            }
            GatewayError::RateLimitExceeded { reason, .. } => {
                Some(json!({ "reason": reason.as_str() }))
            }
            GatewayError::NoCapableServer { capability } => {
                Some(json!({ "capability": capability }))
            }
            _ => None,
        }
    }
}

impl From<ResilienceError> for GatewayError {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::InvalidConfig(msg) => GatewayError::Config(msg),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::Config(format!("Failed to parse config: {}", err))
    }
}
