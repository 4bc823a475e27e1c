//! Error types for the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// Circuit breaker is open (or its half-open trial slot is taken)
    #[error("Circuit breaker is open, rejecting requests")]
    CircuitOpen,

    /// No connection slot became free before the acquire timeout
    #[error("Connection pool exhausted after waiting {waited:?}")]
    PoolExhausted {
        /// How long the caller waited before giving up
        waited: Duration,
    },

    /// The pool was torn down while the caller was waiting
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Fair-share quota exhausted for the current window
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Estimated time until the request would be admitted
        retry_after: Duration,
    },

    /// Transient error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Connection creation failed
    #[error("Failed to create connection: {0}")]
    ConnectionCreation(String),

    /// Timeout occurred
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ResilienceError {
    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_)
                | ResilienceError::ConnectionCreation(_)
                | ResilienceError::Timeout(_)
        )
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ResilienceError::Permanent(_) | ResilienceError::InvalidConfig(_)
        )
    }

    /// Check if this error should contribute to circuit breaker failure count
    ///
    /// Local back-pressure (open breaker, pool exhaustion, rate limiting) says
    /// nothing about the backend itself.
    pub fn should_trip_breaker(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_)
                | ResilienceError::ConnectionCreation(_)
                | ResilienceError::Timeout(_)
        )
    }
}
