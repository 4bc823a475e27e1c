//! Switchyard Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the stateful building blocks the gateway dispatcher
//! consults on every request:
//!
//! - **Circuit Breaker**: Per-backend state machine that fails fast while a backend is down
//! - **Connection Pool**: Slot-accounted connection reuse that scales with utilization
//! - **Fair-Share Rate Limiter**: Weighted per-tenant admission control with burst and anomaly guard
//! - **Sharded Map**: The per-key store all of the above are built on
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - The protocol spoken to backends
//! - How tenants are authenticated
//! - Where registrations are persisted
//!
//! Every store is sharded by key, so requests touching unrelated backends or
//! tenants never contend on the same lock.
//!
//! # Architecture
//!
//! ```text
//!            request (tenant, capability)
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Fair-Share Rate Limiter           │  ← Admission control
//! │  (Sliding window, weighted shares)      │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Breaker Bank                      │  ← Fail-fast protection
//! │  (One breaker per backend)              │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Pool Manager                      │  ← Resource efficiency
//! │  (One adaptive pool per backend)        │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!            Backend
//! ```
//!
//! # Usage Example
//!
//! ## Circuit Breaker
//!
//! ```
//! use switchyard_core_resilience::{BreakerBank, CallOutcome, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let bank = BreakerBank::new(CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     success_threshold: 2,
//!     recovery_timeout: Duration::from_secs(60),
//! });
//!
//! if let Ok(permit) = bank.try_acquire("backend-a") {
//!     // call the backend...
//!     bank.record("backend-a", permit, CallOutcome::Success);
//! }
//! ```
//!
//! ## Fair-Share Rate Limiter
//!
//! ```
//! use switchyard_core_resilience::{Admission, FairShareLimiter, LimiterConfig};
//!
//! let limiter = FairShareLimiter::new(LimiterConfig::default());
//! match limiter.admit("tenant-a", 1) {
//!     Admission::Allowed { .. } => { /* route the request */ }
//!     Admission::Denied { retry_after, .. } => println!("retry in {retry_after:?}"),
//! }
//! ```

pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod rate_limiter;
pub mod shard;

// Re-export main types for convenience
pub use circuit_breaker::{
    BreakerBank, BreakerPermit, BreakerSnapshot, CallOutcome, CircuitBreaker,
    CircuitBreakerConfig, CircuitState,
};
pub use connection_pool::{
    ConnectionFactory, ConnectionPool, Lease, PoolConfig, PoolManager, PoolStats, ScaleDecision,
    ScalingPolicy,
};
pub use error::ResilienceError;
pub use rate_limiter::{
    Admission, AnomalyConfig, DenyReason, FairShareLimiter, LimiterConfig, TenantUsage,
};
pub use shard::ShardedMap;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use switchyard_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{BreakerBank, CallOutcome, CircuitBreakerConfig, CircuitState};
    pub use super::connection_pool::{ConnectionFactory, Lease, PoolConfig, PoolManager};
    pub use super::error::ResilienceError;
    pub use super::rate_limiter::{Admission, FairShareLimiter, LimiterConfig};
}
