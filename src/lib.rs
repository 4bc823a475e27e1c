/*!
 * Switchyard - capability-aware MCP gateway dispatch engine
 *
 * Routes capability requests from many tenants to a fleet of MCP backend
 * servers:
 * - Fair-share rate limiting with burst tokens and an anomaly guard
 * - Per-server circuit breakers with a single half-open trial
 * - Adaptive per-server connection pools
 * - Background health probing
 * - Pluggable load-balancing policies with bounded failover
 *
 * The resilience primitives live in `switchyard-core-resilience`; this crate
 * adds the registry, router, backend transports, persistence, audit events,
 * configuration and the JSON-lines frontend.
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod frontend;
pub mod health;
pub mod logging;
pub mod registry;
pub mod reload;
pub mod router;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use config::GatewayConfig;
pub use engine::{Gateway, GatewayOptions};
pub use error::{ErrorClass, GatewayError, Result};
pub use registry::{Endpoint, HealthState, Registry, ServerRecord, ServerSpec};
pub use router::{BalancePolicy, Caller, DispatchRequest, DispatchResponse, Router};
pub use switchyard_core_resilience as resilience;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
