/*!
 * Capability-aware dispatcher
 *
 * `dispatch` runs one request through the engine:
 *
 * 1. fair-share admission for the caller's quota key
 * 2. registry candidates for the capability (tenant-visible, not unhealthy)
 * 3. breaker filter
 * 4. balancing policy orders the survivors
 * 5. walk the order: breaker permit, pooled connection, backend call
 *
 * Transport failures and pool exhaustion move on to the next candidate, up
 * to `1 + max_failover` attempts. Application errors end the dispatch
 * immediately and are returned verbatim. The caller's deadline bounds every
 * wait, and cancellation (explicit, or by dropping the future) records a
 * neutral outcome on the breaker and discards the leased connection.
 */

pub mod balancer;

pub use balancer::{hash_key, BalancePolicy, Balancer};

use serde_json::Value;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core_resilience::{
    Admission, BreakerBank, BreakerPermit, CallOutcome, ConnectionFactory, FairShareLimiter,
    PoolManager, ResilienceError,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::audit::{AuditEmitter, DispatchEvent, RateLimitDecision, OUTCOME_OK};
use crate::config::RouterConfig;
use crate::error::{AttemptFailure, CandidateState, GatewayError, Result};
use crate::registry::{HealthState, Registry, ServerRecord};
use crate::transport::{
    BackendConnection, BoxedConnection, EndpointFactory, InvokeError, Transport,
};

/// Who is calling, as established by the inbound layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    /// Trusted tenant id; `None` for unauthenticated traffic
    pub tenant_id: Option<String>,
    pub peer: Option<IpAddr>,
}

impl Caller {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            peer: None,
        }
    }

    pub fn anonymous(peer: IpAddr) -> Self {
        Self {
            tenant_id: None,
            peer: Some(peer),
        }
    }

    /// Key the rate limiter accounts against
    pub fn quota_key(&self) -> String {
        match (&self.tenant_id, self.peer) {
            (Some(tenant), _) => tenant.clone(),
            (None, Some(peer)) => format!("ip:{peer}"),
            (None, None) => "anonymous".to_string(),
        }
    }
}

/// One capability request
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub caller: Caller,
    pub capability: String,
    /// JSON-RPC method forwarded to the backend
    pub method: String,
    pub params: Option<Value>,
    /// Overall deadline; the router default applies when unset
    pub timeout: Option<Duration>,
    pub request_id: Option<String>,
    /// Admission cost
    pub cost: u64,
}

impl DispatchRequest {
    pub fn new(caller: Caller, capability: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            caller,
            capability: capability.into(),
            method: method.into(),
            params: None,
            timeout: None,
            request_id: None,
            cost: 1,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Key for consistent hashing: tenant plus capability
    pub fn routing_key(&self) -> String {
        format!("{}|{}", self.caller.quota_key(), self.capability)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResponse {
    pub server_id: String,
    pub result: Value,
    /// Backend calls attempted, including the successful one
    pub attempts: u32,
    pub latency: Duration,
}

/// What the dispatch did, for the audit event
struct Trace {
    attempts: u32,
    server_id: Option<String>,
    rate_limit: RateLimitDecision,
}

/// Holds a breaker permit until the attempt resolves
///
/// Dropping it unresolved (the dispatch future was dropped) records a
/// cancellation, which frees a half-open trial slot without counting for or
/// against the backend.
struct AttemptGuard<'a> {
    breakers: &'a BreakerBank,
    server_id: &'a str,
    permit: Option<BreakerPermit>,
}

impl<'a> AttemptGuard<'a> {
    fn new(breakers: &'a BreakerBank, server_id: &'a str, permit: BreakerPermit) -> Self {
        Self {
            breakers,
            server_id,
            permit: Some(permit),
        }
    }

    fn finish(mut self, outcome: CallOutcome) {
        if let Some(permit) = self.permit.take() {
            self.breakers.record(self.server_id, permit, outcome);
        }
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breakers
                .record(self.server_id, permit, CallOutcome::Cancelled);
        }
    }
}

/// Await `fut` unless `cancel` fires first
async fn unless_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Orchestrates registry, breakers, pools and limiter per request
pub struct Router {
    registry: Arc<Registry>,
    breakers: Arc<BreakerBank>,
    pools: Arc<PoolManager<BoxedConnection>>,
    limiter: Arc<FairShareLimiter>,
    transport: Arc<dyn Transport>,
    balancer: Arc<Balancer>,
    audit: AuditEmitter,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        breakers: Arc<BreakerBank>,
        pools: Arc<PoolManager<BoxedConnection>>,
        limiter: Arc<FairShareLimiter>,
        transport: Arc<dyn Transport>,
        config: RouterConfig,
    ) -> Self {
        Self {
            balancer: Arc::new(Balancer::new(config.policy, config.virtual_nodes)),
            registry,
            breakers,
            pools,
            limiter,
            transport,
            audit: AuditEmitter::disabled(),
            config,
        }
    }

    pub fn with_audit(mut self, audit: AuditEmitter) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_balancer(mut self, balancer: Balancer) -> Self {
        self.balancer = Arc::new(balancer);
        self
    }

    /// Balancing state, shared with teardown paths that forget capabilities
    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.balancer
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

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn policy(&self) -> BalancePolicy {
        self.balancer.policy()
    }

    pub fn set_policy(&self, policy: BalancePolicy) {
        self.balancer.set_policy(policy);
    }

    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchResponse> {
        self.dispatch_with_cancel(req, &CancellationToken::new())
            .await
    }

    /// Dispatch, giving up as soon as `cancel` fires
    pub async fn dispatch_with_cancel(
        &self,
        req: DispatchRequest,
        cancel: &CancellationToken,
    ) -> Result<DispatchResponse> {
        let started = Instant::now();
        let tenant = req.caller.quota_key();
        let mut trace = Trace {
            attempts: 0,
            server_id: None,
            rate_limit: RateLimitDecision::Allowed,
        };

        let span = info_span!(
            "dispatch",
            tenant = %tenant,
            capability = %req.capability,
            request_id = req.request_id.as_deref().unwrap_or("-"),
        );
        let result = self
            .run(&req, &tenant, started, cancel, &mut trace)
            .instrument(span)
            .await;

        let (outcome, error) = match &result {
            Ok(_) => (OUTCOME_OK.to_string(), None),
            Err(e) => (e.code().to_string(), Some(e.to_string())),
        };
        let server_id = match &result {
            Ok(resp) => Some(resp.server_id.clone()),
            Err(e) => e.server_id().map(str::to_string).or(trace.server_id),
        };
        self.audit.emit(DispatchEvent {
            timestamp: chrono::Utc::now(),
            request_id: req.request_id.clone(),
            tenant,
            capability: req.capability.clone(),
            method: req.method.clone(),
            breaker_state: server_id
                .as_deref()
                .map(|id| self.breakers.state(id).as_str().to_string()),
            server_id,
            attempts: trace.attempts,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcome,
            rate_limit: trace.rate_limit,
            error,
        });
        result
    }

    async fn run(
        &self,
        req: &DispatchRequest,
        tenant: &str,
        started: Instant,
        cancel: &CancellationToken,
        trace: &mut Trace,
    ) -> Result<DispatchResponse> {
        if req.capability.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "capability must not be empty".to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled { server_id: None });
        }
        let deadline_budget = req.timeout.unwrap_or_else(|| self.config.default_deadline());
        let deadline = started + deadline_budget;

        match self.limiter.admit(tenant, req.cost.max(1)) {
            Admission::Allowed { burst } => {
                if burst {
                    trace.rate_limit = RateLimitDecision::Burst;
                }
            }
            Admission::Denied {
                retry_after,
                reason,
            } => {
                trace.rate_limit = RateLimitDecision::Denied;
                debug!(tenant, reason = reason.as_str(), "Request denied by rate limiter");
                return Err(GatewayError::RateLimitExceeded {
                    tenant: tenant.to_string(),
                    retry_after,
                    reason,
                });
            }
        }

        let tenant_id = req.caller.tenant_id.as_deref();
        let candidates = self.registry.candidates_for(&req.capability, tenant_id);
        if candidates.is_empty() {
            let declared = self.registry.declared_for(&req.capability, tenant_id);
            if declared.is_empty() {
                if !self.registry.has_capability(&req.capability) {
                    self.balancer.forget(&req.capability);
                }
                return Err(GatewayError::NoCapableServer {
                    capability: req.capability.clone(),
                });
            }
            return Err(GatewayError::AllServersUnavailable {
                capability: req.capability.clone(),
                considered: declared.iter().map(|r| self.candidate_state(r)).collect(),
                attempts: Vec::new(),
            });
        }

        let (available, open): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|r| self.breakers.is_available(&r.id));
        let mut considered: Vec<CandidateState> =
            open.iter().map(|r| self.candidate_state(r)).collect();
        if available.is_empty() {
            return Err(GatewayError::AllServersUnavailable {
                capability: req.capability.clone(),
                considered,
                attempts: Vec::new(),
            });
        }

        let ordered = self.balancer.order(
            &req.capability,
            &req.routing_key(),
            available,
            |id| self.pools.in_use(id),
        );

        let budget = 1 + self.config.max_failover;
        let mut tries = 0usize;
        let mut failures: Vec<AttemptFailure> = Vec::new();
        let mut last_transport: Option<(String, String)> = None;
        let mut pool_exhausted = false;

        for server in ordered {
            if tries >= budget {
                break;
            }
            if Instant::now() >= deadline {
                return Err(GatewayError::DeadlineExceeded {
                    timeout: deadline_budget,
                    attempts: failures,
                });
            }

            // Health or membership may have changed since the candidate list
            // was taken.
            match self.registry.health_of(&server.id) {
                None => continue,
                Some(HealthState::Unhealthy) => {
                    considered.push(self.candidate_state(&server));
                    continue;
                }
                Some(_) => {}
            }
            let permit = match self.breakers.try_acquire(&server.id) {
                Ok(permit) => permit,
                Err(_) => {
                    considered.push(self.candidate_state(&server));
                    continue;
                }
            };
            let guard = AttemptGuard::new(&self.breakers, &server.id, permit);
            tries += 1;
            trace.attempts += 1;
            trace.server_id = Some(server.id.clone());
            debug!(server_id = %server.id, attempt = trace.attempts, "Calling backend");

            match self
                .attempt(req, &server, guard, deadline, deadline_budget, cancel)
                .await
            {
                AttemptResult::Done(Ok(mut response)) => {
                    response.attempts = trace.attempts;
                    response.latency = started.elapsed();
                    return Ok(response);
                }
                AttemptResult::Done(Err(GatewayError::DeadlineExceeded { timeout, .. })) => {
                    return Err(GatewayError::DeadlineExceeded {
                        timeout,
                        attempts: failures,
                    });
                }
                AttemptResult::Done(Err(e)) => return Err(e),
                AttemptResult::Exhausted => {
                    debug!(server_id = %server.id, attempt = trace.attempts, "Connection pool exhausted");
                    pool_exhausted = true;
                    failures.push(AttemptFailure {
                        server_id: server.id.clone(),
                        reason: "connection pool exhausted".to_string(),
                    });
                }
                AttemptResult::Transport(message) => {
                    warn!(
                        server_id = %server.id,
                        attempt = trace.attempts,
                        error = %message,
                        "Backend transport failure"
                    );
                    self.registry.report_transport_failure(&server.id);
                    failures.push(AttemptFailure {
                        server_id: server.id.clone(),
                        reason: message.clone(),
                    });
                    last_transport = Some((server.id.clone(), message));
                }
                AttemptResult::Skipped => {
                    considered.push(self.candidate_state(&server));
                }
            }
        }

        if let Some((server_id, message)) = last_transport {
            return Err(GatewayError::BackendTransport {
                server_id,
                message,
                attempts: failures,
            });
        }
        if pool_exhausted {
            return Err(GatewayError::PoolExhausted {
                capability: req.capability.clone(),
                attempts: failures,
            });
        }
        Err(GatewayError::AllServersUnavailable {
            capability: req.capability.clone(),
            considered,
            attempts: failures,
        })
    }

    /// One try against one server, holding its breaker permit
    async fn attempt(
        &self,
        req: &DispatchRequest,
        server: &ServerRecord,
        guard: AttemptGuard<'_>,
        deadline: Instant,
        deadline_budget: Duration,
        cancel: &CancellationToken,
    ) -> AttemptResult {
        let deadline_exceeded = || {
            AttemptResult::Done(Err(GatewayError::DeadlineExceeded {
                timeout: deadline_budget,
                attempts: Vec::new(),
            }))
        };
        let cancelled = || {
            AttemptResult::Done(Err(GatewayError::Cancelled {
                server_id: Some(server.id.clone()),
            }))
        };

        let pool = self.pools.get_or_create(&server.id, || {
            let factory: Arc<dyn ConnectionFactory<BoxedConnection>> = Arc::new(
                EndpointFactory::new(self.transport.clone(), server.endpoint.clone()),
            );
            factory
        });

        // A deregistration that landed after the health check may already
        // have torn down; whatever this attempt recreated is ours to drop.
        if !self.registry.contains(&server.id) {
            guard.finish(CallOutcome::Cancelled);
            self.pools.remove(&server.id).await;
            self.breakers.remove(&server.id);
            debug!(server_id = %server.id, "Server deregistered mid-dispatch");
            return AttemptResult::Skipped;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let acquire_budget = pool.config().acquire_timeout.min(remaining);
        let acquired = unless_cancelled(cancel, pool.acquire_timeout(acquire_budget)).await;
        let mut lease = match acquired {
            None => {
                guard.finish(CallOutcome::Cancelled);
                return cancelled();
            }
            Some(Ok(lease)) => lease,
            Some(Err(ResilienceError::PoolExhausted { .. })) => {
                guard.finish(CallOutcome::Cancelled);
                if Instant::now() >= deadline {
                    return deadline_exceeded();
                }
                return AttemptResult::Exhausted;
            }
            Some(Err(ResilienceError::PoolClosed)) => {
                guard.finish(CallOutcome::Cancelled);
                return AttemptResult::Skipped;
            }
            Some(Err(ResilienceError::Timeout(_))) if Instant::now() >= deadline => {
                guard.finish(CallOutcome::Cancelled);
                return deadline_exceeded();
            }
            Some(Err(e)) => {
                guard.finish(CallOutcome::Failure);
                return AttemptResult::Transport(e.to_string());
            }
        };

        let invoke_timeout = self.config.invoke_timeout();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt_timeout = invoke_timeout.min(remaining);
        let call_started = Instant::now();
        let call = tokio::time::timeout(
            attempt_timeout,
            lease.call(&req.method, req.params.clone()),
        );

        let outcome = unless_cancelled(cancel, call).await;
        match outcome {
            None => {
                guard.finish(CallOutcome::Cancelled);
                lease.discard().await;
                cancelled()
            }
            Some(Ok(Ok(result))) => {
                guard.finish(CallOutcome::Success);
                let latency = call_started.elapsed();
                self.registry
                    .record_response_time(&server.id, latency.as_secs_f64() * 1000.0);
                lease.release().await;
                AttemptResult::Done(Ok(DispatchResponse {
                    server_id: server.id.clone(),
                    result,
                    attempts: 0,
                    latency,
                }))
            }
            Some(Ok(Err(InvokeError::Application {
                code,
                message,
                data,
            }))) => {
                guard.finish(CallOutcome::Success);
                self.registry.record_response_time(
                    &server.id,
                    call_started.elapsed().as_secs_f64() * 1000.0,
                );
                lease.release().await;
                AttemptResult::Done(Err(GatewayError::BackendApplication {
                    server_id: server.id.clone(),
                    code,
                    message,
                    data,
                }))
            }
            Some(Ok(Err(InvokeError::Transport(message)))) => {
                guard.finish(CallOutcome::Failure);
                lease.discard().await;
                AttemptResult::Transport(message)
            }
            Some(Err(_elapsed)) => {
                lease.discard().await;
                if attempt_timeout < invoke_timeout {
                    // The caller's deadline cut the call short
                    guard.finish(CallOutcome::Cancelled);
                    deadline_exceeded()
                } else {
                    guard.finish(CallOutcome::Failure);
                    AttemptResult::Transport(format!(
                        "call timed out after {}ms",
                        invoke_timeout.as_millis()
                    ))
                }
            }
        }
    }

    fn candidate_state(&self, record: &ServerRecord) -> CandidateState {
        CandidateState {
            server_id: record.id.clone(),
            breaker: self.breakers.state(&record.id).as_str().to_string(),
            health: self
                .registry
                .health_of(&record.id)
                .unwrap_or(record.health)
                .as_str()
                .to_string(),
        }
    }
}

enum AttemptResult {
    /// Final answer for the dispatch
    Done(Result<DispatchResponse>),
    /// No pooled connection in time; try the next candidate
    Exhausted,
    /// Network-level failure; try the next candidate
    Transport(String),
    /// Server went away mid-dispatch
    Skipped,
}
