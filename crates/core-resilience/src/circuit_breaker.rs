//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a backend
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, calls pass through
//! - Open: Backend is failing, calls are rejected without touching the network
//! - HalfOpen: A single trial call is let through to test recovery
//!
//! Failure counting is a plain consecutive-failure counter: any success while
//! closed resets it.
//!
//! Callers take a [`BreakerPermit`] with [`CircuitBreaker::try_acquire`] and hand
//! it back with the call's [`CallOutcome`]. The permit remembers which state
//! generation admitted it, so an outcome that arrives after the breaker has
//! already moved on (for example a slow call admitted while closed that
//! completes after the breaker opened) is discarded instead of corrupting the
//! counters of the new state.

use super::error::ResilienceError;
use super::shard::ShardedMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls fail immediately until `next_probe`
    Open { next_probe: Instant },
    /// Circuit is half-open, one trial at a time tests recovery
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name used in logs, audit events and error context
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: usize,
    /// Number of successes in half-open to close circuit
    pub success_threshold: usize,
    /// Duration to wait before transitioning from open to half-open
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Reject thresholds that would make the state machine degenerate
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "breaker failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "breaker success_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a call made under a breaker permit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The backend answered (including application-level errors)
    Success,
    /// Transport-level failure or timeout
    Failure,
    /// The caller gave up; says nothing about the backend
    Cancelled,
}

/// Proof that a call was admitted by a breaker
///
/// Must be returned through [`CircuitBreaker::record`] once the call resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a permit must be returned with the call outcome"]
pub struct BreakerPermit {
    generation: u64,
    trial: bool,
}

impl BreakerPermit {
    /// True if this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Point-in-time view of a breaker, for diagnostics and error context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: usize,
    pub opened_at: Option<Instant>,
    pub trial_in_flight: bool,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    /// Successes counted while half-open
    consecutive_successes: usize,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped on every state transition
    generation: u64,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            trial_in_flight: false,
            generation: 0,
        }
    }

    fn transition(&mut self, next: CircuitState) {
        self.state = next;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.trial_in_flight = false;
        self.generation += 1;
    }
}

/// Circuit breaker protecting a single backend
///
/// # Example
/// ```no_run
/// use switchyard_core_resilience::{CallOutcome, CircuitBreaker, CircuitBreakerConfig};
///
/// let breaker = CircuitBreaker::new("backend-a", CircuitBreakerConfig::default());
///
/// if let Ok(permit) = breaker.try_acquire() {
///     // ... make the call ...
///     breaker.record(permit, CallOutcome::Success);
/// }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CircuitBreakerState::new()),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Name of the protected backend
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Get current consecutive failure count
    pub fn failure_count(&self) -> usize {
        self.lock().consecutive_failures
    }

    /// Get current half-open success count
    pub fn success_count(&self) -> usize {
        self.lock().consecutive_successes
    }

    /// Capture all counters under one lock
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        BreakerSnapshot {
            state: state.state,
            failure_count: state.consecutive_failures,
            success_count: state.consecutive_successes,
            opened_at: state.opened_at,
            trial_in_flight: state.trial_in_flight,
        }
    }

    /// Would [`try_acquire`](Self::try_acquire) currently admit a call?
    ///
    /// Does not change state. An open breaker whose recovery timeout has
    /// elapsed counts as available, since the next attempt becomes the trial.
    pub fn is_available(&self) -> bool {
        let state = self.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open { next_probe } => Instant::now() >= next_probe,
            CircuitState::HalfOpen => !state.trial_in_flight,
        }
    }

    /// Admit a call or reject it with [`ResilienceError::CircuitOpen`]
    ///
    /// The first caller after the recovery timeout moves the breaker to
    /// half-open and becomes the trial. Everyone else is rejected until the
    /// trial resolves.
    pub fn try_acquire(&self) -> Result<BreakerPermit, ResilienceError> {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => Ok(BreakerPermit {
                generation: state.generation,
                trial: false,
            }),
            CircuitState::Open { next_probe } => {
                if Instant::now() < next_probe {
                    return Err(ResilienceError::CircuitOpen);
                }
                state.transition(CircuitState::HalfOpen);
                state.trial_in_flight = true;
                info!(breaker = %self.name, "Circuit half-open, admitting trial call");
                Ok(BreakerPermit {
                    generation: state.generation,
                    trial: true,
                })
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    return Err(ResilienceError::CircuitOpen);
                }
                state.trial_in_flight = true;
                Ok(BreakerPermit {
                    generation: state.generation,
                    trial: true,
                })
            }
        }
    }

    /// Return a permit together with the outcome of its call
    pub fn record(&self, permit: BreakerPermit, outcome: CallOutcome) {
        let mut state = self.lock();
        if permit.generation != state.generation {
            debug!(
                breaker = %self.name,
                ?outcome,
                "Ignoring outcome from a previous breaker state"
            );
            return;
        }
        if permit.trial {
            state.trial_in_flight = false;
        }
        self.apply(&mut state, outcome);
    }

    /// Record an outcome without a permit, against the current state
    ///
    /// Used for feedback that did not go through [`try_acquire`](Self::try_acquire).
    /// While half-open this resolves any outstanding trial.
    pub fn record_outcome(&self, outcome: CallOutcome) {
        let mut state = self.lock();
        if state.state == CircuitState::HalfOpen && outcome != CallOutcome::Cancelled {
            state.trial_in_flight = false;
        }
        self.apply(&mut state, outcome);
    }

    /// Feed a successful liveness probe into the breaker
    ///
    /// Resets the failure counter while closed and counts toward the success
    /// threshold while half-open. An open breaker ignores it; only the
    /// recovery timeout reopens the path to traffic.
    pub fn record_passive_success(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => state.consecutive_failures = 0,
            CircuitState::HalfOpen => self.count_half_open_success(&mut state),
            CircuitState::Open { .. } => {}
        }
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let mut state = self.lock();
        state.transition(CircuitState::Closed);
        state.opened_at = None;
    }

    fn apply(&self, state: &mut CircuitBreakerState, outcome: CallOutcome) {
        match (state.state, outcome) {
            (_, CallOutcome::Cancelled) => {}
            (CircuitState::Closed, CallOutcome::Success) => {
                state.consecutive_failures = 0;
            }
            (CircuitState::Closed, CallOutcome::Failure) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = state.consecutive_failures,
                        "Circuit opened"
                    );
                    self.open(state);
                }
            }
            (CircuitState::HalfOpen, CallOutcome::Success) => {
                self.count_half_open_success(state);
            }
            (CircuitState::HalfOpen, CallOutcome::Failure) => {
                warn!(breaker = %self.name, "Trial call failed, circuit reopened");
                self.open(state);
            }
            (CircuitState::Open { .. }, _) => {}
        }
    }

    fn count_half_open_success(&self, state: &mut CircuitBreakerState) {
        state.consecutive_successes += 1;
        if state.consecutive_successes >= self.config.success_threshold {
            info!(breaker = %self.name, "Circuit closed");
            state.transition(CircuitState::Closed);
            state.opened_at = None;
        }
    }

    fn open(&self, state: &mut CircuitBreakerState) {
        let now = Instant::now();
        state.transition(CircuitState::Open {
            next_probe: now + self.config.recovery_timeout,
        });
        state.opened_at = Some(now);
    }
}

/// One lazily created breaker per backend id
#[derive(Debug)]
pub struct BreakerBank {
    config: CircuitBreakerConfig,
    breakers: ShardedMap<Arc<CircuitBreaker>>,
}

impl BreakerBank {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: ShardedMap::new(),
        }
    }

    /// Configuration applied to newly created breakers
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the breaker for `id`, creating it on first use
    pub fn breaker(&self, id: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_insert_with(id, || {
            Arc::new(CircuitBreaker::new(id, self.config.clone()))
        })
    }

    /// Get the breaker for `id` if one exists
    pub fn get(&self, id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get_cloned(id)
    }

    /// A backend nobody has called yet is available
    pub fn is_available(&self, id: &str) -> bool {
        self.get(id).map_or(true, |b| b.is_available())
    }

    /// Current state, `Closed` for backends without a breaker yet
    pub fn state(&self, id: &str) -> CircuitState {
        self.get(id).map_or(CircuitState::Closed, |b| b.state())
    }

    pub fn try_acquire(&self, id: &str) -> Result<BreakerPermit, ResilienceError> {
        self.breaker(id).try_acquire()
    }

    pub fn record(&self, id: &str, permit: BreakerPermit, outcome: CallOutcome) {
        if let Some(breaker) = self.get(id) {
            breaker.record(permit, outcome);
        }
    }

    /// Record an outcome for `id` without a permit
    pub fn record_outcome(&self, id: &str, outcome: CallOutcome) {
        self.breaker(id).record_outcome(outcome);
    }

    /// Passive probe success; no-op for backends without a breaker
    pub fn record_passive_success(&self, id: &str) {
        if let Some(breaker) = self.get(id) {
            breaker.record_passive_success();
        }
    }

    /// Tear down the breaker for a removed backend
    pub fn remove(&self, id: &str) -> bool {
        self.breakers.remove(id).is_some()
    }

    /// Drop breakers whose id fails `keep`, returning the removed ids
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> Vec<String> {
        self.breakers
            .retain(|id, _| keep(id))
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for BreakerBank {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
