// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding calls into the external store.
//!
//! Wraps async operations with a deadline and tracks outcomes. Once enough
//! calls have been observed and the failure ratio crosses the configured
//! rate, the breaker trips and further calls fail fast until the recovery
//! timeout elapses.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Store unhealthy, requests fail fast (or take the fallback)
//! - HalfOpen: Exactly one trial request decides between Closed and Open
//!
//! ```text
//! Closed ──(total ≥ threshold && failures/total ≥ rate)──▶ Open
//! Open ──(now ≥ next_attempt_at, next call)──▶ HalfOpen
//! HalfOpen ──(trial ok)──▶ Closed (counters reset)
//! HalfOpen ──(trial fails)──▶ Open
//! ```
//!
//! The error rate is cumulative since the last reset, not windowed.
//!
//! Every state change starts a new generation. A call's outcome only moves
//! counters and state if the breaker is still in the generation that
//! admitted it, so a slow call from before a trip cannot decide a later
//! trial.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::monitoring::MonitoringService;
use crate::storage::traits::StoreError;

/// Name of the breaker guarding the store connection.
pub const REDIS_CIRCUIT: &str = "redis";

/// Name of the breaker guarding invalidation traffic (scans, bulk deletes,
/// event delivery).
pub const INVALIDATION_CIRCUIT: &str = "invalidation";

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Rejected without calling the store
    #[error("circuit breaker '{circuit}' open, request rejected")]
    Open { circuit: String },

    /// The call did not finish before the deadline; counted as a failure
    #[error("circuit breaker '{circuit}': operation timed out after {timeout:?}")]
    Timeout { circuit: String, timeout: Duration },

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitConfig {
    /// Minimum calls observed before the breaker may trip
    pub failure_threshold: u32,
    /// How long to stay open before admitting a trial call
    pub recovery_timeout: Duration,
    /// Failure ratio (0.0 - 1.0) at or above which the breaker trips
    pub expected_error_rate: f64,
    /// Per-call deadline
    pub call_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            expected_error_rate: 0.5,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl CircuitConfig {
    /// Tighter preset for the remote store: trips after fewer calls and
    /// tries recovery sooner.
    #[must_use]
    pub fn redis() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            expected_error_rate: 0.5,
            call_timeout: Duration::from_secs(5),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(50),
            expected_error_rate: 0.5,
            call_timeout: Duration::from_secs(1),
        }
    }
}

/// Full breaker record, as exposed to reports.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub timeout_count: u64,
    /// Unix millis
    pub last_failure_at: Option<u64>,
    /// Unix millis
    pub last_success_at: Option<u64>,
    /// Remaining wait before a trial call is admitted
    pub next_attempt_in_ms: Option<u64>,
    pub calls_total: u64,
    pub rejections: u64,
    pub config: CircuitConfig,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    timeout_count: u64,
    last_failure_at: Option<SystemTime>,
    last_success_at: Option<SystemTime>,
    next_attempt_at: Option<Instant>,
    /// Id of the trial call currently admitted in HalfOpen
    trial: Option<u64>,
    next_trial_id: u64,
    /// Bumped on every state change
    generation: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            timeout_count: 0,
            last_failure_at: None,
            last_success_at: None,
            next_attempt_at: None,
            trial: None,
            next_trial_id: 0,
            generation: 0,
        }
    }

    fn reset_counters(&mut self) {
        self.failure_count = 0;
        self.success_count = 0;
        self.timeout_count = 0;
    }

    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.generation += 1;
    }
}

/// Admission of one call: the generation it was admitted in, and its trial
/// id when admitted in HalfOpen. Dropping a trial permit before it reports
/// frees the trial slot, so an abandoned call cannot wedge the breaker.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: Option<u64>,
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.trial {
            let mut inner = self.breaker.inner.lock();
            if inner.trial == Some(id) {
                inner.trial = None;
            }
        }
    }
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: RwLock<CircuitConfig>,
    inner: Mutex<Inner>,
    monitor: Option<Arc<MonitoringService>>,

    calls_total: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config: RwLock::new(config),
            inner: Mutex::new(Inner::new()),
            monitor: None,
            calls_total: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Report every call outcome to the monitoring service as `circuit:{name}`.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<MonitoringService>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn config(&self) -> CircuitConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. Counters and state are kept.
    pub fn update_config(&self, config: CircuitConfig) {
        debug!(circuit = %self.name, ?config, "Circuit config updated");
        *self.config.write() = config;
    }

    /// Trip the breaker regardless of counters.
    pub fn force_open(&self) {
        let recovery = self.config.read().recovery_timeout;
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Open);
        inner.next_attempt_at = Some(Instant::now() + recovery);
        inner.trial = None;
        drop(inner);
        warn!(circuit = %self.name, "Circuit forced open");
        crate::metrics::set_circuit_state(&self.name, CircuitState::Open as u8);
    }

    /// Close the breaker and reset its counters.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed);
        inner.next_attempt_at = None;
        inner.trial = None;
        inner.reset_counters();
        drop(inner);
        info!(circuit = %self.name, "Circuit forced closed");
        crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
    }

    /// Returns None if the call must be rejected.
    fn admit(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(CallPermit { breaker: self, generation: inner.generation, trial: None }),
            CircuitState::Open => {
                let due = inner.next_attempt_at.map_or(true, |at| Instant::now() >= at);
                if !due {
                    return None;
                }
                inner.transition(CircuitState::HalfOpen);
                let id = inner.next_trial_id;
                inner.next_trial_id += 1;
                inner.trial = Some(id);
                let generation = inner.generation;
                drop(inner);
                info!(circuit = %self.name, "Circuit half-open, admitting trial call");
                crate::metrics::set_circuit_state(&self.name, CircuitState::HalfOpen as u8);
                Some(CallPermit { breaker: self, generation, trial: Some(id) })
            }
            CircuitState::HalfOpen => {
                if inner.trial.is_some() {
                    return None;
                }
                // Previous trial was abandoned before reporting
                let id = inner.next_trial_id;
                inner.next_trial_id += 1;
                inner.trial = Some(id);
                Some(CallPermit { breaker: self, generation: inner.generation, trial: Some(id) })
            }
        }
    }

    fn on_success(&self, permit: &CallPermit<'_>) {
        let mut inner = self.inner.lock();
        inner.last_success_at = Some(SystemTime::now());
        if inner.generation != permit.generation {
            debug!(circuit = %self.name, "Ignoring success from an earlier circuit state");
            return;
        }
        inner.success_count += 1;
        if inner.state == CircuitState::HalfOpen {
            inner.transition(CircuitState::Closed);
            inner.next_attempt_at = None;
            inner.trial = None;
            inner.reset_counters();
            drop(inner);
            info!(circuit = %self.name, "Circuit closed after successful trial");
            crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
        }
    }

    fn on_failure(&self, permit: &CallPermit<'_>, timed_out: bool) {
        let config = self.config.read().clone();
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(SystemTime::now());
        if inner.generation != permit.generation {
            debug!(circuit = %self.name, "Ignoring failure from an earlier circuit state");
            return;
        }
        inner.failure_count += 1;
        if timed_out {
            inner.timeout_count += 1;
        }

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                let total = inner.failure_count + inner.success_count;
                let rate = inner.failure_count as f64 / total as f64;
                total >= u64::from(config.failure_threshold) && rate >= config.expected_error_rate
            }
            CircuitState::Open => false,
        };

        if trip {
            inner.transition(CircuitState::Open);
            inner.next_attempt_at = Some(Instant::now() + config.recovery_timeout);
            inner.trial = None;
            let failures = inner.failure_count;
            let successes = inner.success_count;
            drop(inner);
            warn!(
                circuit = %self.name,
                failures,
                successes,
                recovery = ?config.recovery_timeout,
                "Circuit breaker tripped open"
            );
            crate::metrics::set_circuit_state(&self.name, CircuitState::Open as u8);
        }
    }

    fn report(&self, started: Instant, success: bool) {
        if let Some(monitor) = &self.monitor {
            monitor.record_operation(&format!("circuit:{}", self.name), started.elapsed(), success);
        }
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure that returns a Future, so nothing runs when the
    /// circuit rejects the call.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let Some(permit) = self.admit() else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(circuit = %self.name, "Circuit breaker rejected call (open)");
            crate::metrics::record_circuit_call(&self.name, "rejected");
            return Err(CircuitError::Open { circuit: self.name.clone() });
        };

        let timeout = self.config.read().call_timeout;
        let started = Instant::now();

        match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(value)) => {
                self.on_success(&permit);
                crate::metrics::record_circuit_call(&self.name, "success");
                self.report(started, true);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure(&permit, false);
                crate::metrics::record_circuit_call(&self.name, "failure");
                self.report(started, false);
                Err(CircuitError::Inner(e))
            }
            Err(_) => {
                // The abandoned future is dropped here; any in-flight
                // request completes in the background and is discarded.
                self.on_failure(&permit, true);
                warn!(circuit = %self.name, ?timeout, "Circuit call timed out");
                crate::metrics::record_circuit_call(&self.name, "timeout");
                self.report(started, false);
                Err(CircuitError::Timeout { circuit: self.name.clone(), timeout })
            }
        }
    }

    /// Like [`call`](Self::call), but hands any breaker error to `fallback`.
    ///
    /// The fallback runs after breaker bookkeeping, so its outcome never
    /// affects state, and its error is returned as-is.
    pub async fn call_or_else<F, Fut, FB, FbFut, T, E, FE>(&self, f: F, fallback: FB) -> Result<T, FE>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(CircuitError<E>) -> FbFut,
        FbFut: Future<Output = Result<T, FE>>,
    {
        match self.call(f).await {
            Ok(value) => Ok(value),
            Err(err) => fallback(err).await,
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.inner.lock().failure_count
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.inner.lock().success_count
    }

    /// Failure ratio since the last reset (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let inner = self.inner.lock();
        let total = inner.failure_count + inner.success_count;
        if total == 0 {
            return 0.0;
        }
        inner.failure_count as f64 / total as f64
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let config = self.config();
        let inner = self.inner.lock();
        let now = Instant::now();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            timeout_count: inner.timeout_count,
            last_failure_at: inner.last_failure_at.map(unix_millis),
            last_success_at: inner.last_success_at.map(unix_millis),
            next_attempt_in_ms: inner
                .next_attempt_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            calls_total: self.calls_total(),
            rejections: self.rejections(),
            config,
        }
    }
}

impl From<CircuitError<StoreError>> for StoreError {
    fn from(err: CircuitError<StoreError>) -> Self {
        match err {
            CircuitError::Inner(e) => e,
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Run a store call through `breaker` when there is one, directly otherwise.
pub async fn guarded<F, Fut, T>(breaker: Option<&CircuitBreaker>, f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match breaker {
        Some(breaker) => breaker.call(f).await.map_err(StoreError::from),
        None => f().await,
    }
}

fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
}

/// Process-wide set of named breakers, each independently configured.
pub struct CircuitRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: RwLock<CircuitConfig>,
    monitor: Option<Arc<MonitoringService>>,
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl CircuitRegistry {
    pub fn new(defaults: CircuitConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults: RwLock::new(defaults),
            monitor: None,
        }
    }

    /// Breakers created from now on report to `monitor`.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<MonitoringService>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn build(&self, name: &str, config: CircuitConfig) -> Arc<CircuitBreaker> {
        let breaker = CircuitBreaker::new(name, config);
        let breaker = match &self.monitor {
            Some(m) => breaker.with_monitor(m.clone()),
            None => breaker,
        };
        Arc::new(breaker)
    }

    /// Get a breaker, creating it with the registry defaults if missing.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        let config = self.defaults.read().clone();
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| self.build(name, config))
            .clone()
    }

    /// Get a breaker, creating it with `config` if missing. An existing
    /// breaker keeps its current configuration.
    pub fn get_or_create_with(&self, name: &str, config: CircuitConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| self.build(name, config))
            .clone()
    }

    /// The breaker guarding the store, pre-set with [`CircuitConfig::redis`].
    pub fn redis(&self) -> Arc<CircuitBreaker> {
        self.get_or_create_with(REDIS_CIRCUIT, CircuitConfig::redis())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    pub fn set_defaults(&self, config: CircuitConfig) {
        *self.defaults.write() = config;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshots of every breaker, sorted by name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
