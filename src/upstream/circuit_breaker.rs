use crate::config::CircuitBreakerConfig;
use crate::error::BreakerError;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

/// State-change records kept per breaker.
const HISTORY_LIMIT: usize = 64;

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Why a call counted as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureMode {
    Timeout,
    Exception,
    Custom,
}

impl FailureMode {
    fn as_str(self) -> &'static str {
        match self {
            FailureMode::Timeout => "timeout",
            FailureMode::Exception => "exception",
            FailureMode::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    #[serde(serialize_with = "serialize_time")]
    pub at: SystemTime,
}

fn serialize_time<S: serde::Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&humantime::format_rfc3339_millis(*t))
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub timeouts: u64,
    pub exceptions: u64,
    pub custom_failures: u64,
    /// Failure rate over the current outcome window.
    pub failure_rate: f64,
    pub avg_duration: Duration,
    pub state_changes: Vec<StateChange>,
}

#[derive(Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    rejected: u64,
    timeouts: u64,
    exceptions: u64,
    custom: u64,
    total_duration: Duration,
}

struct Inner {
    state: CircuitState,
    /// Failures since the last success while Closed.
    failure_count: u32,
    /// Consecutive successes while HalfOpen.
    success_count: u32,
    last_failure_time: Option<Instant>,
    /// Recent outcomes, `true` = failure.
    window: VecDeque<bool>,
    half_open_in_flight: u32,
    /// Bumped on every entry into HalfOpen. Only permits from the current
    /// round hold a slot or decide the round.
    half_open_round: u64,
    counters: Counters,
    history: VecDeque<StateChange>,
}

impl Inner {
    fn window_failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|f| **f).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Per-target call guard. One instance is shared by every caller using the
/// same name; all state sits behind a single mutex that is never held while
/// the wrapped operation runs.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission ticket for one call. Releases a half-open slot if the call is
/// dropped before its outcome is recorded.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    /// Half-open round this call was admitted in, if any.
    round: Option<u64>,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let mut inner = self.breaker.lock();
            release_slot(&mut inner, self.round);
        }
    }
}

/// Give back a half-open slot taken in `round`. Slots of an earlier round
/// were already reclaimed when the new round started.
fn release_slot(inner: &mut Inner, round: Option<u64>) -> bool {
    match round {
        Some(r) if r == inner.half_open_round => {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            true
        }
        _ => false,
    }
}

/// How [`CircuitBreaker::call`] judges a value that came back `Ok`. Plain
/// values are successes; HTTP responses and status codes fail on 5xx.
pub trait CallOutcome {
    fn is_failure(&self) -> bool {
        false
    }
}

impl CallOutcome for reqwest::Response {
    fn is_failure(&self) -> bool {
        server_error(self)
    }
}

impl CallOutcome for reqwest::StatusCode {
    fn is_failure(&self) -> bool {
        self.is_server_error()
    }
}

impl<T: CallOutcome> CallOutcome for Option<T> {
    fn is_failure(&self) -> bool {
        self.as_ref().is_some_and(|v| v.is_failure())
    }
}

macro_rules! plain_outcome {
    ($($t:ty),* $(,)?) => {
        $(impl CallOutcome for $t {})*
    };
}

plain_outcome!((), bool, char, String, &str, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

impl<T> CallOutcome for Vec<T> {}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        metrics::gauge!("mesh_circuit_breaker_state", "breaker" => name.clone())
            .set(CircuitState::Closed.gauge_value());
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                window: VecDeque::new(),
                half_open_in_flight: 0,
                half_open_round: 0,
                counters: Counters::default(),
                history: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. An Open breaker whose recovery timeout has passed is
    /// still reported Open until a call is attempted.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run an async operation through the breaker. Errors and timeouts count
    /// as failures, as does an `Ok` value that [`CallOutcome`] flags, such
    /// as a 5xx response. A flagged value is still returned.
    pub async fn call<T, E, F>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        T: CallOutcome,
    {
        self.call_with(operation, |value: &T| value.is_failure()).await
    }

    /// Like [`call`](Self::call), but `is_failure` also inspects successful
    /// values. A match is recorded as a `CUSTOM` failure and the value is
    /// still returned.
    pub async fn call_with<T, E, F, D>(&self, operation: F, is_failure: D) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        D: FnOnce(&T) -> bool,
    {
        let mut permit = self.admit()?;
        let started = Instant::now();
        let limit = self.config.timeout();

        let outcome = tokio::time::timeout(limit, operation).await;
        let elapsed = started.elapsed();
        permit.settled = true;
        match outcome {
            Err(_) => {
                self.on_failure(permit.round, FailureMode::Timeout, elapsed);
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    after: limit,
                })
            }
            Ok(Err(e)) => {
                self.on_failure(permit.round, FailureMode::Exception, elapsed);
                Err(BreakerError::Failed(e))
            }
            Ok(Ok(value)) => {
                if is_failure(&value) {
                    self.on_failure(permit.round, FailureMode::Custom, elapsed);
                } else {
                    self.on_success(permit.round, elapsed);
                }
                Ok(value)
            }
        }
    }

    /// Run a synchronous operation on the blocking pool, bounded by the same
    /// timeout. On timeout the closure keeps running detached; only its
    /// result is discarded.
    pub async fn call_blocking<T, E, F>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut permit = self.admit()?;
        let started = Instant::now();
        let limit = self.config.timeout();

        let outcome = tokio::time::timeout(limit, tokio::task::spawn_blocking(operation)).await;
        let elapsed = started.elapsed();
        permit.settled = true;
        match outcome {
            Err(_) => {
                self.on_failure(permit.round, FailureMode::Timeout, elapsed);
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    after: limit,
                })
            }
            Ok(Err(join_err)) => {
                tracing::warn!(breaker = %self.name, "circuit_breaker: blocking call failed: {}", join_err);
                self.on_failure(permit.round, FailureMode::Exception, elapsed);
                Err(BreakerError::Panicked)
            }
            Ok(Ok(Err(e))) => {
                self.on_failure(permit.round, FailureMode::Exception, elapsed);
                Err(BreakerError::Failed(e))
            }
            Ok(Ok(Ok(value))) => {
                self.on_success(permit.round, elapsed);
                Ok(value)
            }
        }
    }

    fn admit<E>(&self) -> Result<Permit<'_>, BreakerError<E>> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let recovered = inner
                .last_failure_time
                .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout());
            if recovered {
                self.transition(&mut inner, CircuitState::HalfOpen);
            }
        }

        let round = match inner.state {
            CircuitState::Closed => None,
            CircuitState::HalfOpen => {
                let max = self.config.half_open_max_calls;
                if max > 0 && inner.half_open_in_flight >= max {
                    return Err(self.reject(&mut inner));
                }
                inner.half_open_in_flight += 1;
                Some(inner.half_open_round)
            }
            CircuitState::Open => return Err(self.reject(&mut inner)),
        };

        Ok(Permit {
            breaker: self,
            round,
            settled: false,
        })
    }

    fn reject<E>(&self, inner: &mut Inner) -> BreakerError<E> {
        inner.counters.rejected += 1;
        metrics::counter!("mesh_circuit_breaker_calls_total", "breaker" => self.name.clone(), "result" => "rejected")
            .increment(1);
        BreakerError::Open {
            name: self.name.clone(),
        }
    }

    fn push_outcome(&self, inner: &mut Inner, failed: bool, elapsed: Duration) {
        inner.counters.total += 1;
        inner.counters.total_duration += elapsed;
        inner.window.push_back(failed);
        while inner.window.len() > self.config.window_size.max(1) {
            inner.window.pop_front();
        }
        metrics::histogram!("mesh_circuit_breaker_call_duration_seconds", "breaker" => self.name.clone())
            .record(elapsed.as_secs_f64());
    }

    fn on_success(&self, round: Option<u64>, elapsed: Duration) {
        let mut inner = self.lock();
        let current = release_slot(&mut inner, round);
        self.push_outcome(&mut inner, false, elapsed);
        inner.counters.successful += 1;
        metrics::counter!("mesh_circuit_breaker_calls_total", "breaker" => self.name.clone(), "result" => "success")
            .increment(1);

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            // Only calls admitted in this round decide it.
            CircuitState::HalfOpen if !current => {}
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    let successes = inner.success_count;
                    self.transition(&mut inner, CircuitState::Closed);
                    tracing::info!(
                        breaker = %self.name,
                        "circuit_breaker: closed (recovered after {} successes)",
                        successes
                    );
                }
            }
            // Late result of a call admitted before the breaker opened.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, round: Option<u64>, mode: FailureMode, elapsed: Duration) {
        let mut inner = self.lock();
        let current = release_slot(&mut inner, round);
        self.push_outcome(&mut inner, true, elapsed);
        inner.counters.failed += 1;
        match mode {
            FailureMode::Timeout => inner.counters.timeouts += 1,
            FailureMode::Exception => inner.counters.exceptions += 1,
            FailureMode::Custom => inner.counters.custom += 1,
        }
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());
        metrics::counter!("mesh_circuit_breaker_calls_total", "breaker" => self.name.clone(), "result" => "failure")
            .increment(1);
        metrics::counter!("mesh_circuit_breaker_failures_total", "breaker" => self.name.clone(), "mode" => mode.as_str())
            .increment(1);

        match inner.state {
            CircuitState::Closed => {
                let by_count = inner.failure_count >= self.config.failure_threshold;
                let window_full = inner.window.len() >= self.config.window_size;
                let rate = inner.window_failure_rate();
                let by_rate = window_full && rate >= self.config.failure_rate_threshold;
                if by_count || by_rate {
                    let failures = inner.failure_count;
                    self.transition(&mut inner, CircuitState::Open);
                    if by_count {
                        tracing::warn!(
                            breaker = %self.name,
                            mode = mode.as_str(),
                            "circuit_breaker: opened (after {} consecutive failures)",
                            failures
                        );
                    } else {
                        tracing::warn!(
                            breaker = %self.name,
                            mode = mode.as_str(),
                            "circuit_breaker: opened (failure rate {:.2} over {} calls)",
                            rate,
                            inner.window.len()
                        );
                    }
                }
            }
            CircuitState::HalfOpen if !current => {}
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
                tracing::warn!(breaker = %self.name, "circuit_breaker: re-opened (probe failed in half-open)");
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.window.clear();
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                inner.half_open_in_flight = 0;
                inner.half_open_round += 1;
            }
            CircuitState::Open => {
                inner.success_count = 0;
            }
        }
        inner.history.push_back(StateChange {
            from,
            to,
            at: SystemTime::now(),
        });
        while inner.history.len() > HISTORY_LIMIT {
            inner.history.pop_front();
        }
        metrics::gauge!("mesh_circuit_breaker_state", "breaker" => self.name.clone()).set(to.gauge_value());
        metrics::counter!("mesh_circuit_breaker_transitions_total", "breaker" => self.name.clone(), "to" => to.to_string())
            .increment(1);
        tracing::debug!(breaker = %self.name, from = %from, to = %to, "circuit_breaker: state change");
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.lock();
        let c = &inner.counters;
        let avg_duration = if c.total > 0 {
            Duration::from_secs_f64(c.total_duration.as_secs_f64() / c.total as f64)
        } else {
            Duration::ZERO
        };
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: c.total,
            successful_calls: c.successful,
            failed_calls: c.failed,
            rejected_calls: c.rejected,
            timeouts: c.timeouts,
            exceptions: c.exceptions,
            custom_failures: c.custom,
            failure_rate: inner.window_failure_rate(),
            avg_duration,
            state_changes: inner.history.iter().cloned().collect(),
        }
    }

    /// Back to Closed with empty counts and window. Lifetime counters and
    /// history are kept.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.failure_count = 0;
        inner.window.clear();
        inner.last_failure_time = None;
        tracing::info!(breaker = %self.name, "circuit_breaker: reset");
    }

    /// Open the breaker as if a failure had just been recorded. It recovers
    /// through HalfOpen after `recovery_timeout` like any other trip.
    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.last_failure_time = Some(Instant::now());
        self.transition(&mut inner, CircuitState::Open);
        tracing::warn!(breaker = %self.name, "circuit_breaker: forced open");
    }
}

/// Failure detector for HTTP calls: any 5xx response.
pub fn server_error(resp: &reqwest::Response) -> bool {
    resp.status().is_server_error()
}

/// Breakers by name. Each upstream "service:instance" typically gets its own,
/// so an unhealthy instance is isolated without affecting its siblings.
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, &self.defaults)
    }

    /// Config only applies when the breaker does not exist yet.
    pub fn get_or_create_with(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        // Fast path: key already exists, no allocation.
        if let Some(entry) = self.breakers.get(name) {
            return entry.value().clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|e| e.value().clone())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.breakers.remove(name).is_some()
    }

    /// Remove breakers whose names are no longer in the active set.
    pub fn retain(&self, active: &HashSet<String>) {
        self.breakers.retain(|k, _| active.contains(k));
    }

    pub fn all_metrics(&self) -> Vec<BreakerMetrics> {
        let mut all: Vec<BreakerMetrics> = self.breakers.iter().map(|e| e.value().metrics()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
