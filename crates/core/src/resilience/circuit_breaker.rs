use crate::config::CircuitBreakerConfig;
use crate::error::{GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the cooldown elapses
    Open,
    /// One probe call decides whether to close or re-open
    HalfOpen,
}

/// Point-in-time view of a breaker, for health reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure_timestamp: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// Circuit breaker guarding one upstream dependency.
///
/// All transitions happen under a single lock, so concurrent outcomes are
/// applied one at a time and none are lost.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure_timestamp: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask for permission to make one call.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and hands
    /// out a single probe permit; everyone else is rejected with
    /// [`GatewayError::CircuitOpen`].
    pub fn try_acquire(&self) -> GatewayResult<BreakerPermit<'_>> {
        let mut inner = self.lock();
        let cooldown = self.config.cooldown();
        let state = inner.state;

        match state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| opened.elapsed())
                    .unwrap_or(cooldown);

                if elapsed >= cooldown {
                    tracing::info!(breaker = %self.name, "Circuit half-open, admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(BreakerPermit::new(self, true))
                } else {
                    Err(GatewayError::CircuitOpen {
                        retry_after: cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(GatewayError::CircuitOpen {
                        retry_after: Duration::from_secs(1),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(BreakerPermit::new(self, true))
                }
            }
        }
    }

    /// Run `op` under the breaker.
    ///
    /// Retryable errors count as failures; anything else means the upstream
    /// answered and counts as a success.
    pub async fn call<T, F, Fut>(&self, op: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.run(op, false).await
    }

    /// Like [`call`](Self::call), but a success only means the response has
    /// started. The caller reports how it ended with
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure) once the body is consumed.
    /// A half-open probe still closes the breaker as soon as headers arrive.
    pub async fn call_deferred<T, F, Fut>(&self, op: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.run(op, true).await
    }

    async fn run<T, F, Fut>(&self, op: F, defer: bool) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let permit = self.try_acquire()?;
        let result = op().await;

        match &result {
            Err(err) if err.is_retryable() => permit.failure(),
            Ok(_) if defer && !permit.is_probe() => permit.defer(),
            _ => permit.success(),
        }

        result
    }

    /// Outcome of a call whose permit was already settled.
    pub fn record_success(&self) {
        self.on_success(false);
    }

    pub fn record_failure(&self) {
        self.on_failure(false);
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen if probe => {
                tracing::info!(breaker = %self.name, "Probe succeeded, circuit closed");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
            }
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.last_failure_timestamp = Some(Utc::now());
        let state = inner.state;
        let tripped = inner.consecutive_failures >= self.config.failure_threshold;

        match state {
            CircuitState::Closed if tripped => {
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    "Circuit opened"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen if probe => {
                tracing::warn!(breaker = %self.name, "Probe failed, circuit re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            _ => {}
        }
    }

    fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_timestamp: inner.last_failure_timestamp,
        }
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }
}

/// Permission to make one call through a [`CircuitBreaker`].
///
/// Dropping an unsettled probe permit frees the probe slot without deciding a
/// transition, so a cancelled probe cannot wedge the breaker half-open.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }

    /// Settle without a transition; the outcome is recorded later.
    fn defer(mut self) {
        self.settled = true;
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}
