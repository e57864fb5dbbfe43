//! Circuit breaker protecting callees from cascading failure.
//!
//! Closed counts failures and trips to Open at the threshold; Open rejects
//! everything until the open timeout passes, then admits a bounded number of
//! probes in HalfOpen. Enough successes close the circuit again, any probe
//! failure reopens it. All transitions happen under one mutex and counter
//! resets are atomic with the state change.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker poisoned").state
    }

    fn open_error(&self) -> Error {
        Error::ServiceUnavailable(format!("circuit open for {}", self.name))
    }

    /// Ask for admission. In HalfOpen this reserves one of the probe slots;
    /// the caller must follow up with `record_success` or `record_failure`.
    fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.config.open_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_in_flight = 1;
                    Ok(())
                } else {
                    Err(self.open_error())
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_requests {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(self.open_error())
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_in_flight = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_failure = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_in_flight = 0;
                inner.last_failure = Some(Instant::now());
            }
            BreakerState::Open => {
                inner.last_failure = Some(Instant::now());
            }
        }
    }

    /// Run `work` under the breaker: rejected immediately when the circuit
    /// is open, otherwise the outcome is recorded.
    pub async fn call<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.try_acquire()?;
        match work.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}
