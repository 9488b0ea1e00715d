//! Per-destination circuit breakers.
//!
//! # State Machine
//!
//! ```text
//! Closed   --[failures >= threshold]-------------> Open
//! Open     --[recovery timeout elapsed]----------> HalfOpen
//! HalfOpen --[trial_calls successes]-------------> Closed
//! HalfOpen --[any network failure]---------------> Open
//! ```
//!
//! Only network-class failures (timeouts, resets, refusals, unreachable
//! hosts, DNS failures, aborts) move a breaker toward Open. HTTP statuses
//! never do: a 404 says nothing about whether the server is healthy.
//!
//! Each destination has its own record behind its own lock, so a failing
//! server never blocks calls to healthy ones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::FetchError;

/// Configuration for circuit breakers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive network failures that open the circuit (default: 5).
    pub failure_threshold: u32,
    /// Time an open circuit rejects calls before trying again (default: 60s).
    pub recovery_timeout: Duration,
    /// Successful trial calls needed to close a half-open circuit (default: 3).
    pub trial_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            trial_calls: 3,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Result of asking whether a call may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub reason: Option<String>,
    /// Time until an open circuit will admit a trial call
    pub retry_after: Option<Duration>,
}

impl Admission {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after: None,
        }
    }
}

/// Snapshot of one destination's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub destination: String,
    pub state: CircuitState,
    pub failures: u32,
    pub success_count: u32,
    #[serde(skip)]
    pub last_failure: Option<Instant>,
    #[serde(skip)]
    pub next_attempt: Option<Instant>,
}

#[derive(Debug)]
struct BreakerRecord {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
    success_count: u32,
}

impl BreakerRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            next_attempt: None,
            success_count: 0,
        }
    }

    fn open(&mut self, now: Instant, recovery: Duration) {
        self.state = CircuitState::Open;
        self.next_attempt = Some(now + recovery);
        self.success_count = 0;
    }
}

/// Registry of circuit breakers keyed by destination.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    records: Mutex<HashMap<String, Arc<Mutex<BreakerRecord>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn record(&self, destination: &str) -> Arc<Mutex<BreakerRecord>> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            records
                .entry(destination.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BreakerRecord::new()))),
        )
    }

    /// Whether a call to `destination` may proceed right now.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// and admits the call as a trial.
    pub fn can_execute(&self, destination: &str) -> Admission {
        let record = self.record(destination);
        let mut record = record.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        match record.state {
            CircuitState::Closed => Admission::allow(),
            CircuitState::Open => {
                let next = record.next_attempt.unwrap_or(now);
                if now >= next {
                    record.state = CircuitState::HalfOpen;
                    record.success_count = 0;
                    info!(destination, "Circuit breaker half-open, allowing trial calls");
                    Admission::allow()
                } else {
                    Admission {
                        allowed: false,
                        reason: Some(format!(
                            "circuit open after {} failures",
                            record.failures
                        )),
                        retry_after: Some(next - now),
                    }
                }
            }
            CircuitState::HalfOpen => {
                if record.success_count < self.config.trial_calls {
                    Admission::allow()
                } else {
                    Admission {
                        allowed: false,
                        reason: Some("half-open trial limit reached".to_string()),
                        retry_after: None,
                    }
                }
            }
        }
    }

    pub fn record_success(&self, destination: &str) {
        let record = self.record(destination);
        let mut record = record.lock().unwrap_or_else(PoisonError::into_inner);

        match record.state {
            CircuitState::HalfOpen => {
                record.success_count += 1;
                if record.success_count >= self.config.trial_calls {
                    record.state = CircuitState::Closed;
                    record.failures = 0;
                    record.success_count = 0;
                    record.next_attempt = None;
                    info!(destination, "Circuit breaker closed");
                }
            }
            CircuitState::Closed => {
                record.failures = record.failures.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call. Non-network failures are ignored.
    pub fn record_failure(&self, destination: &str, error: &FetchError) {
        if !error.is_network() {
            return;
        }

        let record = self.record(destination);
        let mut record = record.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        record.failures += 1;
        record.last_failure = Some(now);

        match record.state {
            CircuitState::HalfOpen => {
                record.open(now, self.config.recovery_timeout);
                warn!(destination, error = %error, "Trial call failed, circuit breaker reopened");
            }
            CircuitState::Closed if record.failures >= self.config.failure_threshold => {
                record.open(now, self.config.recovery_timeout);
                warn!(
                    destination,
                    failures = record.failures,
                    recovery_secs = self.config.recovery_timeout.as_secs(),
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Forget `destination`'s breaker, or every breaker when `None`.
    pub fn reset(&self, destination: Option<&str>) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match destination {
            Some(destination) => {
                records.remove(destination);
            }
            None => records.clear(),
        }
    }

    pub fn snapshot(&self, destination: &str) -> Option<BreakerSnapshot> {
        let record = {
            let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(records.get(destination)?)
        };
        let record = record.lock().unwrap_or_else(PoisonError::into_inner);
        Some(BreakerSnapshot {
            destination: destination.to_string(),
            state: record.state,
            failures: record.failures,
            success_count: record.success_count,
            last_failure: record.last_failure,
            next_attempt: record.next_attempt,
        })
    }

    /// Snapshots of every known destination.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let destinations: Vec<String> = {
            let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            records.keys().cloned().collect()
        };
        destinations
            .iter()
            .filter_map(|d| self.snapshot(d))
            .collect()
    }

    pub fn state(&self, destination: &str) -> CircuitState {
        self.snapshot(destination)
            .map_or(CircuitState::Closed, |s| s.state)
    }
}
