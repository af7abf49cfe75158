//! Per-provider circuit breaker.
//!
//! Opens after `failure_threshold` consecutive transient failures. While open, requests are
//! refused immediately; after the cool-down one trial call is let through (half-open) and its
//! result closes or re-opens the circuit.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed { consecutive_failures: u32 },
    /// A single trial call is in flight.
    HalfOpen,
    Open { reopen_at: Instant },
}

pub struct CircuitBreaker {
    name: String,
    settings: CircuitSettings,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: CircuitSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: Mutex::new(CircuitState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a request may go out now. Moves an expired open circuit to half-open.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state();
        match *state {
            CircuitState::Closed { .. } => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open { reopen_at } if now >= reopen_at => {
                log::info!("circuit {}: half-open, admitting one trial call", self.name);
                *state = CircuitState::HalfOpen;
                true
            }
            CircuitState::Open { .. } => false,
        }
    }

    /// The upstream answered (including non-transient rejections).
    pub fn on_success(&self) {
        let mut state = self.state();
        match *state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                if consecutive_failures > 0 {
                    log::debug!(
                        "circuit {}: resetting {} failure(s)",
                        self.name,
                        consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen | CircuitState::Open { .. } => {
                log::info!("circuit {}: closed", self.name);
            }
        }
        *state = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    /// A transient failure (timeout, unreachable, 5xx).
    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now());
    }

    pub(crate) fn on_failure_at(&self, now: Instant) {
        let mut state = self.state();
        match *state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.settings.failure_threshold {
                    self.open(&mut state, now);
                } else {
                    *state = CircuitState::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            CircuitState::HalfOpen => self.open(&mut state, now),
            CircuitState::Open { .. } => {}
        }
    }

    fn open(&self, state: &mut CircuitState, now: Instant) {
        *state = CircuitState::Open {
            reopen_at: now + self.settings.cooldown,
        };
        log::warn!(
            "circuit {}: opened, shedding requests for {:?}",
            self.name,
            self.settings.cooldown
        );
    }

    /// Currently refusing calls, or cooled down and waiting for the next trial call.
    pub fn is_open(&self) -> bool {
        matches!(*self.state(), CircuitState::Open { .. })
    }
}
