//! Circuit breaker guarding broker reconnect attempts.
//!
//! After `failure_threshold` consecutive connect failures the circuit opens
//! and attempts are suspended for `open_duration`. The first attempt after
//! that is a trial: success closes the circuit, failure reopens it.

use std::time::{Duration, Instant};

use palaver_types::config::ReconnectConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward the threshold.
    Closed { consecutive_failures: u32 },
    /// Attempts suspended until `opened_at + wait_duration`.
    Open {
        opened_at: Instant,
        wait_duration: Duration,
    },
    /// One trial attempt allowed.
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_threshold: u32,
    open_duration: Duration,
    total_failures: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
            failure_threshold: failure_threshold.max(1),
            open_duration,
            total_failures: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.failure_threshold, Duration::from_secs(config.open_secs))
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    /// Whether an attempt may be made now. Moves Open -> HalfOpen once the
    /// wait has elapsed.
    pub fn allow_attempt(&mut self) -> bool {
        match &self.state {
            CircuitState::Closed { .. } | CircuitState::HalfOpen => true,
            CircuitState::Open {
                opened_at,
                wait_duration,
            } => {
                if opened_at.elapsed() >= *wait_duration {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Time left before the next attempt is allowed. Zero unless open.
    pub fn remaining_open(&self) -> Duration {
        match &self.state {
            CircuitState::Open {
                opened_at,
                wait_duration,
            } => wait_duration.saturating_sub(opened_at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&mut self) {
        self.total_failures += 1;
        match &self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let count = consecutive_failures + 1;
                self.state = if count >= self.failure_threshold {
                    self.open()
                } else {
                    CircuitState::Closed {
                        consecutive_failures: count,
                    }
                };
            }
            CircuitState::HalfOpen => self.state = self.open(),
            CircuitState::Open { .. } => {}
        }
    }

    fn open(&self) -> CircuitState {
        CircuitState::Open {
            opened_at: Instant::now(),
            wait_duration: self.open_duration,
        }
    }
}
