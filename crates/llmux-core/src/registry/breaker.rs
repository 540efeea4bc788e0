//! Per-provider circuit breaker state machine.
//!
//! Pure state: the breaker never reads the clock itself, callers pass `now`
//! so transitions are deterministic under test. The registry wraps it in a
//! mutex together with the rest of the provider's health record.

use std::time::Duration;

use tokio::time::Instant;

use llmux_types::config::BreakerConfig;
use llmux_types::health::CircuitStateKind;

/// Wait hint returned while every half-open trial slot is taken.
pub const HALF_OPEN_BUSY_RETRY_MS: u64 = 1_000;

/// Circuit breaker state for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward the threshold.
    Closed { consecutive_failures: u32 },
    /// Admission fails fast until the open duration has elapsed.
    Open { opened_at: Instant },
    /// Trial calls are admitted up to the quota.
    HalfOpen { in_flight: u32, successes: u32 },
}

impl CircuitState {
    pub fn kind(&self) -> CircuitStateKind {
        match self {
            CircuitState::Closed { .. } => CircuitStateKind::Closed,
            CircuitState::Open { .. } => CircuitStateKind::Open,
            CircuitState::HalfOpen { .. } => CircuitStateKind::HalfOpen,
        }
    }
}

/// Result of asking the breaker to admit one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed. `trial` carries the half-open epoch when the
    /// call occupies a trial slot.
    Admitted { trial: Option<u64> },
    /// The call must not reach the provider.
    Rejected { retry_after_ms: u64 },
}

/// A state change, reported so the owner can log and publish it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitStateKind,
    pub to: CircuitStateKind,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_threshold: u32,
    open_duration: Duration,
    half_open_max_calls: u32,
    success_threshold: u32,
    /// Bumped on every entry into half-open; stale trial permits are ignored.
    epoch: u64,
    changed_at: Instant,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig, now: Instant) -> Self {
        let half_open_max_calls = config.half_open_max_calls.max(1);
        Self {
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
            failure_threshold: config.failure_threshold.max(1),
            open_duration: Duration::from_millis(config.open_duration_ms),
            half_open_max_calls,
            success_threshold: config.success_threshold.clamp(1, half_open_max_calls),
            epoch: 0,
            changed_at: now,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn kind(&self) -> CircuitStateKind {
        self.state.kind()
    }

    pub fn changed_at(&self) -> Instant {
        self.changed_at
    }

    /// Read-only admission check: how long until an open circuit admits again.
    ///
    /// Returns `None` when a call would be considered for admission now.
    pub fn blocked_for(&self, now: Instant) -> Option<u64> {
        match self.state {
            CircuitState::Open { opened_at } => {
                let elapsed = now.saturating_duration_since(opened_at);
                (elapsed < self.open_duration)
                    .then(|| remaining_ms(self.open_duration - elapsed))
            }
            _ => None,
        }
    }

    /// Decide whether one call may proceed, moving open to half-open once
    /// the open duration has elapsed. Trial slots are first come, first served.
    pub fn try_acquire(&mut self, now: Instant) -> (Admission, Option<Transition>) {
        let mut transition = None;

        if let CircuitState::Open { opened_at } = self.state {
            let elapsed = now.saturating_duration_since(opened_at);
            if elapsed < self.open_duration {
                let retry_after_ms = remaining_ms(self.open_duration - elapsed);
                return (Admission::Rejected { retry_after_ms }, None);
            }
            self.epoch += 1;
            transition = self.set_state(
                CircuitState::HalfOpen {
                    in_flight: 0,
                    successes: 0,
                },
                now,
            );
        }

        let admission = match &mut self.state {
            CircuitState::Closed { .. } => Admission::Admitted { trial: None },
            CircuitState::HalfOpen { in_flight, .. } => {
                if *in_flight < self.half_open_max_calls {
                    *in_flight += 1;
                    Admission::Admitted {
                        trial: Some(self.epoch),
                    }
                } else {
                    Admission::Rejected {
                        retry_after_ms: HALF_OPEN_BUSY_RETRY_MS,
                    }
                }
            }
            CircuitState::Open { .. } => Admission::Rejected {
                retry_after_ms: HALF_OPEN_BUSY_RETRY_MS,
            },
        };

        (admission, transition)
    }

    pub fn on_success(&mut self, trial: Option<u64>, now: Instant) -> Option<Transition> {
        let current_trial = self.is_current_trial(trial);
        match &mut self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen {
                in_flight,
                successes,
            } if current_trial => {
                *in_flight = in_flight.saturating_sub(1);
                *successes += 1;
                if *successes >= self.success_threshold {
                    self.set_state(
                        CircuitState::Closed {
                            consecutive_failures: 0,
                        },
                        now,
                    )
                } else {
                    None
                }
            }
            // Late outcomes from calls admitted before the circuit opened,
            // or from an earlier half-open round, do not move the state.
            CircuitState::HalfOpen { .. } | CircuitState::Open { .. } => None,
        }
    }

    /// Any failure while half-open reopens the circuit, trial or not.
    pub fn on_failure(&mut self, now: Instant) -> Option<Transition> {
        match &mut self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.failure_threshold {
                    self.set_state(CircuitState::Open { opened_at: now }, now)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.set_state(CircuitState::Open { opened_at: now }, now)
            }
            CircuitState::Open { .. } => None,
        }
    }

    /// Release a trial slot whose call ended without an outcome.
    pub fn on_abandoned(&mut self, trial: Option<u64>) {
        if !self.is_current_trial(trial) {
            return;
        }
        if let CircuitState::HalfOpen { in_flight, .. } = &mut self.state {
            *in_flight = in_flight.saturating_sub(1);
        }
    }

    fn is_current_trial(&self, trial: Option<u64>) -> bool {
        trial == Some(self.epoch) && matches!(self.state, CircuitState::HalfOpen { .. })
    }

    fn set_state(&mut self, next: CircuitState, now: Instant) -> Option<Transition> {
        let from = self.state.kind();
        self.state = next;
        self.changed_at = now;
        let to = next.kind();
        (from != to).then_some(Transition { from, to })
    }
}

fn remaining_ms(remaining: Duration) -> u64 {
    // Round up so a hint of 0 never means "still open".
    let ms = remaining.as_millis();
    let rounded = if remaining.subsec_nanos() % 1_000_000 == 0 {
        ms
    } else {
        ms + 1
    };
    u64::try_from(rounded).unwrap_or(u64::MAX).max(1)
}
