//! Provider health record and breaker permits.
//!
//! One [`ProviderHealth`] per provider holds the circuit breaker, the
//! latency window and cumulative counters behind a single mutex. Every
//! provider call is bracketed by a [`BreakerPermit`]; settling the permit is
//! the only way outcomes reach the record.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use llmux_types::config::{BreakerConfig, HealthWindowConfig};
use llmux_types::error::LlmError;
use llmux_types::event::ClientEvent;
use llmux_types::health::{CircuitStateKind, HealthStatus, ProviderHealthReport};

use super::breaker::{Admission, CircuitBreaker, CircuitState, Transition};
use super::latency::LatencyWindow;
use crate::event::EventBus;

/// Health tracking for a single provider.
#[derive(Debug)]
pub struct ProviderHealth {
    breaker: CircuitBreaker,
    latency: LatencyWindow,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

impl ProviderHealth {
    pub fn new(breaker: &BreakerConfig, window: &HealthWindowConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(breaker, Instant::now()),
            latency: LatencyWindow::new(
                window.max_samples,
                Duration::from_millis(window.sample_ttl_ms),
            ),
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            last_error: None,
            last_error_at: None,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Successes over calls the provider is accountable for, 1.0 before the
    /// first such call. Cancelled or rejected requests do not move it.
    pub fn success_rate(&self) -> f64 {
        let attributed = self.total_successes + self.total_failures;
        if attributed == 0 {
            1.0
        } else {
            self.total_successes as f64 / attributed as f64
        }
    }

    pub fn record_success(
        &mut self,
        latency_ms: u64,
        trial: Option<u64>,
        now: Instant,
    ) -> Option<Transition> {
        self.total_requests += 1;
        self.total_successes += 1;
        self.latency.record_at(now, latency_ms);
        self.breaker.on_success(trial, now)
    }

    pub fn record_failure(
        &mut self,
        error: &LlmError,
        latency_ms: u64,
        now: Instant,
    ) -> Option<Transition> {
        self.total_requests += 1;
        self.total_failures += 1;
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(Utc::now());
        self.latency.record_at(now, latency_ms);
        self.breaker.on_failure(now)
    }

    /// Count a call that ended for reasons unrelated to the provider and
    /// release its breaker slot.
    pub fn record_unattributed(&mut self, trial: Option<u64>) {
        self.total_requests += 1;
        self.breaker.on_abandoned(trial);
    }

    /// Circuit state as callers observe it: an open circuit whose cooldown
    /// has elapsed reports half-open, since the next call will be a trial.
    pub fn observed_state(&self, now: Instant) -> CircuitStateKind {
        match self.breaker.state() {
            CircuitState::Open { .. } if self.breaker.blocked_for(now).is_none() => {
                CircuitStateKind::HalfOpen
            }
            state => state.kind(),
        }
    }

    pub fn report(&self, name: &str, now: Instant) -> ProviderHealthReport {
        let success_rate = self.success_rate();
        ProviderHealthReport {
            name: name.to_string(),
            status: HealthStatus::from_success_rate(success_rate),
            circuit_state: self.observed_state(now),
            success_rate,
            total_requests: self.total_requests,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            average_latency_ms: self.latency.average_at(now),
            latency_samples: self.latency.len(),
            last_error: self.last_error.clone(),
            last_error_at: self.last_error_at,
        }
    }
}

pub(crate) fn lock(health: &Mutex<ProviderHealth>) -> MutexGuard<'_, ProviderHealth> {
    health.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Log and publish a breaker state change.
pub(crate) fn announce(events: &EventBus, provider: &str, transition: Transition) {
    match transition.to {
        CircuitStateKind::Open => tracing::warn!(
            provider = %provider,
            from = %transition.from,
            "Circuit opened"
        ),
        _ => tracing::info!(
            provider = %provider,
            from = %transition.from,
            to = %transition.to,
            "Circuit state changed"
        ),
    }
    events.publish(ClientEvent::CircuitStateChanged {
        provider: provider.to_string(),
        from: transition.from,
        to: transition.to,
    });
}

/// Admission ticket for one provider call.
///
/// Settle it with [`BreakerPermit::succeed`] or [`BreakerPermit::fail`].
/// Dropping it unsettled (the caller abandoned the call) records nothing
/// and frees any half-open trial slot it held.
pub struct BreakerPermit {
    provider: String,
    health: Arc<Mutex<ProviderHealth>>,
    events: EventBus,
    trial: Option<u64>,
    started: Instant,
    settled: bool,
}

impl BreakerPermit {
    /// Ask the provider's breaker to admit one call.
    pub(crate) fn acquire(
        provider: &str,
        health: Arc<Mutex<ProviderHealth>>,
        events: EventBus,
    ) -> Result<Self, LlmError> {
        let now = Instant::now();
        let (admission, transition) = lock(&health).breaker.try_acquire(now);
        if let Some(transition) = transition {
            announce(&events, provider, transition);
        }

        match admission {
            Admission::Admitted { trial } => {
                tracing::debug!(provider = %provider, trial = trial.is_some(), "Call admitted");
                Ok(Self {
                    provider: provider.to_string(),
                    health,
                    events,
                    trial,
                    started: now,
                    settled: false,
                })
            }
            Admission::Rejected { retry_after_ms } => {
                tracing::debug!(provider = %provider, retry_after_ms, "Call rejected by circuit breaker");
                Err(LlmError::ProviderUnavailable {
                    provider: provider.to_string(),
                    retry_after_ms,
                })
            }
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Record a successful call. Returns the measured latency.
    pub fn succeed(mut self) -> u64 {
        let latency_ms = self.elapsed_ms();
        self.settled = true;
        let transition = lock(&self.health).record_success(latency_ms, self.trial, Instant::now());
        if let Some(transition) = transition {
            announce(&self.events, &self.provider, transition);
        }
        latency_ms
    }

    /// Record a failed call. Errors that say nothing about the provider
    /// (cancellation, rejected input) count as a request but leave the
    /// breaker, failure counters and latency window alone.
    pub fn fail(mut self, error: &LlmError) -> u64 {
        let latency_ms = self.elapsed_ms();
        self.settled = true;
        if !error.counts_against_provider() {
            lock(&self.health).record_unattributed(self.trial);
            return latency_ms;
        }

        let transition = lock(&self.health).record_failure(error, latency_ms, Instant::now());
        if let Some(transition) = transition {
            announce(&self.events, &self.provider, transition);
        }
        latency_ms
    }

    /// Settle from a call result.
    pub fn settle<T>(self, result: &Result<T, LlmError>) -> u64 {
        match result {
            Ok(_) => self.succeed(),
            Err(e) => self.fail(e),
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(provider = %self.provider, "Call abandoned before an outcome");
            lock(&self.health).breaker.on_abandoned(self.trial);
        }
    }
}

impl std::fmt::Debug for BreakerPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("provider", &self.provider)
            .field("trial", &self.trial)
            .field("settled", &self.settled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(failure_threshold: u32) -> Arc<Mutex<ProviderHealth>> {
        let breaker = BreakerConfig {
            failure_threshold,
            open_duration_ms: 60_000,
            half_open_max_calls: 1,
            success_threshold: 1,
        };
        Arc::new(Mutex::new(ProviderHealth::new(
            &breaker,
            &HealthWindowConfig::default(),
        )))
    }

    #[test]
    fn fresh_record_reports_healthy() {
        let health = shared(3);
        let report = lock(&health).report("openai", Instant::now());
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.success_rate, 1.0);
        assert_eq!(report.circuit_state, CircuitStateKind::Closed);
        assert_eq!(report.average_latency_ms, None);
    }

    #[test]
    fn permits_feed_counters_and_latency() {
        let health = shared(10);
        let events = EventBus::new(8);

        BreakerPermit::acquire("p", health.clone(), events.clone())
            .unwrap()
            .succeed();
        BreakerPermit::acquire("p", health.clone(), events.clone())
            .unwrap()
            .fail(&LlmError::provider("boom"));

        let report = lock(&health).report("p", Instant::now());
        assert_eq!(report.total_requests, 2);
        assert_eq!(report.total_successes, 1);
        assert_eq!(report.total_failures, 1);
        assert_eq!(report.success_rate, 0.5);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.latency_samples, 2);
        assert_eq!(report.last_error.as_deref(), Some("provider error: boom"));
        assert!(report.last_error_at.is_some());
    }

    #[test]
    fn caller_side_failures_count_as_requests_only() {
        let health = shared(1);
        let events = EventBus::new(8);

        BreakerPermit::acquire("p", health.clone(), events.clone())
            .unwrap()
            .fail(&LlmError::Cancelled);
        BreakerPermit::acquire("p", health.clone(), events.clone())
            .unwrap()
            .fail(&LlmError::InvalidRequest("empty".to_string()));

        let report = lock(&health).report("p", Instant::now());
        assert_eq!(report.total_requests, 2);
        assert_eq!(report.total_failures, 0);
        assert_eq!(report.success_rate, 1.0);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.latency_samples, 0);
        assert!(report.last_error.is_none());
        assert_eq!(report.circuit_state, CircuitStateKind::Closed);
    }

    #[test]
    fn dropped_permit_is_not_a_request() {
        let health = shared(1);
        let permit = BreakerPermit::acquire("p", health.clone(), EventBus::new(8)).unwrap();
        drop(permit);

        let report = lock(&health).report("p", Instant::now());
        assert_eq!(report.total_requests, 0);
    }

    #[test]
    fn opening_publishes_state_change() {
        let health = shared(1);
        let events = EventBus::new(8);
        let mut rx = events.subscribe();

        BreakerPermit::acquire("p", health.clone(), events.clone())
            .unwrap()
            .fail(&LlmError::Overloaded("busy".to_string()));

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            ClientEvent::CircuitStateChanged {
                provider: "p".to_string(),
                from: CircuitStateKind::Closed,
                to: CircuitStateKind::Open,
            }
        );

        let err = BreakerPermit::acquire("p", health, events).unwrap_err();
        assert!(matches!(err, LlmError::ProviderUnavailable { .. }));
    }
}
