//! Read-only provider health projections.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Observable state of a provider's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitStateKind::Closed => write!(f, "closed"),
            CircuitStateKind::Open => write!(f, "open"),
            CircuitStateKind::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Coarse health classification derived from the success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Success rate of at least 0.9.
    Healthy,
    /// Success rate in [0.5, 0.9).
    Degraded,
    /// Success rate below 0.5.
    Unhealthy,
}

impl HealthStatus {
    pub fn from_success_rate(rate: f64) -> Self {
        if rate >= 0.9 {
            HealthStatus::Healthy
        } else if rate >= 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Snapshot of one provider's health, for status displays and routing decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealthReport {
    pub name: String,
    pub status: HealthStatus,
    pub circuit_state: CircuitStateKind,
    /// Successes over calls the provider answered or failed; cancelled and
    /// rejected requests are left out.
    pub success_rate: f64,
    /// Every settled call, including ones that ended on the caller's side.
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub average_latency_ms: Option<f64>,
    pub latency_samples: usize,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Outcome of a best-effort warmup probe against one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupResult {
    pub provider: String,
    pub ok: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_boundaries() {
        assert_eq!(HealthStatus::from_success_rate(1.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_success_rate(0.9), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_success_rate(0.89), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_success_rate(0.5), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_success_rate(0.49), HealthStatus::Unhealthy);
    }

    #[test]
    fn circuit_state_display() {
        assert_eq!(CircuitStateKind::HalfOpen.to_string(), "half_open");
    }
}
