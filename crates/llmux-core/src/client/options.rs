//! Per-call options and the shared retry budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio_util::sync::CancellationToken;

use llmux_types::config::StreamLimits;

/// Shared allowance of retryable failures.
///
/// Every retryable error seen by a call carrying the budget consumes one
/// unit. Once the budget is spent the executor stops honouring retry
/// signals, so an outage fails fast instead of multiplying traffic.
/// Clones share the same counter.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    limit: u32,
    used: Arc<AtomicU32>,
}

impl RetryBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            used: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Record one retryable failure. Returns `true` while the failure still
    /// fits within the budget.
    pub fn consume(&self) -> bool {
        self.used.fetch_add(1, Ordering::AcqRel) < self.limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.used.load(Ordering::Acquire) >= self.limit
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used())
    }
}

/// Knobs for a single logical call.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Neither read nor write the response cache.
    pub no_cache: bool,
    /// Always issue a fresh provider call, even if an identical one is in flight.
    pub no_dedup: bool,
    /// Ignore retry signals from the pipeline.
    pub skip_retries: bool,
    pub retry_budget: Option<RetryBudget>,
    /// Cancels the whole logical call, including pending retries.
    pub cancellation: Option<CancellationToken>,
    /// Overrides the configured stream limits for this call.
    pub stream_limits: Option<StreamLimits>,
}

impl ChatOptions {
    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn no_dedup(mut self) -> Self {
        self.no_dedup = true;
        self
    }

    pub fn skip_retries(mut self) -> Self {
        self.skip_retries = true;
        self
    }

    pub fn with_retry_budget(mut self, budget: RetryBudget) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_stream_limits(mut self, limits: StreamLimits) -> Self {
        self.stream_limits = Some(limits);
        self
    }

    /// Whether retry signals must be ignored from the start of the call.
    pub(crate) fn retries_disabled(&self) -> bool {
        self.skip_retries || self.retry_budget.as_ref().is_some_and(RetryBudget::is_exhausted)
    }
}
