//! Retry-intent signalling.
//!
//! The middleware never re-issues anything itself: on a retryable failure
//! it marks the scratchpad with [`keys::RETRY_REQUESTED`] and a delay, and
//! the executor does the waiting and the re-issue.

use std::time::Duration;

use rand::Rng;

use llmux_types::error::{ErrorKind, LlmError};

use crate::pipeline::{ErrorOutcome, Middleware, PipelineContext, keys};

use super::priority;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries for one logical call.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Maximum jitter as a fraction of the delay (0.0 to 1.0).
    pub jitter_factor: f64,
    /// Restrict retries to these error kinds. `None` retries anything
    /// retryable.
    pub retry_on: Option<Vec<ErrorKind>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            retry_on: None,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_retry_on(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.retry_on = Some(kinds);
        self
    }

    pub fn should_retry(&self, error: &LlmError) -> bool {
        if !error.is_retryable() {
            return false;
        }
        match &self.retry_on {
            Some(kinds) => kinds.contains(&error.root_kind()),
            None => true,
        }
    }

    /// Delay before retry number `retry` (zero-based), capped at `max_delay`.
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);
        self.add_jitter(Duration::from_millis(capped_ms.max(0.0) as u64))
    }

    /// Honour a provider-supplied wait hint, still bounded by `max_delay`.
    pub fn delay_for(&self, error: &LlmError, retry: u32) -> Duration {
        match error.retry_after_ms() {
            Some(ms) => Duration::from_millis(ms).min(self.max_delay),
            None => self.calculate_delay(retry),
        }
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter_range = delay.as_millis() as f64 * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        let jittered = (delay.as_millis() as f64 + jitter).max(0.0) as u64;
        Duration::from_millis(jittered).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryMiddleware {
    policy: RetryPolicy,
}

impl RetryMiddleware {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    fn priority(&self) -> i32 {
        priority::RETRY
    }

    async fn on_error(
        &self,
        error: LlmError,
        ctx: &PipelineContext,
    ) -> Result<ErrorOutcome, LlmError> {
        let pad = ctx.scratchpad();
        if !self.policy.should_retry(&error)
            || ctx.is_call_cancelled()
            || pad.flag(keys::RETRY_DISABLED)
        {
            return Ok(ErrorOutcome::Continue(error));
        }

        let retries = pad
            .get_u64(keys::RETRY_COUNT)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);
        if retries >= self.policy.max_retries {
            tracing::debug!(
                request_id = %ctx.request_id(),
                retries,
                "Retry limit reached"
            );
            return Ok(ErrorOutcome::Continue(error));
        }

        let delay = self.policy.delay_for(&error, retries);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        pad.set(keys::RETRY_REQUESTED, true);
        pad.set(keys::RETRY_DELAY_MS, delay_ms);
        pad.set(keys::RETRY_COUNT, u64::from(retries) + 1);
        tracing::debug!(
            request_id = %ctx.request_id(),
            retry = retries + 1,
            delay_ms,
            "Retry requested"
        );
        Ok(ErrorOutcome::Continue(error))
    }
}
