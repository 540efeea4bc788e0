//! Client-side rate limiting over a rolling one-minute window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use llmux_types::error::LlmError;
use llmux_types::llm::ChatRequest;

use crate::pipeline::{Middleware, PipelineContext};

use super::priority;

const WINDOW: Duration = Duration::from_secs(60);

/// Caps requests per provider per rolling minute.
///
/// A rejected request fails with a retryable [`LlmError::RateLimited`]
/// whose hint is the time until the oldest admitted request leaves the
/// window.
#[derive(Debug)]
pub struct RateLimitMiddleware {
    max_per_minute: u32,
    window: Duration,
    admitted: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimitMiddleware {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            window: WINDOW,
            admitted: Mutex::new(HashMap::new()),
        }
    }

    /// Requests admitted for `provider` within the current window.
    pub fn in_window(&self, provider: &str) -> usize {
        let now = Instant::now();
        let admitted = self.admitted.lock().unwrap_or_else(PoisonError::into_inner);
        admitted.get(provider).map_or(0, |stamps| {
            stamps
                .iter()
                .filter(|at| now.saturating_duration_since(**at) < self.window)
                .count()
        })
    }

    fn try_admit(&self, provider: &str, now: Instant) -> Result<(), u64> {
        let mut admitted = self.admitted.lock().unwrap_or_else(PoisonError::into_inner);
        let stamps = admitted.entry(provider.to_string()).or_default();
        while let Some(oldest) = stamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= self.max_per_minute as usize {
            let wait = stamps
                .front()
                .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(u64::try_from(wait.as_millis()).unwrap_or(u64::MAX).max(1));
        }

        stamps.push_back(now);
        Ok(())
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn priority(&self) -> i32 {
        priority::RATE_LIMIT
    }

    async fn before_request(
        &self,
        request: ChatRequest,
        ctx: &PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        match self.try_admit(&request.provider, Instant::now()) {
            Ok(()) => Ok(request),
            Err(retry_after_ms) => {
                tracing::warn!(
                    request_id = %ctx.request_id(),
                    provider = %request.provider,
                    retry_after_ms,
                    "Client-side rate limit reached"
                );
                Err(LlmError::RateLimited {
                    retry_after_ms: Some(retry_after_ms),
                })
            }
        }
    }
}
