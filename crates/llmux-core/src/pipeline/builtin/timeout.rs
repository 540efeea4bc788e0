//! Per-attempt request timeout.
//!
//! The request phase arms a timer that cancels the attempt's token; the
//! adapter sees the cancellation and abandons the call. The response and
//! error phases disarm it. A cancellation caused by the timer surfaces as
//! [`LlmError::Timeout`] rather than `Cancelled`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use uuid::Uuid;

use llmux_types::error::{ErrorKind, LlmError};
use llmux_types::llm::{ChatRequest, ChatResponse};

use crate::pipeline::{ErrorOutcome, Middleware, PipelineContext};

use super::priority;

const FIRED_KEY: &str = "timeout.fired";

type TimerKey = (Uuid, u32);

#[derive(Debug)]
pub struct TimeoutMiddleware {
    timeout: Duration,
    timers: Arc<DashMap<TimerKey, AbortHandle>>,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            timers: Arc::new(DashMap::new()),
        }
    }

    /// Number of armed timers.
    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    fn disarm(&self, ctx: &PipelineContext) {
        if let Some((_, handle)) = self.timers.remove(&(ctx.request_id(), ctx.attempt())) {
            handle.abort();
        }
    }

    fn after_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &str {
        "timeout"
    }

    fn priority(&self) -> i32 {
        priority::TIMEOUT
    }

    async fn before_request(
        &self,
        request: ChatRequest,
        ctx: &PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        let key = (ctx.request_id(), ctx.attempt());
        let token = ctx.cancellation().clone();
        let scratchpad = ctx.scratchpad().clone();
        let timers = self.timers.clone();
        let timeout = self.timeout;
        let attempt = ctx.attempt();

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            scratchpad.set(FIRED_KEY, u64::from(attempt));
            timers.remove(&key);
            token.cancel();
        });

        if let Some(previous) = self.timers.insert(key, task.abort_handle()) {
            previous.abort();
        }
        Ok(request)
    }

    async fn after_response(
        &self,
        response: ChatResponse,
        ctx: &PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        self.disarm(ctx);
        Ok(response)
    }

    async fn on_error(
        &self,
        error: LlmError,
        ctx: &PipelineContext,
    ) -> Result<ErrorOutcome, LlmError> {
        self.disarm(ctx);

        let fired = ctx.scratchpad().get_u64(FIRED_KEY) == Some(u64::from(ctx.attempt()));
        if fired && error.root_kind() == ErrorKind::Cancelled && !ctx.is_call_cancelled() {
            tracing::warn!(
                request_id = %ctx.request_id(),
                after_ms = self.after_ms(),
                "Request timed out"
            );
            return Ok(ErrorOutcome::Continue(LlmError::Timeout {
                after_ms: self.after_ms(),
            }));
        }
        Ok(ErrorOutcome::Continue(error))
    }
}
