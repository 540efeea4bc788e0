use llmux_types::error::LlmError;
use llmux_types::llm::{ChatRequest, ChatResponse};

use crate::pipeline::{ErrorOutcome, Middleware, PipelineContext};

use super::priority;

/// Emits one `tracing` event per phase.
#[derive(Debug, Clone, Default)]
pub struct LoggingMiddleware {
    priority: Option<i32>,
}

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn priority(&self) -> i32 {
        self.priority.unwrap_or(priority::LOGGING)
    }

    async fn before_request(
        &self,
        request: ChatRequest,
        ctx: &PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        tracing::info!(
            request_id = %ctx.request_id(),
            attempt = ctx.attempt(),
            provider = %request.provider,
            model = %request.model,
            messages = request.messages.len(),
            "LLM request"
        );
        Ok(request)
    }

    async fn after_response(
        &self,
        response: ChatResponse,
        ctx: &PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        tracing::info!(
            request_id = %ctx.request_id(),
            provider = %response.provider,
            model = %response.model,
            latency_ms = response.latency_ms.unwrap_or_else(|| ctx.elapsed_ms()),
            cached = response.cached,
            completion_tokens = response.usage.map(|u| u.completion_tokens).unwrap_or(0),
            "LLM response"
        );
        Ok(response)
    }

    async fn on_error(
        &self,
        error: LlmError,
        ctx: &PipelineContext,
    ) -> Result<ErrorOutcome, LlmError> {
        tracing::warn!(
            request_id = %ctx.request_id(),
            attempt = ctx.attempt(),
            kind = %error.root_kind(),
            retryable = error.is_retryable(),
            error = %error,
            "LLM request failed"
        );
        Ok(ErrorOutcome::Continue(error))
    }
}
