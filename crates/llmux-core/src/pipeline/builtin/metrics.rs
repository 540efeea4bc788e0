//! Request metrics collection.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use llmux_types::error::LlmError;
use llmux_types::llm::{ChatRequest, ChatResponse};

use crate::pipeline::{ErrorOutcome, Middleware, PipelineContext};

use super::priority;

/// Point-in-time copy of the collected metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Attempts that entered the request phase.
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Failures keyed by root error kind code.
    pub failures_by_kind: BTreeMap<String, u64>,
    pub cached_responses: u64,
    pub average_latency_ms: Option<f64>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Default)]
struct MetricsState {
    snapshot: MetricsSnapshot,
    latency_total_ms: u128,
    latency_count: u64,
}

/// Counts requests, outcomes, latency and tokens.
///
/// Register it through an `Arc` to keep reading it:
/// `pipeline.add(metrics.clone())` with `metrics: Arc<MetricsMiddleware>`.
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    state: Mutex<MetricsState>,
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot
            .clone()
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = MetricsState::default();
    }
}

impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    fn priority(&self) -> i32 {
        priority::METRICS
    }

    async fn before_request(
        &self,
        request: ChatRequest,
        _ctx: &PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot
            .requests += 1;
        Ok(request)
    }

    async fn after_response(
        &self,
        response: ChatResponse,
        ctx: &PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        let latency_ms = response.latency_ms.unwrap_or_else(|| ctx.elapsed_ms());
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.latency_total_ms += u128::from(latency_ms);
        state.latency_count += 1;
        let average = state.latency_total_ms as f64 / state.latency_count as f64;

        let snapshot = &mut state.snapshot;
        snapshot.successes += 1;
        snapshot.average_latency_ms = Some(average);
        if response.cached {
            snapshot.cached_responses += 1;
        }
        if let Some(usage) = response.usage {
            snapshot.prompt_tokens += u64::from(usage.prompt_tokens);
            snapshot.completion_tokens += u64::from(usage.completion_tokens);
        }
        drop(state);
        Ok(response)
    }

    async fn on_error(
        &self,
        error: LlmError,
        _ctx: &PipelineContext,
    ) -> Result<ErrorOutcome, LlmError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.snapshot.failures += 1;
        *state
            .snapshot
            .failures_by_kind
            .entry(error.root_kind().as_str().to_string())
            .or_insert(0) += 1;
        drop(state);
        Ok(ErrorOutcome::Continue(error))
    }
}
