//! Batch execution in fixed-size concurrent chunks.

use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use llmux_types::error::LlmError;
use llmux_types::llm::{ChatRequest, ChatResponse};

use super::{ChatOptions, LlmClient, RetryBudget};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Requests in flight at once; each chunk of this size completes before
    /// the next starts.
    pub concurrency: usize,
    /// Start no further chunks once any request has failed.
    pub stop_on_error: bool,
    /// Shared by every request in the batch.
    pub retry_budget: Option<RetryBudget>,
    pub cancellation: Option<CancellationToken>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            stop_on_error: false,
            retry_budget: None,
            cancellation: None,
        }
    }
}

impl BatchOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn stop_on_error(mut self) -> Self {
        self.stop_on_error = true;
        self
    }

    pub fn with_retry_budget(mut self, budget: RetryBudget) -> Self {
        self.retry_budget = Some(budget);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    /// Requests that ran and failed (skipped requests are not counted).
    pub failed: usize,
    pub skipped: usize,
    pub retryable_errors: usize,
    pub duration_ms: u64,
}

/// Per-request outcomes, in input order.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub results: Vec<Result<ChatResponse, LlmError>>,
    pub summary: BatchSummary,
}

impl BatchResult {
    pub fn successes(&self) -> impl Iterator<Item = &ChatResponse> {
        self.results.iter().filter_map(|r| r.as_ref().ok())
    }
}

impl LlmClient {
    /// Run `requests` in chunks of `options.concurrency`.
    ///
    /// Failures are recorded per index and never abort the batch unless
    /// `stop_on_error` is set, in which case every request of later chunks
    /// is reported as [`LlmError::BatchSkipped`].
    pub async fn chat_batch(&self, requests: Vec<ChatRequest>, options: BatchOptions) -> BatchResult {
        let started = Instant::now();
        let total = requests.len();
        let concurrency = options.concurrency.max(1);
        let mut results: Vec<Result<ChatResponse, LlmError>> = Vec::with_capacity(total);
        let mut retryable_errors = 0usize;
        let mut stopped = false;

        tracing::info!(total, concurrency, "Starting batch");

        let mut pending = requests.into_iter();
        loop {
            let chunk: Vec<ChatRequest> = pending.by_ref().take(concurrency).collect();
            if chunk.is_empty() {
                break;
            }
            if stopped {
                results.extend(chunk.iter().map(|_| {
                    Err(LlmError::BatchSkipped(
                        "an earlier request in the batch failed".to_string(),
                    ))
                }));
                continue;
            }

            let calls = chunk.into_iter().map(|request| {
                let chat_options = ChatOptions {
                    retry_budget: options.retry_budget.clone(),
                    cancellation: options.cancellation.clone(),
                    ..ChatOptions::default()
                };
                self.chat_with(request, chat_options)
            });
            for outcome in join_all(calls).await {
                if let Err(error) = &outcome {
                    if error.is_retryable() {
                        retryable_errors += 1;
                    }
                    if options.stop_on_error {
                        stopped = true;
                    }
                }
                results.push(outcome);
            }
        }

        let skipped = results
            .iter()
            .filter(|r| matches!(r, Err(LlmError::BatchSkipped(_))))
            .count();
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let summary = BatchSummary {
            total,
            succeeded,
            failed: total - succeeded - skipped,
            skipped,
            retryable_errors,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        tracing::info!(
            total,
            succeeded,
            failed = summary.failed,
            skipped,
            duration_ms = summary.duration_ms,
            "Batch finished"
        );

        BatchResult { results, summary }
    }
}
