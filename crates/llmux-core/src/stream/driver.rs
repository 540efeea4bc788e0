//! Pulls fragments from an admitted provider stream into an accumulator.
//!
//! The driver races every read against the call's cancellation token and
//! the stream deadline, settles the breaker permit exactly once with the
//! stream's outcome, and runs the accumulator's cleanup when dropped.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use llmux_types::error::{AbortReason, LlmError};
use llmux_types::event::ClientEvent;
use llmux_types::llm::{ChatResponse, StreamChunk};

use super::accumulator::StreamAccumulator;
use crate::event::EventBus;
use crate::llm::ChunkStream;
use crate::registry::{BreakerPermit, BreakerStream};

enum Step {
    Abort(AbortReason),
    Item(Option<Result<StreamChunk, LlmError>>),
}

pub struct StreamDriver {
    request_id: Uuid,
    stream: ChunkStream,
    permit: Option<BreakerPermit>,
    accumulator: StreamAccumulator,
    cancel: CancellationToken,
    deadline: Option<(Instant, u64)>,
    events: EventBus,
}

impl StreamDriver {
    /// Start driving `opened`. The deadline is measured from now.
    pub fn new(
        request_id: Uuid,
        opened: BreakerStream,
        accumulator: StreamAccumulator,
        cancel: CancellationToken,
        timeout: Option<Duration>,
        events: EventBus,
    ) -> Self {
        let BreakerStream { stream, permit } = opened;
        events.publish(ClientEvent::StreamStart {
            request_id,
            provider: permit.provider().to_string(),
        });
        let deadline = timeout.map(|t| {
            (
                Instant::now() + t,
                u64::try_from(t.as_millis()).unwrap_or(u64::MAX),
            )
        });
        Self {
            request_id,
            stream,
            permit: Some(permit),
            accumulator,
            cancel,
            deadline,
            events,
        }
    }

    pub fn accumulator(&self) -> &StreamAccumulator {
        &self.accumulator
    }

    /// Next accepted fragment.
    ///
    /// `None` once the stream has ended for any reason. An abort (timeout,
    /// cancellation, limit) or a provider failure is reported as one
    /// `Err` item, after which the driver is finished.
    pub async fn next_chunk(&mut self) -> Option<Result<StreamChunk, LlmError>> {
        if !self.accumulator.is_accumulating() {
            return None;
        }

        let deadline = self.deadline;
        let step = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Step::Abort(AbortReason::Cancelled),
            _ = async {
                match deadline {
                    Some((at, _)) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => Step::Abort(AbortReason::Timeout {
                after_ms: deadline.map(|(_, ms)| ms).unwrap_or_default(),
            }),
            item = self.stream.next() => Step::Item(item),
        };

        match step {
            Step::Abort(reason) => Some(Err(self.abort(reason))),
            Step::Item(Some(Ok(chunk))) => match self.accumulator.process_chunk(&chunk) {
                Ok(()) => {
                    self.events.publish(ClientEvent::StreamChunk {
                        request_id: self.request_id,
                        chunk_index: self.accumulator.chunk_count().saturating_sub(1),
                    });
                    Some(Ok(chunk))
                }
                Err(error) => {
                    // The accumulator has already moved to Aborted.
                    if let LlmError::StreamAborted { reason } = &error {
                        self.announce_abort(reason.clone());
                    }
                    self.settle_failure(&error);
                    Some(Err(error))
                }
            },
            Step::Item(Some(Err(LlmError::Cancelled))) => {
                Some(Err(self.abort(AbortReason::Cancelled)))
            }
            Step::Item(Some(Err(error))) => {
                let reason = AbortReason::Other {
                    message: error.to_string(),
                };
                self.accumulator.abort(reason.clone());
                self.announce_abort(reason);
                self.settle_failure(&error);
                Some(Err(error))
            }
            Step::Item(None) => {
                self.accumulator.complete();
                if let Some(permit) = self.permit.take() {
                    permit.succeed();
                }
                tracing::debug!(
                    request_id = %self.request_id,
                    chunks = self.accumulator.chunk_count(),
                    ttfc_ms = ?self.accumulator.time_to_first_chunk_ms(),
                    "Stream completed"
                );
                self.events.publish(ClientEvent::StreamEnd {
                    request_id: self.request_id,
                    chunk_count: self.accumulator.chunk_count(),
                    duration_ms: self.accumulator.duration_ms(),
                });
                None
            }
        }
    }

    /// The response accumulated so far.
    pub fn response(&self) -> ChatResponse {
        self.accumulator.get_response()
    }

    fn abort(&mut self, reason: AbortReason) -> LlmError {
        self.accumulator.abort(reason.clone());
        self.announce_abort(reason.clone());
        let error = LlmError::StreamAborted { reason };
        self.settle_failure(&error);
        error
    }

    fn announce_abort(&self, reason: AbortReason) {
        tracing::warn!(request_id = %self.request_id, %reason, "Stream aborted");
        self.events.publish(ClientEvent::StreamAbort {
            request_id: self.request_id,
            reason,
        });
    }

    fn settle_failure(&mut self, error: &LlmError) {
        if let Some(permit) = self.permit.take() {
            permit.fail(error);
        }
    }
}

impl Drop for StreamDriver {
    fn drop(&mut self) {
        if self.accumulator.is_accumulating() {
            tracing::debug!(request_id = %self.request_id, "Stream consumer exited early");
        }
        self.accumulator.cleanup();
    }
}

impl std::fmt::Debug for StreamDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDriver")
            .field("request_id", &self.request_id)
            .field("accumulator", &self.accumulator)
            .finish()
    }
}
