//! Event types for the llmux client event bus.
//!
//! `ClientEvent` is the unified notification broadcast while the client
//! serves calls. Events are fire-and-forget: the client never waits on
//! subscribers. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AbortReason, ErrorKind};
use crate::health::CircuitStateKind;

/// Events emitted by the client, the registry and the stream accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// A logical call has entered the executor.
    RequestStart {
        request_id: Uuid,
        provider: String,
        model: String,
    },

    /// A logical call completed successfully.
    RequestEnd {
        request_id: Uuid,
        provider: String,
        latency_ms: u64,
        cached: bool,
    },

    /// One attempt of a logical call failed (it may still be retried).
    RequestError {
        request_id: Uuid,
        provider: String,
        kind: ErrorKind,
        message: String,
    },

    CacheHit { key: String },

    CacheMiss { key: String },

    StreamStart { request_id: Uuid, provider: String },

    StreamChunk { request_id: Uuid, chunk_index: u32 },

    StreamEnd {
        request_id: Uuid,
        chunk_count: u32,
        duration_ms: u64,
    },

    StreamAbort {
        request_id: Uuid,
        reason: AbortReason,
    },

    /// The executor is about to re-issue a call after `delay_ms`.
    RetryAttempt {
        request_id: Uuid,
        attempt: u32,
        delay_ms: u64,
    },

    /// The executor is re-issuing a call against a different provider/model.
    FallbackAttempt {
        request_id: Uuid,
        provider: String,
        model: String,
    },

    ProviderRegistered { name: String, builtin: bool },

    CircuitStateChanged {
        provider: String,
        from: CircuitStateKind,
        to: CircuitStateKind,
    },
}
