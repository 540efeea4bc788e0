//! Per-request pipeline context and its signalling scratchpad.
//!
//! A `PipelineContext` is created when a logical call enters the client and
//! discarded once it settles. Retries and fallbacks run as further attempts
//! of the same context: they keep the request id, start time and scratchpad
//! but get a fresh child cancellation token, so a fired per-attempt timeout
//! never poisons the next attempt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Well-known scratchpad keys used by the built-in middlewares and the
/// executor to signal each other.
pub mod keys {
    /// `true` when the error phase asks the executor to re-issue the call.
    pub const RETRY_REQUESTED: &str = "retry.requested";
    /// Delay in milliseconds before the requested retry.
    pub const RETRY_DELAY_MS: &str = "retry.delay_ms";
    /// `true` when the executor will not honour retries for this call
    /// (opted out, or the shared retry budget is spent).
    pub const RETRY_DISABLED: &str = "retry.disabled";
    /// Number of retries signalled so far for this logical call.
    pub const RETRY_COUNT: &str = "retry.count";
    /// Provider to re-issue the call against.
    pub const FALLBACK_PROVIDER: &str = "fallback.provider";
    /// Model to re-issue the call with.
    pub const FALLBACK_MODEL: &str = "fallback.model";
    /// `["provider/model", ...]` pairs already attempted.
    pub const FALLBACK_TRIED: &str = "fallback.tried";
    /// Provider and model of the current attempt, set by the executor.
    pub const PROVIDER: &str = "request.provider";
    pub const MODEL: &str = "request.model";
}

/// Concurrent key-value scratchpad shared by all middlewares of one call.
///
/// Cloning produces a shared view of the same data. Values are cloned on
/// read so no `DashMap` guard outlives the call.
#[derive(Debug, Clone, Default)]
pub struct Scratchpad {
    inner: Arc<DashMap<String, Value>>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key).map(|r| r.value().clone())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Whether `key` holds `true`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Execution context for one logical request.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    request_id: Uuid,
    started_at: Instant,
    created_at: DateTime<Utc>,
    root: CancellationToken,
    cancellation: CancellationToken,
    scratchpad: Scratchpad,
    attempt: u32,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::with_cancellation(&CancellationToken::new())
    }

    /// Create a context whose cancellation follows `parent`.
    pub fn with_cancellation(parent: &CancellationToken) -> Self {
        let root = parent.child_token();
        Self {
            request_id: Uuid::now_v7(),
            started_at: Instant::now(),
            created_at: Utc::now(),
            cancellation: root.child_token(),
            root,
            scratchpad: Scratchpad::new(),
            attempt: 0,
        }
    }

    /// Context for the next attempt of the same logical call.
    pub fn next_attempt(&self) -> Self {
        Self {
            request_id: self.request_id,
            started_at: self.started_at,
            created_at: self.created_at,
            root: self.root.clone(),
            cancellation: self.root.child_token(),
            scratchpad: self.scratchpad.clone(),
            attempt: self.attempt.saturating_add(1),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Zero-based attempt number (retries and fallbacks both count).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Token for the current attempt. Cancelled with the whole call, or on
    /// its own by a per-attempt timeout.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Token for the whole logical call.
    pub fn call_cancellation(&self) -> &CancellationToken {
        &self.root
    }

    pub fn scratchpad(&self) -> &Scratchpad {
        &self.scratchpad
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Whether the whole logical call (not just this attempt) was cancelled.
    pub fn is_call_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel the logical call and every attempt derived from it.
    pub fn cancel(&self) {
        self.root.cancel();
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scratchpad_is_shared_between_clones() {
        let pad = Scratchpad::new();
        let view = pad.clone();
        view.set(keys::RETRY_REQUESTED, true);
        assert!(pad.flag(keys::RETRY_REQUESTED));
        assert!(!pad.flag("missing"));
    }

    #[test]
    fn typed_getters() {
        let pad = Scratchpad::new();
        pad.set(keys::RETRY_DELAY_MS, 250u64);
        pad.set(keys::FALLBACK_PROVIDER, "groq");
        pad.set("list", json!(["a"]));
        assert_eq!(pad.get_u64(keys::RETRY_DELAY_MS), Some(250));
        assert_eq!(pad.get_str(keys::FALLBACK_PROVIDER).as_deref(), Some("groq"));
        assert_eq!(pad.get_str("list"), None);
        assert_eq!(pad.remove("list"), Some(json!(["a"])));
        assert_eq!(pad.len(), 2);
    }

    #[test]
    fn next_attempt_shares_identity_and_scratchpad() {
        let ctx = PipelineContext::new();
        ctx.scratchpad().set("k", 1);
        let next = ctx.next_attempt();

        assert_eq!(next.request_id(), ctx.request_id());
        assert_eq!(next.attempt(), 1);
        assert_eq!(next.scratchpad().get_u64("k"), Some(1));
    }

    #[test]
    fn attempt_cancellation_does_not_leak_into_next_attempt() {
        let ctx = PipelineContext::new();
        ctx.cancellation().cancel();
        assert!(ctx.is_cancelled());
        assert!(!ctx.is_call_cancelled());

        let next = ctx.next_attempt();
        assert!(!next.is_cancelled());
    }

    #[test]
    fn cancelling_the_call_cancels_every_attempt() {
        let parent = CancellationToken::new();
        let ctx = PipelineContext::with_cancellation(&parent);
        let next = ctx.next_attempt();

        parent.cancel();
        assert!(ctx.is_cancelled());
        assert!(next.is_cancelled());
        assert!(next.is_call_cancelled());
    }
}
