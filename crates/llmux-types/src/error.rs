//! Error taxonomy for llmux.
//!
//! Every surfaced error carries a stable [`ErrorKind`], a retryability flag
//! and, when known, a suggested delay before retrying. `LlmError` is `Clone`
//! so that one failed deduplicated call can be handed to every waiter.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProviderNotFound,
    ProviderUnavailable,
    Pipeline,
    StreamAborted,
    CacheKey,
    CredentialNotSet,
    Provider,
    RateLimited,
    Overloaded,
    AuthenticationFailed,
    InvalidRequest,
    ContentBlocked,
    Timeout,
    Cancelled,
    Deserialization,
    Stream,
    Configuration,
    BatchSkipped,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProviderNotFound => "provider_not_found",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::Pipeline => "pipeline",
            ErrorKind::StreamAborted => "stream_aborted",
            ErrorKind::CacheKey => "cache_key",
            ErrorKind::CredentialNotSet => "credential_not_set",
            ErrorKind::Provider => "provider",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ContentBlocked => "content_blocked",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Deserialization => "deserialization",
            ErrorKind::Stream => "stream",
            ErrorKind::Configuration => "configuration",
            ErrorKind::BatchSkipped => "batch_skipped",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the middleware pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Request,
    Response,
    Error,
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelinePhase::Request => write!(f, "request"),
            PipelinePhase::Response => write!(f, "response"),
            PipelinePhase::Error => write!(f, "error"),
        }
    }
}

/// Why a stream stopped before the provider finished it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    Timeout { after_ms: u64 },
    Cancelled,
    MaxChunks { limit: u32 },
    MaxTokens { limit: u32 },
    Other { message: String },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Timeout { after_ms } => write!(f, "timed out after {after_ms}ms"),
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::MaxChunks { limit } => write!(f, "exceeded {limit} chunks"),
            AbortReason::MaxTokens { limit } => write!(f, "exceeded {limit} tokens"),
            AbortReason::Other { message } => write!(f, "{message}"),
        }
    }
}

/// Errors from LLM client operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LlmError {
    #[error("provider '{name}' is not registered")]
    ProviderNotFound { name: String },

    #[error("provider '{provider}' is temporarily unavailable (circuit open, retry after {retry_after_ms}ms)")]
    ProviderUnavailable { provider: String, retry_after_ms: u64 },

    #[error("middleware '{middleware}' failed during {phase} phase: {message}")]
    Pipeline {
        middleware: String,
        phase: PipelinePhase,
        message: String,
        #[source]
        cause: Option<Box<LlmError>>,
    },

    #[error("stream aborted: {reason}")]
    StreamAborted { reason: AbortReason },

    #[error("cache key derivation failed: {0}")]
    CacheKey(String),

    #[error("credential not set for provider '{provider}'")]
    CredentialNotSet { provider: String },

    #[error("provider error: {message}")]
    Provider { message: String, status: Option<u16> },

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("provider overloaded: {0}")]
    Overloaded(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("content blocked: {0}")]
    ContentBlocked(String),

    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("request cancelled")]
    Cancelled,

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("batch request skipped: {0}")]
    BatchSkipped(String),
}

impl LlmError {
    /// Shorthand for a generic provider-side failure without an HTTP status.
    pub fn provider(message: impl Into<String>) -> Self {
        LlmError::Provider {
            message: message.into(),
            status: None,
        }
    }

    /// Stable code for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::ProviderNotFound { .. } => ErrorKind::ProviderNotFound,
            LlmError::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            LlmError::Pipeline { .. } => ErrorKind::Pipeline,
            LlmError::StreamAborted { .. } => ErrorKind::StreamAborted,
            LlmError::CacheKey(_) => ErrorKind::CacheKey,
            LlmError::CredentialNotSet { .. } => ErrorKind::CredentialNotSet,
            LlmError::Provider { .. } => ErrorKind::Provider,
            LlmError::RateLimited { .. } => ErrorKind::RateLimited,
            LlmError::Overloaded(_) => ErrorKind::Overloaded,
            LlmError::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            LlmError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            LlmError::ContentBlocked(_) => ErrorKind::ContentBlocked,
            LlmError::Timeout { .. } => ErrorKind::Timeout,
            LlmError::Cancelled => ErrorKind::Cancelled,
            LlmError::Deserialization(_) => ErrorKind::Deserialization,
            LlmError::Stream(_) => ErrorKind::Stream,
            LlmError::Configuration(_) => ErrorKind::Configuration,
            LlmError::BatchSkipped(_) => ErrorKind::BatchSkipped,
        }
    }

    /// The error kind after unwrapping pipeline wrappers.
    pub fn root_kind(&self) -> ErrorKind {
        match self {
            LlmError::Pipeline {
                cause: Some(cause), ..
            } => cause.root_kind(),
            other => other.kind(),
        }
    }

    /// Whether repeating the same call later could plausibly succeed.
    ///
    /// Pipeline errors inherit retryability from their cause.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::ProviderUnavailable { .. }
            | LlmError::RateLimited { .. }
            | LlmError::Overloaded(_)
            | LlmError::Timeout { .. }
            | LlmError::Stream(_) => true,
            LlmError::Provider { status, .. } => match status {
                Some(code) => *code >= 500 || *code == 408 || *code == 429,
                None => true,
            },
            LlmError::StreamAborted { reason } => {
                matches!(reason, AbortReason::Timeout { .. })
            }
            LlmError::Pipeline { cause, .. } => {
                cause.as_ref().is_some_and(|c| c.is_retryable())
            }
            _ => false,
        }
    }

    /// Suggested delay before retrying, when the error carries one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            LlmError::ProviderUnavailable { retry_after_ms, .. } => Some(*retry_after_ms),
            LlmError::RateLimited { retry_after_ms } => *retry_after_ms,
            LlmError::Pipeline { cause, .. } => cause.as_ref().and_then(|c| c.retry_after_ms()),
            _ => None,
        }
    }

    /// Whether this outcome says something about the provider's health.
    ///
    /// Caller-side conditions (cancellation, request rejected before sending,
    /// missing credentials) never count toward the circuit breaker.
    pub fn counts_against_provider(&self) -> bool {
        !matches!(
            self,
            LlmError::Cancelled
                | LlmError::InvalidRequest(_)
                | LlmError::ContentBlocked(_)
                | LlmError::CredentialNotSet { .. }
                | LlmError::ProviderNotFound { .. }
                | LlmError::ProviderUnavailable { .. }
                | LlmError::CacheKey(_)
                | LlmError::Configuration(_)
                | LlmError::BatchSkipped(_)
                | LlmError::StreamAborted {
                    reason: AbortReason::Cancelled
                        | AbortReason::MaxChunks { .. }
                        | AbortReason::MaxTokens { .. }
                }
        )
    }
}

/// Errors raised by a response cache backend.
///
/// Cache failures never fail a call: the client logs them and carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache serialization error: {0}")]
    Serialization(String),
}
