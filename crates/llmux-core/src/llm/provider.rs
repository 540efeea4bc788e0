//! LlmProvider trait definition.
//!
//! This is the capability interface every provider adapter implements.
//! Uses RPITIT for `chat` and `list_models`, and `Pin<Box<dyn Stream>>`
//! for `chat_stream` (streams need to be object-safe for the
//! [`BoxLlmProvider`](super::box_provider::BoxLlmProvider) wrapper).

use std::pin::Pin;

use futures_util::Stream;
use tokio_util::sync::CancellationToken;

use llmux_types::error::LlmError;
use llmux_types::llm::{ChatRequest, ChatResponse, ModelInfo, ProviderFeature, StreamChunk};

/// Boxed, finite, non-restartable sequence of response fragments.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send + 'static>>;

/// Trait for provider adapters (OpenAI-compatible, Anthropic, ...).
///
/// Adapters only map the canonical request to one remote API and back.
/// Resilience, caching and middleware live in the client; adapters must
/// honour the cancellation token by abandoning in-flight reads.
///
/// Implementations live in llmux-infra.
pub trait LlmProvider: Send + Sync {
    /// Registry name of this provider (e.g., "openai").
    fn name(&self) -> &str;

    /// Whether this adapter supports an optional feature.
    fn supports(&self, feature: ProviderFeature) -> bool;

    /// Send a chat request and receive the full response.
    fn chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<ChatResponse, LlmError>> + Send;

    /// Send a streaming chat request. Returns a stream of fragments.
    fn chat_stream(&self, request: ChatRequest, cancel: CancellationToken) -> ChunkStream;

    /// List the models this provider serves.
    fn list_models(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ModelInfo>, LlmError>> + Send;
}
