//! BoxLlmProvider -- object-safe dynamic dispatch wrapper for LlmProvider.
//!
//! 1. Define an object-safe `LlmProviderDyn` trait with boxed futures
//! 2. Blanket-impl `LlmProviderDyn` for all `T: LlmProvider`
//! 3. `BoxLlmProvider` wraps `Box<dyn LlmProviderDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use llmux_types::error::LlmError;
use llmux_types::llm::{ChatRequest, ChatResponse, ModelInfo, ProviderFeature};

use super::provider::{ChunkStream, LlmProvider};

/// Object-safe version of [`LlmProvider`] with boxed futures.
///
/// A blanket implementation is provided for all types implementing `LlmProvider`.
pub trait LlmProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, feature: ProviderFeature) -> bool;

    fn chat_boxed<'a>(
        &'a self,
        request: &'a ChatRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, LlmError>> + Send + 'a>>;

    fn chat_stream_boxed(&self, request: ChatRequest, cancel: CancellationToken) -> ChunkStream;

    fn list_models_boxed(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ModelInfo>, LlmError>> + Send + '_>>;
}

impl<T: LlmProvider> LlmProviderDyn for T {
    fn name(&self) -> &str {
        LlmProvider::name(self)
    }

    fn supports(&self, feature: ProviderFeature) -> bool {
        LlmProvider::supports(self, feature)
    }

    fn chat_boxed<'a>(
        &'a self,
        request: &'a ChatRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, LlmError>> + Send + 'a>> {
        Box::pin(self.chat(request, cancel))
    }

    fn chat_stream_boxed(&self, request: ChatRequest, cancel: CancellationToken) -> ChunkStream {
        self.chat_stream(request, cancel)
    }

    fn list_models_boxed(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ModelInfo>, LlmError>> + Send + '_>> {
        Box::pin(self.list_models())
    }
}

/// Type-erased provider adapter for runtime selection by name.
///
/// Since `LlmProvider` uses RPITIT, it cannot be used as a trait object directly.
/// `BoxLlmProvider` provides equivalent methods that delegate to the inner
/// `LlmProviderDyn` trait object.
pub struct BoxLlmProvider {
    inner: Box<dyn LlmProviderDyn + Send + Sync>,
}

impl BoxLlmProvider {
    /// Wrap a concrete `LlmProvider` in a type-erased box.
    pub fn new<T: LlmProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn supports(&self, feature: ProviderFeature) -> bool {
        self.inner.supports(feature)
    }

    pub async fn chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, LlmError> {
        self.inner.chat_boxed(request, cancel).await
    }

    pub fn chat_stream(&self, request: ChatRequest, cancel: CancellationToken) -> ChunkStream {
        self.inner.chat_stream_boxed(request, cancel)
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        self.inner.list_models_boxed().await
    }
}

impl std::fmt::Debug for BoxLlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxLlmProvider")
            .field("name", &self.name())
            .finish()
    }
}
