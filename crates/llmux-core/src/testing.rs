//! Scriptable mock provider shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use llmux_types::error::LlmError;
use llmux_types::llm::{
    ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason, ModelInfo, ProviderFeature,
    StreamChunk, Usage,
};

use crate::llm::{BoxLlmProvider, ChunkStream, LlmProvider};
use crate::registry::ProviderRegistration;

#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    Text(String),
    Fail(LlmError),
}

/// Provider double: replies from a script, then falls back to a default.
#[derive(Clone)]
pub(crate) struct MockProvider {
    name: String,
    calls: Arc<AtomicU32>,
    script: Arc<Mutex<VecDeque<MockReply>>>,
    default_reply: MockReply,
    delay: Duration,
    chunks: Arc<Vec<Result<StreamChunk, LlmError>>>,
    chunk_delay: Duration,
    models_delay: Duration,
}

impl MockProvider {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: Arc::new(AtomicU32::new(0)),
            script: Arc::new(Mutex::new(VecDeque::new())),
            default_reply: MockReply::Text(format!("hello from {name}")),
            delay: Duration::ZERO,
            chunks: Arc::new(Vec::new()),
            chunk_delay: Duration::ZERO,
            models_delay: Duration::ZERO,
        }
    }

    pub(crate) fn failing(name: &str, error: LlmError) -> Self {
        Self::new(name).with_default(MockReply::Fail(error))
    }

    pub(crate) fn with_default(mut self, reply: MockReply) -> Self {
        self.default_reply = reply;
        self
    }

    pub(crate) fn with_script(self, replies: Vec<MockReply>) -> Self {
        self.script.lock().unwrap().extend(replies);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_chunks(mut self, chunks: Vec<Result<StreamChunk, LlmError>>) -> Self {
        self.chunks = Arc::new(chunks);
        self
    }

    pub(crate) fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub(crate) fn with_models_delay(mut self, delay: Duration) -> Self {
        self.models_delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn registration(&self) -> ProviderRegistration {
        let mock = self.clone();
        ProviderRegistration::new(move |_ctx| Ok(BoxLlmProvider::new(mock.clone())))
    }

    fn next_reply(&self) -> MockReply {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

pub(crate) fn text_response(provider: &str, model: &str, text: &str) -> ChatResponse {
    ChatResponse {
        id: "resp-1".to_string(),
        provider: provider.to_string(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage::assistant(text),
            finish_reason: Some(FinishReason::Stop),
        }],
        usage: Some(Usage::new(10, 5)),
        created_at: Utc::now(),
        latency_ms: None,
        cached: false,
    }
}

pub(crate) fn request(provider: &str, text: &str) -> ChatRequest {
    ChatRequest::new(provider, "mock-model").with_message(ChatMessage::user(text))
}

impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, feature: ProviderFeature) -> bool {
        matches!(feature, ProviderFeature::Streaming)
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        match self.next_reply() {
            MockReply::Text(text) => Ok(text_response(&self.name, &request.model, &text)),
            MockReply::Fail(err) => Err(err),
        }
    }

    fn chat_stream(&self, _request: ChatRequest, cancel: CancellationToken) -> ChunkStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chunks = self.chunks.clone();
        let delay = self.chunk_delay;
        Box::pin(async_stream::stream! {
            for chunk in chunks.iter() {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            yield Err(LlmError::Cancelled);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                yield chunk.clone();
            }
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        if !self.models_delay.is_zero() {
            tokio::time::sleep(self.models_delay).await;
        }
        match &self.default_reply {
            MockReply::Fail(err) => Err(err.clone()),
            MockReply::Text(_) => Ok(vec![ModelInfo {
                id: "mock-model".to_string(),
                owned_by: None,
            }]),
        }
    }
}
