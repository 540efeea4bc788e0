//! Wiring of a fully equipped [`LlmClient`].
//!
//! Combines the in-memory response cache, SHA-256 cache keys, environment
//! credentials and the built-in OpenAI-compatible providers.

use std::sync::Arc;

use llmux_core::LlmClient;
use llmux_core::ports::cache::BoxCacheStore;
use llmux_types::config::ClientConfig;

use crate::cache::MemoryResponseCache;
use crate::crypto::Sha256ContentHasher;
use crate::llm::register_builtin_providers;
use crate::secret::EnvCredentialProvider;

/// A client plus a handle on its response cache, for stats and purging.
pub struct DefaultClient {
    pub client: LlmClient,
    pub cache: Arc<MemoryResponseCache>,
}

/// Build a client with every built-in provider registered.
pub fn build_default_client(config: ClientConfig) -> DefaultClient {
    let cache = Arc::new(MemoryResponseCache::from_config(&config.cache));
    let credentials = EnvCredentialProvider::from_config(&config);

    let client = LlmClient::builder()
        .cache(BoxCacheStore::from_arc(cache.clone()))
        .hasher(Sha256ContentHasher)
        .credentials(credentials)
        .config(config)
        .build();
    register_builtin_providers(client.registry());

    tracing::info!(
        providers = client.registry().provider_names().len(),
        "Built default LLM client"
    );
    DefaultClient { client, cache }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use llmux_core::llm::{BoxLlmProvider, ChunkStream, LlmProvider};
    use llmux_core::registry::ProviderRegistration;
    use llmux_types::error::LlmError;
    use llmux_types::llm::{
        ChatMessage, ChatRequest, ChatResponse, Choice, ModelInfo, ProviderFeature, StreamChunk,
    };

    #[derive(Clone, Default)]
    struct EchoProvider {
        calls: Arc<AtomicU32>,
    }

    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        fn supports(&self, _feature: ProviderFeature) -> bool {
            false
        }

        async fn chat(
            &self,
            request: &ChatRequest,
            _cancel: CancellationToken,
        ) -> Result<ChatResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(ChatResponse {
                id: "echo-1".to_string(),
                provider: "echo".to_string(),
                model: request.model.clone(),
                choices: vec![Choice {
                    index: 0,
                    message: ChatMessage::assistant(last),
                    finish_reason: None,
                }],
                usage: None,
                created_at: Utc::now(),
                latency_ms: None,
                cached: false,
            })
        }

        fn chat_stream(&self, _request: ChatRequest, _cancel: CancellationToken) -> ChunkStream {
            Box::pin(futures_util::stream::empty::<Result<StreamChunk, LlmError>>())
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn builtins_are_available() {
        let DefaultClient { client, .. } = build_default_client(ClientConfig::default());
        for name in ["openai", "groq", "mistral", "together", "ollama"] {
            assert!(client.registry().has_provider(name), "{name}");
        }
        assert!(!client.registry().unregister_provider("openai"));
    }

    #[tokio::test]
    async fn repeated_call_is_served_from_memory_cache() {
        let DefaultClient { client, cache } = build_default_client(ClientConfig::default());
        let echo = EchoProvider::default();
        let calls = echo.calls.clone();
        client.registry().register_provider(
            "echo",
            ProviderRegistration::new(move |_ctx| Ok(BoxLlmProvider::new(echo.clone()))),
        );

        let request = ChatRequest::new("echo", "m").with_message(ChatMessage::user("ping"));
        let first = client.chat(request.clone()).await.unwrap();
        let second = client.chat(request).await.unwrap();

        assert_eq!(first.text(), "ping");
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
    }
}
