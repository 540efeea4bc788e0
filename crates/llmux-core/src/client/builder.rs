use std::sync::Arc;

use llmux_types::config::ClientConfig;

use super::LlmClient;
use super::ClientInner;
use super::dedup::InFlightCalls;
use crate::event::EventBus;
use crate::pipeline::Pipeline;
use crate::ports::cache::BoxCacheStore;
use crate::ports::credential::{CredentialProvider, CredentialProviderDyn, NoCredentials};
use crate::ports::hash::{ContentHasher, DefaultContentHasher};
use crate::registry::ProviderRegistry;

/// Assembles an [`LlmClient`] from its collaborators.
///
/// Every collaborator is optional: without a cache store responses are not
/// cached, without a credential provider adapters that need a key fail
/// with `CredentialNotSet`, and keys are hashed with the std hasher.
#[derive(Default)]
pub struct LlmClientBuilder {
    config: ClientConfig,
    cache: Option<BoxCacheStore>,
    hasher: Option<Arc<dyn ContentHasher>>,
    credentials: Option<Arc<dyn CredentialProviderDyn>>,
    events: Option<EventBus>,
}

impl LlmClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: BoxCacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn hasher<H: ContentHasher + 'static>(mut self, hasher: H) -> Self {
        self.hasher = Some(Arc::new(hasher));
        self
    }

    pub fn credentials<C: CredentialProvider + 'static>(mut self, credentials: C) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    /// Publish into an existing bus instead of creating one.
    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> LlmClient {
        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(self.config.event_capacity));
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(NoCredentials));
        let registry = ProviderRegistry::new(&self.config, credentials, events.clone());

        tracing::debug!(
            cache = self.cache.is_some() && self.config.cache.enabled,
            dedup = self.config.dedup_enabled,
            "Building LLM client"
        );

        LlmClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                registry,
                pipeline: Pipeline::new(),
                cache: self.cache,
                hasher: self
                    .hasher
                    .unwrap_or_else(|| Arc::new(DefaultContentHasher)),
                inflight: InFlightCalls::default(),
                events,
            }),
        }
    }
}
