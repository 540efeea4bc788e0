//! Request executor.
//!
//! [`LlmClient`] serves one logical call end to end: request phase, cache
//! lookup, deduplication, the breaker-gated provider call, response phase,
//! cache store. Failures go through the error phase, whose scratchpad
//! signals drive retries and fallbacks; the executor owns the waiting and
//! the re-issue loop.

mod batch;
mod builder;
pub mod cache_key;
mod dedup;
mod options;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::FutureExt;
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use llmux_types::config::ClientConfig;
use llmux_types::error::LlmError;
use llmux_types::event::ClientEvent;
use llmux_types::health::{ProviderHealthReport, WarmupResult};
use llmux_types::llm::{ChatRequest, ChatResponse, StreamEvent};

use crate::event::EventBus;
use crate::pipeline::{Middleware, Pipeline, PipelineContext, PipelineRun, keys};
use crate::ports::cache::BoxCacheStore;
use crate::ports::hash::ContentHasher;
use crate::registry::ProviderRegistry;
use crate::stream::{StreamAccumulator, StreamDriver};

pub use batch::{BatchOptions, BatchResult, BatchSummary};
pub use builder::LlmClientBuilder;
pub use cache_key::derive_cache_key;
pub use options::{ChatOptions, RetryBudget};

use dedup::InFlightCalls;

/// Events yielded by [`LlmClient::chat_stream`].
pub type ChatStream = BoxStream<'static, Result<StreamEvent, LlmError>>;

struct ClientInner {
    config: ClientConfig,
    registry: ProviderRegistry,
    pipeline: Pipeline,
    cache: Option<BoxCacheStore>,
    hasher: Arc<dyn ContentHasher>,
    inflight: InFlightCalls,
    events: EventBus,
}

/// What the error phase asked the executor to do next.
enum NextStep {
    Retry { delay_ms: u64 },
    Fallback { provider: String, model: String },
    Surface,
}

/// Multi-provider chat client. Cheap to clone.
#[derive(Clone)]
pub struct LlmClient {
    inner: Arc<ClientInner>,
}

impl LlmClient {
    pub fn builder() -> LlmClientBuilder {
        LlmClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Add a middleware to the pipeline.
    pub fn use_middleware<M: Middleware>(&self, middleware: M) {
        self.inner.pipeline.add(middleware);
    }

    pub fn get_provider_health(&self, name: &str) -> Result<ProviderHealthReport, LlmError> {
        self.inner.registry.get_provider_health(name)
    }

    pub fn get_all_provider_health(&self) -> Vec<ProviderHealthReport> {
        self.inner.registry.get_all_provider_health()
    }

    pub async fn warmup(&self, names: Option<&[String]>, timeout: Duration) -> Vec<WarmupResult> {
        self.inner.registry.warmup(names, timeout).await
    }

    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        self.chat_with(request, ChatOptions::default()).await
    }

    /// Serve one logical call, re-issuing it as the error phase directs.
    pub async fn chat_with(
        &self,
        request: ChatRequest,
        options: ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let parent = options.cancellation.clone().unwrap_or_default();
        let mut ctx = PipelineContext::with_cancellation(&parent);
        let mut request = request;
        let mut reissues = 0u32;
        self.announce_start(&ctx, &request);

        loop {
            self.prepare_attempt(&ctx, &request, &options);
            let run = self.inner.pipeline.snapshot();

            let error = match self.attempt(&run, request.clone(), &ctx, &options).await {
                Ok(response) => return Ok(self.finish(&ctx, response)),
                Err(error) => error,
            };
            self.announce_error(&ctx, &request, &error);

            let error = match run.run_error_phase(error, &ctx).await {
                Ok(recovered) => return Ok(self.finish(&ctx, recovered)),
                Err(error) => error,
            };

            let step = self.next_step(&ctx, &error, &options);
            if ctx.is_call_cancelled() {
                return Err(self.fail(&ctx, error));
            }
            if !matches!(step, NextStep::Surface) && reissues >= self.inner.config.max_reissues {
                tracing::warn!(
                    request_id = %ctx.request_id(),
                    reissues,
                    "Re-issue limit reached, surfacing error"
                );
                return Err(self.fail(&ctx, error));
            }

            match step {
                NextStep::Retry { delay_ms } => {
                    reissues += 1;
                    tracing::warn!(
                        request_id = %ctx.request_id(),
                        provider = %request.provider,
                        attempt = reissues,
                        delay_ms,
                        error = %error,
                        "Retrying LLM call"
                    );
                    self.inner.events.publish(ClientEvent::RetryAttempt {
                        request_id: ctx.request_id(),
                        attempt: reissues,
                        delay_ms,
                    });
                    tokio::select! {
                        _ = ctx.call_cancellation().cancelled() => {
                            return Err(self.fail(&ctx, LlmError::Cancelled));
                        }
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    }
                }
                NextStep::Fallback { provider, model } => {
                    reissues += 1;
                    tracing::warn!(
                        request_id = %ctx.request_id(),
                        from = %request.provider,
                        to = %provider,
                        model = %model,
                        "Falling back to another provider"
                    );
                    self.inner.events.publish(ClientEvent::FallbackAttempt {
                        request_id: ctx.request_id(),
                        provider: provider.clone(),
                        model: model.clone(),
                    });
                    request.provider = provider;
                    request.model = model;
                }
                NextStep::Surface => return Err(self.fail(&ctx, error)),
            }
            ctx = ctx.next_attempt();
        }
    }

    /// One pass through the pipeline and the provider.
    async fn attempt(
        &self,
        run: &PipelineRun,
        request: ChatRequest,
        ctx: &PipelineContext,
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let inner = &self.inner;
        let request = run.run_request_phase(request, ctx).await?;

        let cache = inner
            .cache
            .as_ref()
            .filter(|_| inner.config.cache.enabled && !options.no_cache);
        let dedup = inner.config.dedup_enabled && !options.no_dedup;
        let key = if cache.is_some() || dedup {
            match derive_cache_key(&request, inner.hasher.as_ref()) {
                Ok(key) => Some(key),
                Err(error) => {
                    tracing::warn!(
                        request_id = %ctx.request_id(),
                        %error,
                        "Skipping cache and deduplication"
                    );
                    None
                }
            }
        } else {
            None
        };

        if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
            match cache.get(key).await {
                Ok(Some(mut hit)) => {
                    tracing::debug!(request_id = %ctx.request_id(), key, "Cache hit");
                    inner.events.publish(ClientEvent::CacheHit {
                        key: key.to_string(),
                    });
                    hit.cached = true;
                    return run.run_response_phase(hit, ctx).await;
                }
                Ok(None) => {
                    tracing::debug!(request_id = %ctx.request_id(), key, "Cache miss");
                    inner.events.publish(ClientEvent::CacheMiss {
                        key: key.to_string(),
                    });
                }
                Err(error) => {
                    tracing::warn!(request_id = %ctx.request_id(), %error, "Cache read failed");
                }
            }
        }

        let response = match key.as_deref().filter(|_| dedup) {
            Some(key) => self.deduplicated_call(key, request, ctx).await?,
            None => provider_call(inner.clone(), request, ctx.cancellation().clone()).await?,
        };
        let response = run.run_response_phase(response, ctx).await?;

        if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
            let ttl = Duration::from_secs(inner.config.cache.ttl_secs);
            if let Err(error) = cache.set(key, response.clone(), Some(ttl)).await {
                tracing::warn!(request_id = %ctx.request_id(), %error, "Cache write failed");
            }
        }
        Ok(response)
    }

    async fn deduplicated_call(
        &self,
        key: &str,
        request: ChatRequest,
        ctx: &PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        let inner = self.inner.clone();
        let joined = self
            .inner
            .inflight
            .join_or_start(key, move |shared| provider_call(inner, request, shared).boxed());
        if !joined.leader {
            tracing::debug!(request_id = %ctx.request_id(), key, "Joined identical in-flight call");
        }

        let call = joined.call.clone();
        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(LlmError::Cancelled),
            result = call => result,
        }
    }

    /// Send a streaming request.
    ///
    /// Yields every accepted fragment, then one `Finished` event carrying
    /// the accumulated response after the response phase. An abort or a
    /// provider failure goes through the error phase and ends the stream
    /// with either a recovered `Finished` event or the error. Streams are
    /// never re-issued and never cached.
    pub fn chat_stream(&self, request: ChatRequest) -> ChatStream {
        self.chat_stream_with(request, ChatOptions::default())
    }

    pub fn chat_stream_with(&self, request: ChatRequest, options: ChatOptions) -> ChatStream {
        let client = self.clone();
        Box::pin(async_stream::stream! {
            let parent = options.cancellation.clone().unwrap_or_default();
            let ctx = PipelineContext::with_cancellation(&parent);
            let limits = options
                .stream_limits
                .clone()
                .unwrap_or_else(|| client.inner.config.stream.clone());
            client.announce_start(&ctx, &request);
            client.prepare_attempt(&ctx, &request, &options);
            let run = client.inner.pipeline.snapshot();

            let opened = match run.run_request_phase(request, &ctx).await {
                Ok(mut request) => {
                    request.stream = true;
                    client
                        .inner
                        .registry
                        .stream_with_circuit_breaker(request.clone(), ctx.cancellation().clone())
                        .map(|opened| (request, opened))
                }
                Err(error) => Err(error),
            };
            let (request, opened) = match opened {
                Ok(opened) => opened,
                Err(error) => {
                    yield client.recover_stream(&run, &ctx, &options, error).await;
                    return;
                }
            };

            let mut driver = StreamDriver::new(
                ctx.request_id(),
                opened,
                StreamAccumulator::new(&request.provider, &request.model, limits.clone()),
                ctx.cancellation().clone(),
                limits.timeout_ms.map(Duration::from_millis),
                client.inner.events.clone(),
            );
            let mut failure = None;
            while let Some(item) = driver.next_chunk().await {
                match item {
                    Ok(chunk) => yield Ok(StreamEvent::Chunk(chunk)),
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }

            let outcome = match failure {
                None => {
                    let response = driver.response();
                    drop(driver);
                    run.run_response_phase(response, &ctx).await
                }
                Some(error) => {
                    drop(driver);
                    Err(error)
                }
            };
            match outcome {
                Ok(response) => yield Ok(StreamEvent::Finished(client.finish(&ctx, response))),
                Err(error) => yield client.recover_stream(&run, &ctx, &options, error).await,
            }
        })
    }

    /// Drain a stream and return its final response.
    pub async fn chat_stream_collect(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut stream = self.chat_stream(request);
        while let Some(event) = stream.next().await {
            if let StreamEvent::Finished(response) = event? {
                return Ok(response);
            }
        }
        Err(LlmError::Stream(
            "stream ended without a final response".to_string(),
        ))
    }

    async fn recover_stream(
        &self,
        run: &PipelineRun,
        ctx: &PipelineContext,
        options: &ChatOptions,
        error: LlmError,
    ) -> Result<StreamEvent, LlmError> {
        let provider = ctx.scratchpad().get_str(keys::PROVIDER).unwrap_or_default();
        self.announce_error_for(ctx, &provider, &error);
        match run.run_error_phase(error, ctx).await {
            Ok(recovered) => Ok(StreamEvent::Finished(self.finish(ctx, recovered))),
            Err(error) => {
                // Streams are not re-issued; drop any signals the handlers left.
                self.next_step(ctx, &error, options);
                Err(self.fail(ctx, error))
            }
        }
    }

    fn prepare_attempt(&self, ctx: &PipelineContext, request: &ChatRequest, options: &ChatOptions) {
        let pad = ctx.scratchpad();
        pad.set(keys::PROVIDER, request.provider.clone());
        pad.set(keys::MODEL, request.model.clone());
        if options.retries_disabled() {
            pad.set(keys::RETRY_DISABLED, true);
        }
    }

    /// Consume the error phase's signals.
    fn next_step(&self, ctx: &PipelineContext, error: &LlmError, options: &ChatOptions) -> NextStep {
        let pad = ctx.scratchpad();
        let retry_requested = pad
            .remove(keys::RETRY_REQUESTED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let delay_ms = pad
            .remove(keys::RETRY_DELAY_MS)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let fallback_provider = pad
            .remove(keys::FALLBACK_PROVIDER)
            .and_then(|v| v.as_str().map(str::to_string));
        let fallback_model = pad
            .remove(keys::FALLBACK_MODEL)
            .and_then(|v| v.as_str().map(str::to_string));

        let within_budget = match &options.retry_budget {
            Some(budget) if error.is_retryable() => budget.consume(),
            _ => true,
        };
        if !within_budget {
            tracing::warn!(request_id = %ctx.request_id(), "Retry budget exhausted");
            pad.set(keys::RETRY_DISABLED, true);
        }

        if retry_requested && within_budget && !options.skip_retries {
            return NextStep::Retry { delay_ms };
        }
        match fallback_provider {
            Some(provider) => NextStep::Fallback {
                model: fallback_model.unwrap_or_default(),
                provider,
            },
            None => NextStep::Surface,
        }
    }

    fn announce_start(&self, ctx: &PipelineContext, request: &ChatRequest) {
        tracing::debug!(
            request_id = %ctx.request_id(),
            provider = %request.provider,
            model = %request.model,
            "LLM call started"
        );
        self.inner.events.publish(ClientEvent::RequestStart {
            request_id: ctx.request_id(),
            provider: request.provider.clone(),
            model: request.model.clone(),
        });
    }

    fn announce_error(&self, ctx: &PipelineContext, request: &ChatRequest, error: &LlmError) {
        self.announce_error_for(ctx, &request.provider, error);
    }

    fn announce_error_for(&self, ctx: &PipelineContext, provider: &str, error: &LlmError) {
        self.inner.events.publish(ClientEvent::RequestError {
            request_id: ctx.request_id(),
            provider: provider.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn finish(&self, ctx: &PipelineContext, response: ChatResponse) -> ChatResponse {
        let latency_ms = ctx.elapsed_ms();
        tracing::debug!(
            request_id = %ctx.request_id(),
            provider = %response.provider,
            latency_ms,
            cached = response.cached,
            "LLM call finished"
        );
        self.inner.events.publish(ClientEvent::RequestEnd {
            request_id: ctx.request_id(),
            provider: response.provider.clone(),
            latency_ms,
            cached: response.cached,
        });
        response
    }

    fn fail(&self, ctx: &PipelineContext, error: LlmError) -> LlmError {
        tracing::error!(
            request_id = %ctx.request_id(),
            kind = %error.kind(),
            retryable = error.is_retryable(),
            error = %error,
            "LLM call failed"
        );
        error
    }
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("registry", &self.inner.registry)
            .field("pipeline", &self.inner.pipeline)
            .field("cache", &self.inner.cache.is_some())
            .field("in_flight", &self.inner.inflight.len())
            .finish()
    }
}

/// The breaker-gated provider call shared by deduplicated callers.
async fn provider_call(
    inner: Arc<ClientInner>,
    request: ChatRequest,
    cancel: CancellationToken,
) -> Result<ChatResponse, LlmError> {
    let name = request.provider.clone();
    let (mut response, latency_ms) = inner
        .registry
        .execute_with_circuit_breaker(&name, |adapter| async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LlmError::Cancelled),
                result = adapter.chat(&request, cancel.clone()) => result,
            }
        })
        .await?;
    response.provider = name;
    response.latency_ms = Some(latency_ms);
    response.cached = false;
    Ok(response)
}
