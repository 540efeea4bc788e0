//! Provider registry with per-provider circuit breaking.
//!
//! Adapters are resolved by name through a registration table, built
//! lazily on first use and cached. Every provider call goes through
//! [`ProviderRegistry::execute_with_circuit_breaker`] (or its streaming
//! counterpart), which gates admission and feeds the health record.

pub mod breaker;
pub mod health;
pub mod latency;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use llmux_types::config::{BreakerConfig, ClientConfig, HealthWindowConfig, ProviderSettings};
use llmux_types::error::LlmError;
use llmux_types::event::ClientEvent;
use llmux_types::health::{ProviderHealthReport, WarmupResult};
use llmux_types::llm::ChatRequest;

use crate::event::EventBus;
use crate::llm::{BoxLlmProvider, ChunkStream};
use crate::ports::credential::{CredentialHandle, CredentialProviderDyn};

pub use breaker::{CircuitBreaker, CircuitState};
pub use health::{BreakerPermit, ProviderHealth};
pub use latency::LatencyWindow;

/// Everything an adapter receives at construction time.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub name: String,
    /// Registered defaults overlaid with user settings.
    pub settings: ProviderSettings,
    pub events: EventBus,
    pub credentials: CredentialHandle,
}

/// Builds an adapter from its context.
pub type ProviderConstructor =
    Arc<dyn Fn(ProviderContext) -> Result<BoxLlmProvider, LlmError> + Send + Sync>;

/// A provider packaged with its own defaults, registered as one unit.
pub trait ProviderPlugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn default_settings(&self) -> ProviderSettings {
        ProviderSettings::default()
    }

    fn create(&self, ctx: ProviderContext) -> Result<BoxLlmProvider, LlmError>;
}

/// One row of the registration table.
#[derive(Clone)]
pub struct ProviderRegistration {
    constructor: ProviderConstructor,
    defaults: ProviderSettings,
    builtin: bool,
}

impl ProviderRegistration {
    pub fn new<F>(constructor: F) -> Self
    where
        F: Fn(ProviderContext) -> Result<BoxLlmProvider, LlmError> + Send + Sync + 'static,
    {
        Self {
            constructor: Arc::new(constructor),
            defaults: ProviderSettings::default(),
            builtin: false,
        }
    }

    pub fn with_defaults(mut self, defaults: ProviderSettings) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> &ProviderSettings {
        &self.defaults
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin
    }
}

/// An admitted provider stream. The caller owns the permit and settles it
/// once the stream ends, errors or is abandoned.
pub struct BreakerStream {
    pub stream: ChunkStream,
    pub permit: BreakerPermit,
}

pub struct ProviderRegistry {
    registrations: DashMap<String, ProviderRegistration>,
    adapters: DashMap<String, Arc<BoxLlmProvider>>,
    health: DashMap<String, Arc<Mutex<ProviderHealth>>>,
    user_settings: HashMap<String, ProviderSettings>,
    breaker_config: BreakerConfig,
    window_config: HealthWindowConfig,
    credentials: Arc<dyn CredentialProviderDyn>,
    events: EventBus,
}

impl ProviderRegistry {
    pub fn new(
        config: &ClientConfig,
        credentials: Arc<dyn CredentialProviderDyn>,
        events: EventBus,
    ) -> Self {
        Self {
            registrations: DashMap::new(),
            adapters: DashMap::new(),
            health: DashMap::new(),
            user_settings: config.providers.clone(),
            breaker_config: config.breaker.clone(),
            window_config: config.health.clone(),
            credentials,
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register a built-in provider. Built-ins cannot be unregistered.
    pub fn register_builtin(&self, name: impl Into<String>, mut registration: ProviderRegistration) {
        registration.builtin = true;
        self.insert(name.into(), registration);
    }

    /// Add or override a provider constructor.
    ///
    /// Overriding a built-in keeps it built-in. The cached adapter, if any,
    /// is discarded so the next lookup uses the new constructor.
    pub fn register_provider(&self, name: impl Into<String>, registration: ProviderRegistration) {
        let name = name.into();
        let mut registration = registration;
        registration.builtin = self
            .registrations
            .get(&name)
            .is_some_and(|existing| existing.builtin);
        self.insert(name, registration);
    }

    /// Register a self-describing provider plugin.
    pub fn register_plugin<P: ProviderPlugin>(&self, plugin: P) {
        let name = plugin.name().to_string();
        let defaults = plugin.default_settings();
        let plugin = Arc::new(plugin);
        let registration =
            ProviderRegistration::new(move |ctx| plugin.create(ctx)).with_defaults(defaults);
        self.register_provider(name, registration);
    }

    fn insert(&self, name: String, registration: ProviderRegistration) {
        let builtin = registration.builtin;
        self.registrations.insert(name.clone(), registration);
        self.adapters.remove(&name);
        tracing::info!(provider = %name, builtin, "Provider registered");
        self.events
            .publish(ClientEvent::ProviderRegistered { name, builtin });
    }

    /// Remove a provider along with its cached adapter and health record.
    ///
    /// Returns false for built-ins and unknown names.
    pub fn unregister_provider(&self, name: &str) -> bool {
        let removed = self
            .registrations
            .remove_if(name, |_, registration| !registration.builtin)
            .is_some();
        if removed {
            self.adapters.remove(name);
            self.health.remove(name);
            tracing::info!(provider = %name, "Provider unregistered");
        }
        removed
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    /// Registered provider names, sorted.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registrations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Look up a provider adapter, constructing it on first use.
    ///
    /// Fails with `ProviderNotFound` for unknown names and with a retryable
    /// `ProviderUnavailable` while the provider's circuit is open. The
    /// check is read-only: it never moves the breaker.
    pub fn get_provider(&self, name: &str) -> Result<Arc<BoxLlmProvider>, LlmError> {
        if !self.has_provider(name) {
            return Err(LlmError::ProviderNotFound {
                name: name.to_string(),
            });
        }
        if let Some(record) = self.health.get(name) {
            let blocked = health::lock(record.value()).breaker().blocked_for(Instant::now());
            if let Some(retry_after_ms) = blocked {
                return Err(LlmError::ProviderUnavailable {
                    provider: name.to_string(),
                    retry_after_ms,
                });
            }
        }
        self.adapter(name)
    }

    /// Cached adapter lookup that ignores breaker state.
    fn adapter(&self, name: &str) -> Result<Arc<BoxLlmProvider>, LlmError> {
        if let Some(adapter) = self.adapters.get(name) {
            return Ok(adapter.value().clone());
        }

        let registration = self
            .registrations
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| LlmError::ProviderNotFound {
                name: name.to_string(),
            })?;

        let adapter = self
            .adapters
            .entry(name.to_string())
            .or_try_insert_with(|| {
                let settings = match self.user_settings.get(name) {
                    Some(user) => user.merged_over(&registration.defaults),
                    None => registration.defaults.clone(),
                };
                let ctx = ProviderContext {
                    name: name.to_string(),
                    settings,
                    events: self.events.clone(),
                    credentials: CredentialHandle::new(name, self.credentials.clone()),
                };
                tracing::debug!(provider = %name, "Constructing provider adapter");
                (registration.constructor)(ctx).map(Arc::new)
            })?
            .value()
            .clone();
        Ok(adapter)
    }

    fn health_record(&self, name: &str) -> Arc<Mutex<ProviderHealth>> {
        self.health
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ProviderHealth::new(
                    &self.breaker_config,
                    &self.window_config,
                )))
            })
            .value()
            .clone()
    }

    /// Admit one call to `name` through its circuit breaker.
    pub fn acquire(&self, name: &str) -> Result<BreakerPermit, LlmError> {
        BreakerPermit::acquire(name, self.health_record(name), self.events.clone())
    }

    /// Run `operation` against the named adapter under its circuit breaker.
    ///
    /// Admission is decided before the operation is invoked; the outcome
    /// and its latency are recorded once it settles. Returns the
    /// operation's result together with the measured latency.
    pub async fn execute_with_circuit_breaker<T, F, Fut>(
        &self,
        name: &str,
        operation: F,
    ) -> Result<(T, u64), LlmError>
    where
        F: FnOnce(Arc<BoxLlmProvider>) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let adapter = self.get_provider(name)?;
        let permit = self.acquire(name)?;
        let result = operation(adapter).await;
        let latency_ms = permit.settle(&result);
        result.map(|value| (value, latency_ms))
    }

    /// Open a provider stream under its circuit breaker.
    pub fn stream_with_circuit_breaker(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<BreakerStream, LlmError> {
        let adapter = self.get_provider(&request.provider)?;
        let permit = self.acquire(&request.provider)?;
        let stream = adapter.chat_stream(request, cancel);
        Ok(BreakerStream { stream, permit })
    }

    pub fn get_provider_health(&self, name: &str) -> Result<ProviderHealthReport, LlmError> {
        if !self.has_provider(name) {
            return Err(LlmError::ProviderNotFound {
                name: name.to_string(),
            });
        }
        let now = Instant::now();
        let report = match self.health.get(name) {
            Some(record) => health::lock(record.value()).report(name, now),
            None => ProviderHealth::new(&self.breaker_config, &self.window_config).report(name, now),
        };
        Ok(report)
    }

    /// Health of every registered provider, sorted by name.
    pub fn get_all_provider_health(&self) -> Vec<ProviderHealthReport> {
        self.provider_names()
            .iter()
            .filter_map(|name| self.get_provider_health(name).ok())
            .collect()
    }

    /// Probe providers in parallel with a cheap `list_models` call.
    ///
    /// Best effort: each probe has its own timeout, failures are reported
    /// per provider, and probes bypass the circuit breaker entirely.
    /// `names = None` probes every registered provider.
    pub async fn warmup(&self, names: Option<&[String]>, timeout: Duration) -> Vec<WarmupResult> {
        let names: Vec<String> = match names {
            Some(names) => names.to_vec(),
            None => self.provider_names(),
        };

        let probes = names.into_iter().map(|name| async move {
            let started = Instant::now();
            let outcome = match self.adapter(&name) {
                Ok(adapter) => match tokio::time::timeout(timeout, adapter.list_models()).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
                },
                Err(e) => Err(e.to_string()),
            };
            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            if let Err(error) = &outcome {
                tracing::debug!(provider = %name, %error, "Warmup probe failed");
            }
            WarmupResult {
                provider: name,
                ok: outcome.is_ok(),
                latency_ms,
                error: outcome.err(),
            }
        });

        futures_util::future::join_all(probes).await
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.provider_names())
            .field("cached_adapters", &self.adapters.len())
            .finish()
    }
}
