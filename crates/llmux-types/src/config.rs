//! Client configuration types for llmux.
//!
//! `ClientConfig` is the top-level configuration, usually loaded from a
//! TOML file. Every field has a sensible default so a partial file (or no
//! file at all) produces a working client.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration for an llmux client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub health: HealthWindowConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Collapse concurrent identical calls into one provider call.
    #[serde(default = "default_true")]
    pub dedup_enabled: bool,

    #[serde(default)]
    pub stream: StreamLimits,

    /// Hard ceiling on retry/fallback re-issues of a single logical call.
    #[serde(default = "default_max_reissues")]
    pub max_reissues: u32,

    /// Capacity of the broadcast channel backing the event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Per-provider user settings, keyed by provider name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

fn default_true() -> bool {
    true
}

fn default_max_reissues() -> u32 {
    10
}

fn default_event_capacity() -> usize {
    256
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            health: HealthWindowConfig::default(),
            cache: CacheConfig::default(),
            dedup_enabled: true,
            stream: StreamLimits::default(),
            max_reissues: default_max_reissues(),
            event_capacity: default_event_capacity(),
            providers: HashMap::new(),
        }
    }
}

/// Circuit breaker tuning, applied to every provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures (while closed) that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting trial calls.
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    /// Maximum concurrently admitted trial calls while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    /// Half-open successes required to close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    3
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_ms: default_open_duration_ms(),
            half_open_max_calls: default_half_open_max_calls(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Bounds for the rolling latency window kept per provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthWindowConfig {
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    #[serde(default = "default_sample_ttl_ms")]
    pub sample_ttl_ms: u64,
}

fn default_max_samples() -> usize {
    100
}

fn default_sample_ttl_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for HealthWindowConfig {
    fn default() -> Self {
        Self {
            max_samples: default_max_samples(),
            sample_ttl_ms: default_sample_ttl_ms(),
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_max_entries() -> usize {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

/// Limits enforced by the stream accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLimits {
    /// Abort the stream if it has not finished after this long.
    #[serde(default = "default_stream_timeout_ms")]
    pub timeout_ms: Option<u64>,
    /// Abort once more than this many fragments would be accepted.
    #[serde(default)]
    pub max_chunks: Option<u32>,
    /// Abort once the cumulative completion token count would exceed this.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_stream_timeout_ms() -> Option<u64> {
    Some(120_000)
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            timeout_ms: default_stream_timeout_ms(),
            max_chunks: None,
            max_tokens: None,
        }
    }
}

/// Settings for a single provider adapter.
///
/// Registered defaults are overlaid by user settings field-by-field
/// (see [`ProviderSettings::merged_over`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Per-call network timeout owned by the adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Environment variable holding the API key (overrides the `{NAME}_API_KEY` convention).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl ProviderSettings {
    /// Overlay `self` (user settings) on top of `defaults`.
    ///
    /// Scalar fields set by the user win; header maps are merged with user
    /// keys overriding default keys.
    pub fn merged_over(&self, defaults: &ProviderSettings) -> ProviderSettings {
        let mut headers = defaults.headers.clone();
        headers.extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        ProviderSettings {
            base_url: self.base_url.clone().or_else(|| defaults.base_url.clone()),
            default_model: self
                .default_model
                .clone()
                .or_else(|| defaults.default_model.clone()),
            timeout_ms: self.timeout_ms.or(defaults.timeout_ms),
            api_key_env: self
                .api_key_env
                .clone()
                .or_else(|| defaults.api_key_env.clone()),
            headers,
        }
    }
}
