//! Client configuration loader.
//!
//! Reads a TOML file into [`ClientConfig`]. [`load_client_config`] never
//! fails: a missing or malformed file yields the defaults.
//! [`parse_client_config`] is the strict variant for callers that want to
//! surface mistakes.

use std::path::Path;

use anyhow::Context;

use llmux_types::config::ClientConfig;

/// Load configuration from `path`.
///
/// - Missing file: returns [`ClientConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_client_config(path: &Path) -> ClientConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return ClientConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return ClientConfig::default();
        }
    };

    match parse_client_config(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err:#}, using defaults", path.display());
            ClientConfig::default()
        }
    }
}

/// Parse and validate a TOML configuration string.
pub fn parse_client_config(content: &str) -> anyhow::Result<ClientConfig> {
    let config: ClientConfig =
        toml::from_str(content).context("invalid llmux configuration")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ClientConfig) -> anyhow::Result<()> {
    anyhow::ensure!(
        config.breaker.failure_threshold > 0,
        "breaker.failure_threshold must be at least 1"
    );
    anyhow::ensure!(
        config.breaker.half_open_max_calls > 0,
        "breaker.half_open_max_calls must be at least 1"
    );
    anyhow::ensure!(
        config.health.max_samples > 0,
        "health.max_samples must be at least 1"
    );
    anyhow::ensure!(
        config.event_capacity > 0,
        "event_capacity must be at least 1"
    );
    for (name, settings) in &config.providers {
        if let Some(url) = &settings.base_url {
            anyhow::ensure!(
                url.starts_with("http://") || url.starts_with("https://"),
                "providers.{name}.base_url must be an http(s) URL, got '{url}'"
            );
        }
    }
    Ok(())
}
