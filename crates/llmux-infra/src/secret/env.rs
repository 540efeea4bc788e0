//! Environment variable credential provider.
//!
//! Key resolution for provider `name`:
//! - an explicitly configured variable (`api_key_env` in provider settings)
//! - otherwise `{NAME}_API_KEY`, uppercased with `-` mapped to `_`
//!   (e.g. "openai" -> `OPENAI_API_KEY`, "my-proxy" -> `MY_PROXY_API_KEY`)

use std::collections::HashMap;

use secrecy::SecretString;

use llmux_core::ports::credential::CredentialProvider;
use llmux_types::config::ClientConfig;
use llmux_types::error::LlmError;

/// Read-only credential provider backed by the process environment.
///
/// Variables are read on every call, so keys exported after the client was
/// built are picked up.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialProvider {
    overrides: HashMap<String, String>,
}

impl EnvCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Honour every `api_key_env` set in the client's provider settings.
    pub fn from_config(config: &ClientConfig) -> Self {
        let overrides = config
            .providers
            .iter()
            .filter_map(|(name, settings)| {
                settings
                    .api_key_env
                    .as_ref()
                    .map(|var| (name.clone(), var.clone()))
            })
            .collect();
        Self { overrides }
    }

    /// Read `provider`'s key from `var` instead of the naming convention.
    pub fn with_env_var(mut self, provider: impl Into<String>, var: impl Into<String>) -> Self {
        self.overrides.insert(provider.into(), var.into());
        self
    }

    /// Name of the variable consulted for `provider`.
    pub fn env_var_for(&self, provider: &str) -> String {
        match self.overrides.get(provider) {
            Some(var) => var.clone(),
            None => default_env_var(provider),
        }
    }
}

/// `{PROVIDER}_API_KEY` for a registry name.
pub fn default_env_var(provider: &str) -> String {
    format!("{}_API_KEY", provider.replace('-', "_").to_uppercase())
}

impl CredentialProvider for EnvCredentialProvider {
    async fn get_credential(&self, provider: &str) -> Result<SecretString, LlmError> {
        let var = self.env_var_for(provider);
        match std::env::var(&var) {
            Ok(value) if !value.trim().is_empty() => Ok(SecretString::from(value)),
            // Unset, empty and non-unicode values all mean "no key".
            _ => {
                tracing::debug!(provider, env_var = %var, "No API key in environment");
                Err(LlmError::CredentialNotSet {
                    provider: provider.to_string(),
                })
            }
        }
    }
}
