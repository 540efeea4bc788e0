//! In-memory credential provider, for tests and for hosts that fetch keys
//! from their own secret store.

use dashmap::DashMap;
use secrecy::SecretString;

use llmux_core::ports::credential::CredentialProvider;
use llmux_types::error::LlmError;

#[derive(Debug, Default)]
pub struct StaticCredentialProvider {
    keys: DashMap<String, SecretString>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, provider: impl Into<String>, key: impl Into<String>) -> Self {
        self.set_key(provider, key);
        self
    }

    /// Add or replace the key for `provider`. Adapters pick it up on their
    /// next call.
    pub fn set_key(&self, provider: impl Into<String>, key: impl Into<String>) {
        self.keys
            .insert(provider.into(), SecretString::from(key.into()));
    }

    pub fn remove_key(&self, provider: &str) -> bool {
        self.keys.remove(provider).is_some()
    }
}

impl CredentialProvider for StaticCredentialProvider {
    async fn get_credential(&self, provider: &str) -> Result<SecretString, LlmError> {
        self.keys
            .get(provider)
            .map(|key| key.value().clone())
            .ok_or_else(|| LlmError::CredentialNotSet {
                provider: provider.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn returns_stored_key() {
        let provider = StaticCredentialProvider::new().with_key("groq", "gsk-123");
        let key = provider.get_credential("groq").await.unwrap();
        assert_eq!(key.expose_secret(), "gsk-123");
    }

    #[tokio::test]
    async fn keys_can_be_replaced_and_removed() {
        let provider = StaticCredentialProvider::new().with_key("openai", "old");
        provider.set_key("openai", "new");
        assert_eq!(
            provider.get_credential("openai").await.unwrap().expose_secret(),
            "new"
        );

        assert!(provider.remove_key("openai"));
        assert!(provider.get_credential("openai").await.is_err());
    }
}
