//! Credential accessor port.
//!
//! Adapters never see the key store. They receive a [`CredentialHandle`]
//! bound to their provider name and resolve the secret lazily, on the
//! first call that needs it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use secrecy::SecretString;

use llmux_types::error::LlmError;

/// Trait for credential backends (environment, static map, keychain, ...).
pub trait CredentialProvider: Send + Sync {
    /// Resolve the API key for `provider`.
    ///
    /// Fails with [`LlmError::CredentialNotSet`] when no key is available.
    fn get_credential(
        &self,
        provider: &str,
    ) -> impl Future<Output = Result<SecretString, LlmError>> + Send;
}

/// Object-safe version of [`CredentialProvider`].
pub trait CredentialProviderDyn: Send + Sync {
    fn get_credential_boxed<'a>(
        &'a self,
        provider: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SecretString, LlmError>> + Send + 'a>>;
}

impl<T: CredentialProvider> CredentialProviderDyn for T {
    fn get_credential_boxed<'a>(
        &'a self,
        provider: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SecretString, LlmError>> + Send + 'a>> {
        Box::pin(self.get_credential(provider))
    }
}

/// Credential backend that never has a key. Used when the client is built
/// without one, so keyless providers (local servers) still work.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    async fn get_credential(&self, provider: &str) -> Result<SecretString, LlmError> {
        Err(LlmError::CredentialNotSet {
            provider: provider.to_string(),
        })
    }
}

/// Lazy credential accessor handed to one provider adapter.
#[derive(Clone)]
pub struct CredentialHandle {
    provider: String,
    backend: Arc<dyn CredentialProviderDyn>,
}

impl CredentialHandle {
    pub fn new(provider: impl Into<String>, backend: Arc<dyn CredentialProviderDyn>) -> Self {
        Self {
            provider: provider.into(),
            backend,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Resolve the secret now.
    pub async fn get(&self) -> Result<SecretString, LlmError> {
        self.backend.get_credential_boxed(&self.provider).await
    }
}

impl std::fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}
