//! Credential chain: the first backend that has a key wins.

use std::sync::Arc;

use secrecy::SecretString;

use llmux_core::ports::credential::{CredentialProvider, CredentialProviderDyn};
use llmux_types::error::LlmError;

use super::{EnvCredentialProvider, StaticCredentialProvider};

/// Backends consulted in order.
///
/// `CredentialNotSet` moves on to the next backend; any other error stops
/// the lookup and is returned as is.
#[derive(Clone, Default)]
pub struct ChainedCredentialProvider {
    backends: Vec<Arc<dyn CredentialProviderDyn>>,
}

impl ChainedCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<C: CredentialProvider + 'static>(mut self, backend: C) -> Self {
        self.backends.push(Arc::new(backend));
        self
    }

    pub fn with_shared(mut self, backend: Arc<dyn CredentialProviderDyn>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Default lookup order: environment first, then explicitly supplied keys.
pub fn build_credential_chain(
    env: EnvCredentialProvider,
    fallback: Option<StaticCredentialProvider>,
) -> ChainedCredentialProvider {
    let chain = ChainedCredentialProvider::new().with(env);
    match fallback {
        Some(keys) => chain.with(keys),
        None => chain,
    }
}

impl CredentialProvider for ChainedCredentialProvider {
    async fn get_credential(&self, provider: &str) -> Result<SecretString, LlmError> {
        for backend in &self.backends {
            match backend.get_credential_boxed(provider).await {
                Ok(key) => return Ok(key),
                Err(LlmError::CredentialNotSet { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(LlmError::CredentialNotSet {
            provider: provider.to_string(),
        })
    }
}

impl std::fmt::Debug for ChainedCredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedCredentialProvider")
            .field("backends", &self.backends.len())
            .finish()
    }
}
