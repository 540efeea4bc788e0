//! Credential backends for provider adapters.

pub mod chain;
pub mod env;
pub mod memory;

pub use chain::{ChainedCredentialProvider, build_credential_chain};
pub use env::EnvCredentialProvider;
pub use memory::StaticCredentialProvider;
