//! SHA-256 cache-key hashing.
//!
//! Implements the `ContentHasher` port from `llmux-core` with the `sha2`
//! crate (RustCrypto ecosystem).

use sha2::{Digest, Sha256};

use llmux_core::ports::hash::ContentHasher;

/// Lowercase hex SHA-256 digests of canonical request JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256ContentHasher;

impl Sha256ContentHasher {
    pub fn new() -> Self {
        Self
    }
}

impl ContentHasher for Sha256ContentHasher {
    fn compute_hash(&self, content: &str) -> String {
        format!("{:x}", Sha256::digest(content.as_bytes()))
    }
}
