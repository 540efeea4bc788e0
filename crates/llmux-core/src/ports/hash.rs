//! ContentHasher trait for deriving cache keys.
//!
//! Defined in llmux-core so the executor can address cached responses
//! without coupling to a specific hashing algorithm. The SHA-256 adapter
//! lives in llmux-infra and is preferred; [`DefaultContentHasher`] is the
//! fast non-cryptographic fallback used when no hasher is configured.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Abstraction over content hashing.
pub trait ContentHasher: Send + Sync {
    /// Compute a hex-encoded hash of the given content.
    fn compute_hash(&self, content: &str) -> String;
}

/// SipHash-based hasher from the standard library.
///
/// `DefaultHasher::new()` uses fixed keys, so output is stable for a given
/// build. Keys are not meant to be shared across processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultContentHasher;

impl ContentHasher for DefaultContentHasher {
    fn compute_hash(&self, content: &str) -> String {
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}
