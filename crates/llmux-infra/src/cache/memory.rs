//! In-memory response cache with per-entry TTL.
//!
//! Entries live in a [`DashMap`] keyed by cache key. Expired entries are
//! dropped lazily on read and eagerly by [`MemoryResponseCache::purge_expired`].
//! When the table is full, inserting a new key evicts the oldest entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use llmux_core::ports::cache::CacheStore;
use llmux_types::config::CacheConfig;
use llmux_types::error::CacheError;
use llmux_types::llm::ChatResponse;

#[derive(Debug, Clone)]
struct CacheEntry {
    response: ChatResponse,
    inserted_at: Instant,
    expires_at: Instant,
    hits: u64,
    size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Point-in-time counters for a [`MemoryResponseCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Sum of the serialised sizes of live entries.
    pub size_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

pub struct MemoryResponseCache {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryResponseCache {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.max_entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of times the entry under `key` has been served.
    pub fn hits_for(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.hits)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "Purged expired cache entries");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let size_bytes = self.entries.iter().map(|entry| entry.size_bytes).sum();
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size_bytes,
        }
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.inserted_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Evicted oldest cache entry");
            }
        }
    }
}

impl CacheStore for MemoryResponseCache {
    async fn get(&self, key: &str) -> Result<Option<ChatResponse>, CacheError> {
        let now = Instant::now();
        let found = self.entries.get_mut(key).and_then(|mut entry| {
            if entry.is_expired(now) {
                None
            } else {
                entry.hits += 1;
                Some(entry.response.clone())
            }
        });
        if found.is_none() {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }

        match found {
            Some(response) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(response))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: ChatResponse,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let size_bytes = serde_json::to_vec(&value)
            .map_err(|e| CacheError::Serialization(e.to_string()))?
            .len();

        if !self.entries.contains_key(key) {
            self.purge_expired();
            while self.entries.len() >= self.max_entries {
                self.evict_oldest();
            }
        }

        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                response: value,
                inserted_at: now,
                expires_at: now + ttl.unwrap_or(self.default_ttl),
                hits: 0,
                size_bytes,
            },
        );
        Ok(())
    }
}
