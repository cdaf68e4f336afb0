//! Response cache over the storage layer.
//!
//! Maps `(prompt, model)` to a previously computed generation so identical
//! requests within a workspace never pay for a second backend call. The
//! cache key is a pure function of the normalized prompt text and the model
//! identifier, so identical requests always collide to the same entry.
//! Entries live in the workspace's `cache` table; no cross-workspace
//! lookups are possible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::backend::TokenCounts;
use crate::storage::{StorageError, StorageManager};

const TABLE: &str = "cache";

/// One cached generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub prompt: String,
    pub model_name: String,
    pub response: String,
    pub token_counts: TokenCounts,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,

    /// The creating `put` counts as access 1; every hit increments.
    pub access_count: u64,
}

/// Hit/miss counters for one cache handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub workspace: String,
}

/// Workspace-scoped response cache.
pub struct ResponseCache {
    storage: Arc<StorageManager>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Derive the cache key for a `(prompt, model)` pair.
///
/// SHA-256 over the normalized prompt, a NUL separator, and the model
/// identifier. Deterministic by construction: `key(p, m) == key(p, m)`.
pub fn cache_key(prompt: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_prompt(prompt).as_bytes());
    hasher.update([0u8]);
    hasher.update(model.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalize prompt text: trim and collapse interior whitespace runs, so
/// incidental formatting differences do not defeat deduplication.
fn normalize_prompt(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl ResponseCache {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self {
            storage,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a cached response.
    ///
    /// A hit increments the entry's `access_count` and refreshes
    /// `accessed_at` before the entry is returned; both are persisted. An
    /// undecodable entry is logged by the storage layer and treated as a
    /// miss.
    pub fn get(&self, prompt: &str, model: &str) -> Result<Option<CacheEntry>, StorageError> {
        let k = cache_key(prompt, model);

        let entry: Option<CacheEntry> = self.storage.get_json_lossy(TABLE, &k)?;
        match entry {
            Some(mut entry) => {
                entry.access_count += 1;
                entry.accessed_at = Utc::now();
                self.storage.put_json(TABLE, &k, &entry)?;

                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(cache_key = %k, model, access_count = entry.access_count, "cache hit");
                Ok(Some(entry))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store a generation, returning its cache key.
    ///
    /// Concurrent identical requests may both compute and both store; the
    /// stored state converges to one entry (last write wins).
    pub fn put(
        &self,
        prompt: &str,
        model: &str,
        response: &str,
        token_counts: TokenCounts,
    ) -> Result<String, StorageError> {
        let k = cache_key(prompt, model);
        let now = Utc::now();

        let entry = CacheEntry {
            cache_key: k.clone(),
            prompt: prompt.to_string(),
            model_name: model.to_string(),
            response: response.to_string(),
            token_counts,
            created_at: now,
            accessed_at: now,
            access_count: 1,
        };

        self.storage.put_json(TABLE, &k, &entry)?;
        Ok(k)
    }

    /// Hit/miss counters for this handle.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            workspace: self.storage.workspace().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_cache(dir: &TempDir) -> ResponseCache {
        let storage = Arc::new(StorageManager::open_at(&dir.path().join("ws"), "ws").unwrap());
        ResponseCache::new(storage)
    }

    #[test]
    fn test_key_is_pure_and_discriminating() {
        assert_eq!(cache_key("hello", "m1"), cache_key("hello", "m1"));
        assert_ne!(cache_key("hello", "m1"), cache_key("goodbye", "m1"));
        assert_ne!(cache_key("hello", "m1"), cache_key("hello", "m2"));
    }

    #[test]
    fn test_key_normalizes_whitespace() {
        assert_eq!(cache_key("  hello   world \n", "m"), cache_key("hello world", "m"));
    }

    #[test]
    fn test_round_trip_access_count() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);

        cache
            .put("prompt", "model-a", "response", TokenCounts::new(3, 7))
            .unwrap();

        let entry = cache.get("prompt", "model-a").unwrap().unwrap();
        assert_eq!(entry.response, "response");
        assert_eq!(entry.token_counts, TokenCounts::new(3, 7));
        // put counts as access 1, the first hit as 2.
        assert_eq!(entry.access_count, 2);

        let entry = cache.get("prompt", "model-a").unwrap().unwrap();
        assert_eq!(entry.access_count, 3);
    }

    #[test]
    fn test_miss_and_stats() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);

        assert!(cache.get("unseen", "m").unwrap().is_none());
        cache.put("p", "m", "r", TokenCounts::default()).unwrap();
        cache.get("p", "m").unwrap();

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.workspace, "ws");
    }

    #[test]
    fn test_same_pair_converges_to_one_entry() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);

        let k1 = cache.put("p", "m", "first", TokenCounts::default()).unwrap();
        let k2 = cache.put("p", "m", "second", TokenCounts::default()).unwrap();
        assert_eq!(k1, k2);

        let entry = cache.get("p", "m").unwrap().unwrap();
        assert_eq!(entry.response, "second");
    }
}
