//! Content-addressed memoization of agent outputs.
//!
//! Cache keys are derived by the Orchestrator, never the Agent, so the
//! context fingerprint that defines a cache key cannot accidentally
//! diverge from what the orchestrator actually fed the agent. The cache is
//! best-effort: a corrupted or unreadable persisted file is discarded
//! silently rather than surfaced as an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Configures result-cache behavior: whether it is consulted at all, its
/// entry-count bound, and an optional on-disk persistence location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicy {
    pub enabled: bool,
    pub max_cache_size: usize,
    pub cache_directory: Option<PathBuf>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self { enabled: true, max_cache_size: 1000, cache_directory: None }
    }
}

/// The inputs the Orchestrator hashes to derive a cache key: the agent
/// role, a canonicalized context fingerprint, and the capability invoked.
/// `context_fingerprint` is recursively key-sorted before hashing so cache
/// keys never depend on a `HashMap`'s iteration order.
#[derive(Debug, Clone, Serialize)]
pub struct CacheKeyInput {
    pub agent_role: String,
    pub context_fingerprint: serde_json::Value,
    pub capability_name: String,
}

/// Recursively sorts object keys so structurally-identical JSON always
/// serializes identically, independent of map insertion order.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            serde_json::json!(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// Derives the SHA-256 cache key for a `CacheKeyInput`, over its canonical
/// (key-sorted) JSON encoding.
pub fn compute_cache_key(input: &CacheKeyInput) -> String {
    let canonical = serde_json::json!({
        "agent_role": input.agent_role,
        "context_fingerprint": canonicalize(&input.context_fingerprint),
        "capability_name": input.capability_name,
    });
    // `canonical`'s own top-level keys are fixed and already alphabetically
    // sorted by construction above.
    let encoded = serde_json::to_vec(&canonical).expect("cache key input always serializes");
    let digest = Sha256::digest(&encoded);
    hex::encode(digest)
}

/// A memoized agent output plus accounting metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The agent's output, exactly as it would be written into
    /// `ProjectState` on a fresh invocation.
    pub output: serde_json::Value,
    /// Tokens the original (non-cached) invocation consumed.
    pub total_tokens: u32,
    /// When this entry was inserted.
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    key: String,
    entry: CacheEntry,
}

/// Bounded, LRU-evicting memoization store for agent outputs.
///
/// Internally thread-safe via a synchronous lock that is never held across
/// an `.await`; entries are immutable once written. Bounded by entry count
/// (the byte-size bound from the source is deliberately not modeled — see
/// the corresponding design note).
pub struct ResultCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
}

impl ResultCache {
    /// Creates a cache bounded to `max_size` entries.
    ///
    /// # Panics
    /// Panics if `max_size` is zero.
    pub fn new(max_size: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(max_size)
            .expect("ResultCache requires a non-zero max_size");
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    /// Looks up `key`, marking it most-recently-used on a hit.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.inner.lock().get(key).cloned()
    }

    /// Inserts or replaces `key`. If the cache is already at capacity and
    /// `key` is new, the least-recently-used entry is evicted to make room.
    pub fn set(&self, key: String, value: CacheEntry) {
        self.inner.lock().put(key, value);
    }

    /// Evicts least-recently-used entries until at most `to_size` remain.
    pub fn evict_lru(&self, to_size: usize) {
        let mut guard = self.inner.lock();
        while guard.len() > to_size {
            guard.pop_lru();
        }
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes all entries (most-recently-used first) to `path` as JSON.
    /// Failures are logged and swallowed — persistence is best-effort.
    pub async fn persist(&self, path: &Path) {
        let entries: Vec<PersistedEntry> = {
            let guard = self.inner.lock();
            guard
                .iter()
                .map(|(k, v)| PersistedEntry { key: k.clone(), entry: v.clone() })
                .collect()
        };
        match serde_json::to_vec_pretty(&entries) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(path, bytes).await {
                    warn!(path = %path.display(), error = %err, "failed to persist result cache");
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to serialize result cache for persistence");
            }
        }
    }

    /// Loads entries previously written by [`ResultCache::persist`].
    ///
    /// A missing file, a parse failure, or any other read error is treated
    /// as "no cache yet": logged at `warn!` and otherwise ignored, never
    /// propagated, per the cache's best-effort contract.
    pub async fn load(&self, path: &Path) {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "no persisted result cache to load");
                return;
            }
        };
        let entries: Vec<PersistedEntry> = match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "discarding corrupted result cache");
                return;
            }
        };
        let mut guard = self.inner.lock();
        for persisted in entries {
            guard.put(persisted.key, persisted.entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tokens: u32) -> CacheEntry {
        CacheEntry { output: serde_json::json!({"x": tokens}), total_tokens: tokens, created_at: Utc::now() }
    }

    #[test]
    fn canonical_key_is_independent_of_field_order() {
        let a = CacheKeyInput {
            agent_role: "DEVELOPER".into(),
            context_fingerprint: serde_json::json!({"b": 1, "a": 2}),
            capability_name: "write_code".into(),
        };
        let b = CacheKeyInput {
            agent_role: "DEVELOPER".into(),
            context_fingerprint: serde_json::json!({"a": 2, "b": 1}),
            capability_name: "write_code".into(),
        };
        assert_eq!(compute_cache_key(&a), compute_cache_key(&b));
    }

    #[test]
    fn different_fingerprints_produce_different_keys() {
        let a = CacheKeyInput {
            agent_role: "DEVELOPER".into(),
            context_fingerprint: serde_json::json!({"a": 1}),
            capability_name: "write_code".into(),
        };
        let b = CacheKeyInput {
            agent_role: "DEVELOPER".into(),
            context_fingerprint: serde_json::json!({"a": 2}),
            capability_name: "write_code".into(),
        };
        assert_ne!(compute_cache_key(&a), compute_cache_key(&b));
    }

    #[test]
    fn get_set_round_trips() {
        let cache = ResultCache::new(4);
        cache.set("k1".into(), entry(10));
        let fetched = cache.get("k1").unwrap();
        assert_eq!(fetched.total_tokens, 10);
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn eviction_removes_least_recently_used() {
        let cache = ResultCache::new(2);
        cache.set("a".into(), entry(1));
        cache.set("b".into(), entry(2));
        // touch "a" so "b" becomes the least-recently-used entry
        let _ = cache.get("a");
        cache.set("c".into(), entry(3));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn evict_lru_trims_to_target_size() {
        let cache = ResultCache::new(10);
        for i in 0..5 {
            cache.set(format!("k{i}"), entry(i));
        }
        cache.evict_lru(2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = ResultCache::new(4);
        cache.set("k1".into(), entry(7));
        cache.persist(&path).await;

        let reloaded = ResultCache::new(4);
        reloaded.load(&path).await;
        assert_eq!(reloaded.get("k1").unwrap().total_tokens, 7);
    }

    #[tokio::test]
    async fn load_of_missing_file_is_silently_ignored() {
        let cache = ResultCache::new(4);
        cache.load(Path::new("/nonexistent/path/cache.json")).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn load_of_corrupted_file_is_silently_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let cache = ResultCache::new(4);
        cache.load(&path).await;
        assert!(cache.is_empty());
    }
}
