//! In-memory result cache
//!
//! ## Responsibilities
//!
//! - Keyed get/set with per-entry TTL
//! - Size-bounded LRU eviction
//! - Atomic counter entries
//! - Periodic expiry sweep
//!
//! A miss is reported as `None`, never as an error. After `close()` every
//! operation fails with a closed-cache error; `close()` itself is idempotent.

use crate::error::{Error, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{Duration, Instant};

/// Sweep interval for the background expiry task
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Stored value. The cache never exposes any-typed values; counter entries
/// are always `Int`.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Bytes(Vec<u8>),
    Int(i64),
    Json(serde_json::Value),
}

/// Cached entry with bookkeeping for TTL and LRU
struct CacheEntry {
    value: CacheValue,
    expires_at: Instant,
    last_used: Instant,
    access_count: u64,
}

impl CacheEntry {
    fn new(value: CacheValue, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: now + ttl,
            last_used: now,
            access_count: 1,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub connected: bool,
    pub info: String,
}

/// In-memory cache with TTL and LRU eviction
pub struct MemoryCache {
    items: RwLock<HashMap<String, CacheEntry>>,
    max_size: usize,
    default_ttl: Duration,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl MemoryCache {
    /// Create a new cache and start its expiry sweep task.
    pub fn new(max_size: usize, default_ttl: Duration) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let cache = Arc::new(Self {
            items: RwLock::new(HashMap::new()),
            max_size,
            default_ttl,
            closed: AtomicBool::new(false),
            shutdown_tx,
        });

        let sweeper = cache.clone();
        let mut shutdown_rx = sweeper.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        sweeper.sweep_expired().await;
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Cache sweep task stopped");
                        break;
                    }
                }
            }
        });

        cache
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::CacheClosed);
        }
        Ok(())
    }

    /// Store a value under the default TTL.
    pub async fn set(&self, key: &str, value: CacheValue) -> Result<()> {
        self.set_with_ttl(key, value, self.default_ttl).await
    }

    /// Store a value with an explicit TTL.
    pub async fn set_with_ttl(&self, key: &str, value: CacheValue, ttl: Duration) -> Result<()> {
        self.check_open()?;

        let mut items = self.items.write().await;
        if items.len() >= self.max_size && !items.contains_key(key) {
            Self::evict_lru(&mut items);
        }
        items.insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(())
    }

    /// Look up a key. Expired entries are removed and reported as a miss.
    /// `last_used` and `access_count` advance only on a hit.
    pub async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        self.check_open()?;

        {
            // Fast path: a plain miss never takes the writer lock.
            let items = self.items.read().await;
            if !items.contains_key(key) {
                return Ok(None);
            }
        }

        let mut items = self.items.write().await;
        let expired = match items.get(key) {
            None => return Ok(None),
            Some(entry) => entry.is_expired(),
        };
        if expired {
            items.remove(key);
            return Ok(None);
        }

        if let Some(entry) = items.get_mut(key) {
            entry.last_used = Instant::now();
            entry.access_count += 1;
            Ok(Some(entry.value.clone()))
        } else {
            Ok(None)
        }
    }

    /// Check for a live entry without touching its LRU position.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.check_open()?;

        let items = self.items.read().await;
        Ok(matches!(items.get(key), Some(entry) if !entry.is_expired()))
    }

    /// Remove a key. Removing an absent key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.check_open()?;

        let mut items = self.items.write().await;
        items.remove(key);
        Ok(())
    }

    /// Remaining TTL for a live entry.
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.check_open()?;

        let items = self.items.read().await;
        match items.get(key) {
            Some(entry) if !entry.is_expired() => {
                Ok(Some(entry.expires_at.duration_since(Instant::now())))
            }
            _ => Ok(None),
        }
    }

    /// Atomically add 1 to a counter entry. Missing or expired entries are
    /// created at 1 under the default TTL; a non-integer value resets to 1.
    /// The expiry of a live counter is left untouched.
    pub async fn increment(&self, key: &str) -> Result<i64> {
        self.check_open()?;

        let mut items = self.items.write().await;
        match items.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry::new(CacheValue::Int(1), self.default_ttl));
                Ok(1)
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.is_expired() {
                    *entry = CacheEntry::new(CacheValue::Int(1), self.default_ttl);
                    return Ok(1);
                }
                let next = match entry.value {
                    CacheValue::Int(n) => n + 1,
                    _ => 1,
                };
                entry.value = CacheValue::Int(next);
                entry.last_used = Instant::now();
                entry.access_count += 1;
                Ok(next)
            }
        }
    }

    /// Like [`increment`](Self::increment) but always resets the expiry.
    pub async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.check_open()?;

        let mut items = self.items.write().await;
        match items.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry::new(CacheValue::Int(1), ttl));
                Ok(1)
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.is_expired() {
                    *entry = CacheEntry::new(CacheValue::Int(1), ttl);
                    return Ok(1);
                }
                let next = match entry.value {
                    CacheValue::Int(n) => n + 1,
                    _ => 1,
                };
                entry.value = CacheValue::Int(next);
                entry.expires_at = Instant::now() + ttl;
                entry.last_used = Instant::now();
                entry.access_count += 1;
                Ok(next)
            }
        }
    }

    /// Get cache statistics
    pub async fn stats(&self) -> Result<CacheStats> {
        self.check_open()?;

        let items = self.items.read().await;
        let expired = items.values().filter(|e| e.is_expired()).count();
        let access_count: u64 = items.values().map(|e| e.access_count).sum();

        Ok(CacheStats {
            connected: true,
            info: format!(
                "items={},expired={},access_count={},max_size={}",
                items.len(),
                expired,
                access_count,
                self.max_size
            ),
        })
    }

    /// Stop the sweep task and refuse further operations. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
            tracing::info!("Cache closed");
        }
    }

    /// Evict the single entry with the oldest `last_used`.
    fn evict_lru(items: &mut HashMap<String, CacheEntry>) {
        if let Some(oldest_key) = items
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone())
        {
            items.remove(&oldest_key);
            tracing::debug!(key = %oldest_key, "Evicted LRU cache entry");
        }
    }

    async fn sweep_expired(&self) {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|_, entry| !entry.is_expired());
        let removed = before - items.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Swept expired cache entries");
        }
    }
}

/// Derive a cache key from string components: md5 over the stable
/// concatenation, lowercase hex. Callers must include every field that
/// distinguishes a request.
pub fn cache_key(components: &[&str]) -> String {
    let mut joined = String::new();
    for component in components {
        joined.push_str(component);
    }
    format!("{:x}", md5::compute(joined.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));

        cache
            .set("k", CacheValue::Bytes(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(
            cache.get("k").await.unwrap(),
            Some(CacheValue::Bytes(vec![1, 2, 3]))
        );
        assert!(cache.exists("k").await.unwrap());

        cache.delete("k").await.unwrap();
        assert!(!cache.exists("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires() {
        let cache = MemoryCache::new(10, Duration::from_secs(5));

        cache.set("k", CacheValue::Int(7)).await.unwrap();
        assert!(cache.ttl("k").await.unwrap().unwrap() <= Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!cache.exists("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.ttl("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction_drops_oldest() {
        let cache = MemoryCache::new(2, Duration::from_secs(60));

        cache.set("a", CacheValue::Int(1)).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("b", CacheValue::Int(2)).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;

        // Touch "a" so "b" becomes the LRU victim.
        cache.get("a").await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;

        cache.set("c", CacheValue::Int(3)).await.unwrap();
        assert!(cache.exists("a").await.unwrap());
        assert!(!cache.exists("b").await.unwrap());
        assert!(cache.exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let cache = MemoryCache::new(2, Duration::from_secs(60));

        cache.set("a", CacheValue::Int(1)).await.unwrap();
        cache.set("b", CacheValue::Int(2)).await.unwrap();
        cache.set("a", CacheValue::Int(10)).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap(), Some(CacheValue::Int(10)));
        assert_eq!(cache.get("b").await.unwrap(), Some(CacheValue::Int(2)));
    }

    #[tokio::test]
    async fn test_increment_semantics() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));

        assert_eq!(cache.increment("n").await.unwrap(), 1);
        assert_eq!(cache.increment("n").await.unwrap(), 2);
        assert_eq!(cache.increment("n").await.unwrap(), 3);

        // Non-integer value resets to 1.
        cache
            .set("s", CacheValue::Json(serde_json::json!("text")))
            .await
            .unwrap();
        assert_eq!(cache.increment("s").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_with_ttl_resets_expiry() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));

        cache
            .increment_with_ttl("n", Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        cache
            .increment_with_ttl("n", Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        // Still alive because the second increment reset the clock.
        assert_eq!(cache.get("n").await.unwrap(), Some(CacheValue::Int(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_increment_keeps_expiry() {
        let cache = MemoryCache::new(10, Duration::from_secs(10));

        cache.increment("n").await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.increment("n").await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        // Expired: the plain increment did not extend the original TTL.
        assert_eq!(cache.increment("n").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increment_is_exact() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.increment("counter").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            cache.get("counter").await.unwrap(),
            Some(CacheValue::Int(50))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let cache = MemoryCache::new(10, Duration::from_secs(60));

        cache.close();
        cache.close();

        assert!(matches!(
            cache.set("k", CacheValue::Int(1)).await,
            Err(Error::CacheClosed)
        ));
        assert!(matches!(cache.get("k").await, Err(Error::CacheClosed)));
        assert!(matches!(cache.stats().await, Err(Error::CacheClosed)));
    }

    #[test]
    fn test_cache_key_is_stable_hex() {
        let a = cache_key(&["frame", "abc", "client-1"]);
        let b = cache_key(&["frame", "abc", "client-1"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        assert_ne!(a, cache_key(&["frame", "abc", "client-2"]));
    }
}
