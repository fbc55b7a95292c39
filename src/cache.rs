//! Result cache keyed by content fingerprint
//!
//! Completed composites are kept for a bounded time so that the same
//! processing rendition is never segmented twice. Each entry owns a display
//! reference; evicting the entry and revoking that reference happen under the
//! same lock, so no reader can observe an entry whose reference is gone.

use crate::error::{PipelineError, Result};
use crate::lifecycle::{LifecycleManager, ObjectUrl, RefScope, ResourceOwner};
use crate::types::CompositeImage;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// SHA-256 digest of a processing rendition
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of the given bytes
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hexadecimal form
    #[must_use]
    pub fn to_hex(&self) -> String {
        use fmt::Write;
        self.0.iter().fold(String::with_capacity(64), |mut hex, byte| {
            let _ = write!(hex, "{byte:02x}");
            hex
        })
    }

    /// First 12 hex characters, for logs
    #[must_use]
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

struct CacheEntry {
    image: Arc<CompositeImage>,
    url: ObjectUrl,
    written_at: Instant,
}

/// A cache hit
#[derive(Debug, Clone)]
pub struct CachedOutput {
    pub image: Arc<CompositeImage>,
    /// Reference owned by the cache entry
    pub url: ObjectUrl,
    /// Time since the entry was last written
    pub age: Duration,
}

/// Cache usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// In-memory result cache with time-to-live eviction
pub struct ResultCache {
    ttl: Duration,
    enabled: bool,
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
    lifecycle: Arc<LifecycleManager>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("ttl", &self.ttl)
            .field("enabled", &self.enabled)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ResultCache {
    /// Create a cache whose entries live `ttl` after their last write
    #[must_use]
    pub fn new(ttl: Duration, lifecycle: Arc<LifecycleManager>) -> Self {
        Self {
            ttl,
            enabled: true,
            entries: Mutex::new(HashMap::new()),
            lifecycle,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Create a cache that never stores anything
    #[must_use]
    pub fn disabled(lifecycle: Arc<LifecycleManager>) -> Self {
        let mut cache = Self::new(Duration::ZERO, lifecycle);
        cache.enabled = false;
        cache
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Fingerprint, CacheEntry>>> {
        self.entries
            .lock()
            .map_err(|_| PipelineError::cache("result cache state is poisoned"))
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.written_at) >= self.ttl
    }

    /// Remove an entry and release its reference; caller holds the lock
    fn evict_locked(&self, entries: &mut HashMap<Fingerprint, CacheEntry>, fingerprint: Fingerprint) {
        if entries.remove(&fingerprint).is_some() {
            self.lifecycle.release_all(ResourceOwner::Cache(fingerprint));
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(fingerprint = %fingerprint.short(), "evicted cache entry");
        }
    }

    /// Look up a result
    ///
    /// Expired entries are evicted on access and reported as misses.
    ///
    /// # Errors
    /// - `CacheUnavailable` when the cache state cannot be accessed
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CachedOutput>> {
        if !self.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let mut entries = self.lock()?;
        let now = Instant::now();
        let expired = match entries.get(fingerprint) {
            Some(entry) if !self.is_expired(entry, now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(CachedOutput {
                    image: Arc::clone(&entry.image),
                    url: entry.url.clone(),
                    age: now.saturating_duration_since(entry.written_at),
                }));
            },
            Some(_) => true,
            None => false,
        };
        if expired {
            self.evict_locked(&mut entries, *fingerprint);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Store a result
    ///
    /// An existing entry under the same fingerprint is replaced and its
    /// reference released; the TTL restarts. Returns the entry's reference, or
    /// `None` when the cache is disabled.
    ///
    /// # Errors
    /// - `CacheUnavailable` when the cache state cannot be accessed
    pub fn put(&self, fingerprint: Fingerprint, image: &CompositeImage) -> Result<Option<ObjectUrl>> {
        if !self.enabled {
            return Ok(None);
        }

        let mut entries = self.lock()?;
        let now = Instant::now();

        self.evict_locked(&mut entries, fingerprint);
        let expired: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            self.evict_locked(&mut entries, key);
        }

        let image = Arc::new(image.clone());
        let url = self.lifecycle.allocate(
            ResourceOwner::Cache(fingerprint),
            RefScope::Owner,
            Arc::new(image.bytes.clone()),
        )?;
        entries.insert(
            fingerprint,
            CacheEntry {
                image,
                url: url.clone(),
                written_at: now,
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(Some(url))
    }

    /// Evict every expired entry
    ///
    /// # Errors
    /// - `CacheUnavailable` when the cache state cannot be accessed
    pub fn sweep(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        let expired: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| *key)
            .collect();
        let count = expired.len();
        for key in expired {
            self.evict_locked(&mut entries, key);
        }
        Ok(count)
    }

    /// Evict every entry
    ///
    /// # Errors
    /// - `CacheUnavailable` when the cache state cannot be accessed
    pub fn clear(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        let keys: Vec<Fingerprint> = entries.keys().copied().collect();
        let count = keys.len();
        for key in keys {
            self.evict_locked(&mut entries, key);
        }
        Ok(count)
    }

    /// Number of stored entries (0 when the state is unavailable)
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().map_or(0, |entries| entries.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Periodically sweep expired entries until the cache is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = period.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                match cache.sweep() {
                    Ok(0) => {},
                    Ok(evicted) => tracing::debug!(evicted, "cache sweep"),
                    Err(e) => tracing::warn!("cache sweep skipped: {e}"),
                }
            }
        })
    }

    /// Poison the internal lock to simulate an unreachable cache
    #[cfg(test)]
    pub(crate) fn poison_for_test(&self) {
        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = self.entries.lock();
                    panic!("poisoning result cache for test");
                })
                .join();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputFormat;

    fn composite(tag: u8) -> CompositeImage {
        CompositeImage {
            bytes: vec![tag; 16],
            width: 2,
            height: 2,
            format: OutputFormat::Png,
        }
    }

    fn cache(ttl_secs: u64) -> (ResultCache, Arc<LifecycleManager>) {
        let lifecycle = Arc::new(LifecycleManager::new());
        (
            ResultCache::new(Duration::from_secs(ttl_secs), Arc::clone(&lifecycle)),
            lifecycle,
        )
    }

    #[test]
    fn test_fingerprint_is_sha256() {
        let fingerprint = Fingerprint::of(b"abc");
        assert_eq!(
            fingerprint.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fingerprint.short(), "ba7816bf8f01");
        assert_eq!(Fingerprint::of(b"abc"), fingerprint);
        assert_ne!(Fingerprint::of(b"abd"), fingerprint);
    }

    #[tokio::test]
    async fn test_put_then_get_hits() {
        let (cache, lifecycle) = cache(60);
        let key = Fingerprint::of(b"image");
        let url = cache.put(key, &composite(1)).unwrap().unwrap();

        let hit = cache.get(&key).unwrap().unwrap();
        assert_eq!(hit.image.bytes, vec![1; 16]);
        assert_eq!(hit.url, url);
        assert_eq!(lifecycle.live_refs(ResourceOwner::Cache(key)), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_evicted_with_its_reference() {
        let (cache, lifecycle) = cache(30);
        let key = Fingerprint::of(b"image");
        let url = cache.put(key, &composite(1)).unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get(&key).unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&key).unwrap().is_none());
        assert!(lifecycle.registry().resolve(&url).is_none());
        assert_eq!(lifecycle.live_refs(ResourceOwner::Cache(key)), 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_restarts_on_write() {
        let (cache, lifecycle) = cache(30);
        let key = Fingerprint::of(b"image");
        let first = cache.put(key, &composite(1)).unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        cache.put(key, &composite(2)).unwrap();
        assert!(lifecycle.registry().resolve(&first).is_none());

        tokio::time::advance(Duration::from_secs(20)).await;
        let hit = cache.get(&key).unwrap().unwrap();
        assert_eq!(hit.image.bytes, vec![2; 16]);
        assert_eq!(lifecycle.live_refs(ResourceOwner::Cache(key)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let (cache, lifecycle) = cache(10);
        let old = Fingerprint::of(b"old");
        cache.put(old, &composite(1)).unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        let fresh = Fingerprint::of(b"fresh");
        cache.put(fresh, &composite(2)).unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(cache.sweep().unwrap(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(lifecycle.registry().live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_evicts_in_background() {
        let lifecycle = Arc::new(LifecycleManager::new());
        let cache = Arc::new(ResultCache::new(Duration::from_secs(5), Arc::clone(&lifecycle)));
        let handle = cache.spawn_sweeper(Duration::from_secs(1));
        cache.put(Fingerprint::of(b"a"), &composite(1)).unwrap();

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(cache.is_empty());
        assert_eq!(lifecycle.registry().live_count(), 0);

        drop(cache);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_clear_releases_everything() {
        let (cache, lifecycle) = cache(60);
        for tag in 0..3u8 {
            cache.put(Fingerprint::of(&[tag]), &composite(tag)).unwrap();
        }
        assert_eq!(cache.clear().unwrap(), 3);
        assert_eq!(lifecycle.registry().live_count(), 0);
    }

    #[test]
    fn test_disabled_cache_never_stores() {
        let lifecycle = Arc::new(LifecycleManager::new());
        let cache = ResultCache::disabled(Arc::clone(&lifecycle));
        let key = Fingerprint::of(b"a");
        assert!(cache.put(key, &composite(1)).unwrap().is_none());
        assert!(cache.get(&key).unwrap().is_none());
        assert_eq!(lifecycle.registry().live_count(), 0);
    }

    #[test]
    fn test_poisoned_cache_reports_unavailable() {
        let (cache, _lifecycle) = cache(60);
        cache.poison_for_test();
        let err = cache.get(&Fingerprint::of(b"a")).unwrap_err();
        assert!(matches!(err, PipelineError::CacheUnavailable(_)));
        assert!(cache.put(Fingerprint::of(b"a"), &composite(1)).is_err());
    }
}
