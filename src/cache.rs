//! Two-tier result cache.
//!
//! The local tier is a bounded LRU in front of a shared remote store. Remote
//! failures never reach callers: the cache flips to degraded mode, keeps
//! serving from the local tier, and probes the remote again once
//! `probe_interval` has passed.

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::request::Translation;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub local_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub remote_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3_600),
            local_capacity: 1_000,
            remote_timeout: Duration::from_millis(500),
            probe_interval: Duration::from_secs(30),
            key_prefix: "translation:".to_string(),
        }
    }
}

/// A stored translation. Entries are replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub result: Translation,
    pub created_at: u64,
    pub expires_at: u64,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, result: Translation, ttl: Duration) -> Self {
        let created_at = unix_now();
        Self {
            fingerprint,
            result,
            created_at,
            expires_at: created_at.saturating_add(ttl.as_secs()),
        }
    }

    pub fn is_expired(&self) -> bool {
        unix_now() >= self.expires_at
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Shared store behind the local tier.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;
    async fn set(&self, entry: &CacheEntry, ttl: Duration) -> Result<(), CacheError>;
    async fn probe(&self) -> Result<(), CacheError>;
    async fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set_raw(&self, key: &str, value: &str) -> Result<(), CacheError>;
}

/// In-process remote store for local runs and tests. Can be switched
/// unreachable or slowed down to exercise degradation.
#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, (String, Option<Instant>)>,
    unreachable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    async fn simulate(&self) -> Result<(), CacheError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CacheError::Unreachable);
        }
        Ok(())
    }

    fn read(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.values
            .remove_if(key, |_, (_, deadline)| deadline.is_some_and(|at| now >= at));
        self.values.get(key).map(|value| value.0.clone())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        self.simulate().await?;
        match self.read(fingerprint.as_str()) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, entry: &CacheEntry, ttl: Duration) -> Result<(), CacheError> {
        self.simulate().await?;
        let raw = serde_json::to_string(entry)?;
        self.values.insert(
            entry.fingerprint.as_str().to_string(),
            (raw, Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn probe(&self) -> Result<(), CacheError> {
        self.simulate().await
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.simulate().await?;
        Ok(self.read(key))
    }

    async fn set_raw(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.simulate().await?;
        self.values.insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }
}

struct LocalEntry {
    entry: CacheEntry,
    deadline: Instant,
}

pub struct ResultCache {
    config: CacheConfig,
    local: DashMap<Fingerprint, LocalEntry>,
    recency: Mutex<LruCache<Fingerprint, ()>>,
    remote: Option<Arc<dyn RemoteStore>>,
    degraded: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
}

impl ResultCache {
    pub fn new(config: CacheConfig, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        let capacity = NonZeroUsize::new(config.local_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            local: DashMap::with_capacity(capacity.get()),
            recency: Mutex::new(LruCache::new(capacity)),
            remote,
            degraded: AtomicBool::new(false),
            last_probe: Mutex::new(None),
            config,
        }
    }

    /// Local tier first, then the remote store. Remote hits are copied into the local tier.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<Translation> {
        if let Some(hit) = self.get_local(fingerprint) {
            debug!(fingerprint = %fingerprint.short(), tier = "local", "Cache hit");
            return Some(hit);
        }

        let remote = self.remote_if_available().await?;
        match self.bounded(remote.get(fingerprint)).await {
            Ok(Some(entry)) if entry.fingerprint == *fingerprint && !entry.is_expired() => {
                debug!(fingerprint = %fingerprint.short(), tier = "remote", "Cache hit");
                let result = entry.result.clone();
                // Never outlive the remote entry's own expiry.
                let remaining = Duration::from_secs(entry.expires_at.saturating_sub(unix_now()));
                self.insert_local(entry, remaining.min(self.config.ttl));
                Some(result)
            }
            Ok(_) => None,
            Err(CacheError::Codec(e)) => {
                warn!(fingerprint = %fingerprint.short(), error = %e, "Discarding undecodable cache entry");
                None
            }
            Err(e) => {
                self.mark_degraded(&e);
                None
            }
        }
    }

    /// Write-through to both tiers. A failing remote only degrades the cache.
    pub async fn put(&self, fingerprint: &Fingerprint, result: Translation) {
        let entry = CacheEntry::new(fingerprint.clone(), result, self.config.ttl);
        self.insert_local(entry.clone(), self.config.ttl);

        let Some(remote) = self.remote_if_available().await else {
            return;
        };
        if let Err(e) = self.bounded(remote.set(&entry, self.config.ttl)).await {
            self.mark_degraded(&e);
        }
    }

    pub async fn load_raw(&self, key: &str) -> Option<String> {
        let remote = self.remote_if_available().await?;
        match self.bounded(remote.get_raw(key)).await {
            Ok(value) => value,
            Err(e) => {
                self.mark_degraded(&e);
                None
            }
        }
    }

    pub async fn store_raw(&self, key: &str, value: &str) -> bool {
        let Some(remote) = self.remote_if_available().await else {
            return false;
        };
        match self.bounded(remote.set_raw(key, value)).await {
            Ok(()) => true,
            Err(e) => {
                self.mark_degraded(&e);
                false
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn tier_state(&self) -> &'static str {
        match (&self.remote, self.is_degraded()) {
            (None, _) => "local_only",
            (Some(_), false) => "healthy",
            (Some(_), true) => "degraded",
        }
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    fn get_local(&self, fingerprint: &Fingerprint) -> Option<Translation> {
        let hit = {
            let entry = self.local.get(fingerprint)?;
            if Instant::now() >= entry.deadline {
                None
            } else {
                Some(entry.entry.result.clone())
            }
        };

        match hit {
            Some(result) => {
                // Recency is best-effort; a contended lock skips the touch.
                if let Some(mut recency) = self.recency.try_lock() {
                    recency.get(fingerprint);
                }
                Some(result)
            }
            None => {
                let mut recency = self.recency.lock();
                let now = Instant::now();
                if self
                    .local
                    .remove_if(fingerprint, |_, entry| now >= entry.deadline)
                    .is_some()
                {
                    recency.pop(fingerprint);
                }
                None
            }
        }
    }

    fn insert_local(&self, entry: CacheEntry, lifetime: Duration) {
        let fingerprint = entry.fingerprint.clone();
        let local = LocalEntry {
            deadline: Instant::now() + lifetime,
            entry,
        };

        let mut recency = self.recency.lock();
        self.local.insert(fingerprint.clone(), local);
        if let Some((evicted, _)) = recency.push(fingerprint.clone(), ()) {
            if evicted != fingerprint {
                self.local.remove(&evicted);
                debug!(fingerprint = %evicted.short(), "Evicted from local cache");
            }
        }
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        match tokio::time::timeout(self.config.remote_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.config.remote_timeout)),
        }
    }

    /// The remote store, unless it is degraded and not yet due for a probe.
    async fn remote_if_available(&self) -> Option<&Arc<dyn RemoteStore>> {
        let remote = self.remote.as_ref()?;
        if !self.is_degraded() {
            return Some(remote);
        }

        let due = {
            let mut last_probe = self.last_probe.lock();
            let due = last_probe.map_or(true, |at| at.elapsed() >= self.config.probe_interval);
            if due {
                *last_probe = Some(Instant::now());
            }
            due
        };
        if !due {
            return None;
        }

        match self.bounded(remote.probe()).await {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::AcqRel) {
                    info!("Remote cache reachable again, leaving degraded mode");
                }
                Some(remote)
            }
            Err(e) => {
                debug!(error = %e, "Remote cache probe failed");
                None
            }
        }
    }

    fn mark_degraded(&self, err: &CacheError) {
        *self.last_probe.lock() = Some(Instant::now());
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(error = %err, "Remote cache unavailable, serving from local tier only");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TextType;

    fn fp(text: &str) -> Fingerprint {
        Fingerprint::compute(text, "en", "ar", TextType::General)
    }

    fn translation(text: &str) -> Translation {
        Translation {
            text: text.to_string(),
            provider: "groq".to_string(),
            text_type: TextType::General,
        }
    }

    fn config(local_capacity: usize) -> CacheConfig {
        CacheConfig {
            local_capacity,
            ..CacheConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_then_get_hits_local() {
        let cache = ResultCache::new(config(10), None);
        cache.put(&fp("hello"), translation("مرحبا")).await;
        assert_eq!(cache.get(&fp("hello")).await, Some(translation("مرحبا")));
        assert_eq!(cache.get(&fp("other")).await, None);
        assert_eq!(cache.tier_state(), "local_only");
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_hit_populates_local() {
        let store = Arc::new(MemoryStore::new());
        let writer = ResultCache::new(config(10), Some(store.clone()));
        writer.put(&fp("hello"), translation("مرحبا")).await;
        assert_eq!(store.len(), 1);

        let reader = ResultCache::new(config(10), Some(store.clone()));
        assert_eq!(reader.local_len(), 0);
        assert_eq!(reader.get(&fp("hello")).await, Some(translation("مرحبا")));
        assert_eq!(reader.local_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_tier_evicts_least_recently_used() {
        let cache = ResultCache::new(config(2), None);
        cache.put(&fp("a"), translation("1")).await;
        cache.put(&fp("b"), translation("2")).await;
        assert!(cache.get(&fp("a")).await.is_some());

        cache.put(&fp("c"), translation("3")).await;
        assert_eq!(cache.local_len(), 2);
        assert!(cache.get(&fp("a")).await.is_some());
        assert!(cache.get(&fp("b")).await.is_none());
        assert!(cache.get(&fp("c")).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_entries_expire() {
        let cache = ResultCache::new(
            CacheConfig {
                ttl: Duration::from_secs(60),
                ..config(10)
            },
            None,
        );
        cache.put(&fp("a"), translation("1")).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get(&fp("a")).await.is_none());
        assert_eq!(cache.local_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_leave_recency() {
        let cache = ResultCache::new(
            CacheConfig {
                ttl: Duration::from_secs(60),
                ..config(2)
            },
            None,
        );
        cache.put(&fp("a"), translation("1")).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get(&fp("a")).await.is_none());
        assert_eq!(cache.recency.lock().len(), 0);

        cache.put(&fp("a"), translation("2")).await;
        assert_eq!(cache.get(&fp("a")).await, Some(translation("2")));
        assert_eq!(cache.recency.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_hit_keeps_remote_expiry() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResultCache::new(config(10), Some(store.clone()));

        let now = unix_now();
        let entry = CacheEntry {
            fingerprint: fp("a"),
            result: translation("1"),
            created_at: now.saturating_sub(3_595),
            expires_at: now + 5,
        };
        store.set(&entry, Duration::from_secs(3_600)).await.unwrap();
        assert_eq!(cache.get(&fp("a")).await, Some(translation("1")));
        assert_eq!(cache.local_len(), 1);

        // Only the local copy can answer now.
        store.set_reachable(false);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get(&fp("a")).await.is_none());
        assert_eq!(cache.local_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_remote_degrades_to_local() {
        let store = Arc::new(MemoryStore::new());
        store.set_reachable(false);
        let cache = ResultCache::new(config(10), Some(store.clone()));

        cache.put(&fp("a"), translation("1")).await;
        assert!(cache.is_degraded());
        assert_eq!(cache.tier_state(), "degraded");
        assert_eq!(cache.get(&fp("a")).await, Some(translation("1")));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_remote_times_out() {
        let store = Arc::new(MemoryStore::new());
        store.set_latency(Some(Duration::from_secs(5)));
        let cache = ResultCache::new(config(10), Some(store));

        let started = Instant::now();
        assert!(cache.get(&fp("a")).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(cache.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_probe_interval() {
        let store = Arc::new(MemoryStore::new());
        store.set_reachable(false);
        let cache = ResultCache::new(config(10), Some(store.clone()));

        cache.put(&fp("a"), translation("1")).await;
        assert!(cache.is_degraded());

        store.set_reachable(true);
        cache.put(&fp("b"), translation("2")).await;
        // Not yet due for a probe: remote stays skipped
        assert!(cache.is_degraded());
        assert!(store.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        cache.put(&fp("c"), translation("3")).await;
        assert!(!cache.is_degraded());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_values_round_trip_through_remote() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResultCache::new(config(10), Some(store));
        assert!(cache.store_raw("dispatcher:key_usage", "[]").await);
        assert_eq!(cache.load_raw("dispatcher:key_usage").await.as_deref(), Some("[]"));

        let local_only = ResultCache::new(config(10), None);
        assert!(!local_only.store_raw("dispatcher:key_usage", "[]").await);
    }

    #[test]
    fn test_cache_entry_expiry() {
        let entry = CacheEntry::new(fp("a"), translation("1"), Duration::from_secs(3_600));
        assert!(!entry.is_expired());
        assert_eq!(entry.expires_at - entry.created_at, 3_600);

        let stale = CacheEntry {
            expires_at: entry.created_at.saturating_sub(1),
            ..entry
        };
        assert!(stale.is_expired());
    }
}
