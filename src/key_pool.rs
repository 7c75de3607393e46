//! Provider credentials and their quota state.
//!
//! Every key sits behind its own lock. Selection scans the provider's keys,
//! picks the least recently used eligible one, and re-checks it under its lock
//! before claiming it, so a key that entered cooldown mid-scan is never handed
//! out.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How keys of one provider are rationed.
#[derive(Debug, Clone)]
pub struct KeyPolicy {
    pub cooldown: Duration,
    pub window: Duration,
    pub window_limit: u32,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            window: Duration::from_secs(86_400),
            window_limit: 1_000,
        }
    }
}

#[derive(Debug)]
pub struct ProviderKey {
    provider: String,
    secret: Arc<str>,
    key_id: String,
    window_usage: u32,
    window_started: Instant,
    cooldown_until: Option<Instant>,
    last_used_seq: u64,
    total_uses: u64,
    failures: u64,
}

impl ProviderKey {
    fn new(provider: &str, secret: &str) -> Self {
        Self {
            provider: provider.to_string(),
            secret: Arc::from(secret),
            key_id: key_id(secret),
            window_usage: 0,
            window_started: Instant::now(),
            cooldown_until: None,
            last_used_seq: 0,
            total_uses: 0,
            failures: 0,
        }
    }

    fn roll_window(&mut self, policy: &KeyPolicy, now: Instant) {
        if now.duration_since(self.window_started) >= policy.window {
            self.window_started = now;
            self.window_usage = 0;
        }
    }

    fn is_eligible(&mut self, policy: &KeyPolicy, now: Instant) -> bool {
        self.roll_window(policy, now);
        let cooling = self.cooldown_until.is_some_and(|until| now < until);
        !cooling && self.window_usage < policy.window_limit
    }
}

/// Stable, non-secret identifier for a key.
pub fn key_id(secret: &str) -> String {
    blake3::hash(secret.as_bytes()).to_hex()[..8].to_string()
}

/// A key handed to the router for one call.
#[derive(Debug, Clone)]
pub struct KeyLease {
    pub provider: String,
    pub key_id: String,
    pub secret: Arc<str>,
    index: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("no key available for provider {provider}")]
pub struct NoKeyAvailable {
    pub provider: String,
}

struct ProviderKeys {
    policy: KeyPolicy,
    keys: Vec<Mutex<ProviderKey>>,
}

/// Persistable per-key usage, keyed by `key_id` so secrets never leave the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyUsage {
    pub provider: String,
    pub key_id: String,
    pub window_usage: u32,
    pub total_uses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderUsage {
    pub total_keys: usize,
    pub available_keys: usize,
    pub cooling_down: usize,
    pub total_uses: u64,
    pub failures: u64,
}

pub struct KeyPool {
    providers: HashMap<String, ProviderKeys>,
    use_seq: AtomicU64,
}

impl KeyPool {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            use_seq: AtomicU64::new(0),
        }
    }

    /// Register a provider's keys. Blank entries and duplicates are skipped.
    pub fn with_provider(mut self, provider: &str, secrets: &[String], policy: KeyPolicy) -> Self {
        let mut seen = std::collections::HashSet::new();
        let keys: Vec<_> = secrets
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && seen.insert(s.to_string()))
            .map(|s| Mutex::new(ProviderKey::new(provider, s)))
            .collect();

        info!(provider = %provider, keys = keys.len(), "Registered provider keys");
        self.providers
            .insert(provider.to_string(), ProviderKeys { policy, keys });
        self
    }

    /// Least recently used key that is neither cooling down nor over its window limit.
    pub fn acquire(&self, provider: &str) -> Result<KeyLease, NoKeyAvailable> {
        let no_key = || NoKeyAvailable {
            provider: provider.to_string(),
        };
        let entry = self.providers.get(provider).ok_or_else(no_key)?;

        loop {
            let now = Instant::now();
            let candidate = entry
                .keys
                .iter()
                .enumerate()
                .filter_map(|(index, key)| {
                    let mut key = key.lock();
                    key.is_eligible(&entry.policy, now)
                        .then_some((key.last_used_seq, index))
                })
                .min();

            let (_, index) = candidate.ok_or_else(no_key)?;

            let mut key = entry.keys[index].lock();
            if !key.is_eligible(&entry.policy, Instant::now()) {
                // Lost a race with a cooldown or the window limit; rescan.
                continue;
            }
            key.last_used_seq = self.use_seq.fetch_add(1, Ordering::Relaxed) + 1;
            key.window_usage += 1;
            key.total_uses += 1;

            debug!(provider = %provider, key_id = %key.key_id, usage = key.window_usage, "Acquired provider key");
            return Ok(KeyLease {
                provider: key.provider.clone(),
                key_id: key.key_id.clone(),
                secret: Arc::clone(&key.secret),
                index,
            });
        }
    }

    /// Suspend a key after a quota or authentication failure.
    pub fn cool_down(&self, lease: &KeyLease, reason: &str) {
        let Some(entry) = self.providers.get(&lease.provider) else {
            return;
        };
        let Some(key) = entry.keys.get(lease.index) else {
            return;
        };
        let mut key = key.lock();
        key.cooldown_until = Some(Instant::now() + entry.policy.cooldown);
        key.failures += 1;
        warn!(
            provider = %lease.provider,
            key_id = %lease.key_id,
            cooldown_secs = entry.policy.cooldown.as_secs(),
            reason = %reason,
            "Provider key cooling down"
        );
    }

    pub fn available_keys(&self, provider: &str) -> usize {
        let Some(entry) = self.providers.get(provider) else {
            return 0;
        };
        let now = Instant::now();
        entry
            .keys
            .iter()
            .filter(|key| key.lock().is_eligible(&entry.policy, now))
            .count()
    }

    pub fn key_count(&self, provider: &str) -> usize {
        self.providers.get(provider).map_or(0, |entry| entry.keys.len())
    }

    pub fn has_available_key(&self) -> bool {
        self.providers.keys().any(|p| self.available_keys(p) > 0)
    }

    pub fn usage_report(&self) -> HashMap<String, ProviderUsage> {
        let now = Instant::now();
        self.providers
            .iter()
            .map(|(name, entry)| {
                let mut report = ProviderUsage {
                    total_keys: entry.keys.len(),
                    available_keys: 0,
                    cooling_down: 0,
                    total_uses: 0,
                    failures: 0,
                };
                for key in &entry.keys {
                    let mut key = key.lock();
                    if key.is_eligible(&entry.policy, now) {
                        report.available_keys += 1;
                    }
                    if key.cooldown_until.is_some_and(|until| now < until) {
                        report.cooling_down += 1;
                    }
                    report.total_uses += key.total_uses;
                    report.failures += key.failures;
                }
                (name.clone(), report)
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<KeyUsage> {
        let mut usage: Vec<KeyUsage> = self
            .providers
            .values()
            .flat_map(|entry| entry.keys.iter())
            .map(|key| {
                let key = key.lock();
                KeyUsage {
                    provider: key.provider.clone(),
                    key_id: key.key_id.clone(),
                    window_usage: key.window_usage,
                    total_uses: key.total_uses,
                }
            })
            .collect();
        usage.sort_by(|a, b| (&a.provider, &a.key_id).cmp(&(&b.provider, &b.key_id)));
        usage
    }

    /// Seed usage counters from a previous run. Unknown keys are ignored.
    pub fn restore(&self, usage: &[KeyUsage]) -> usize {
        let mut restored = 0;
        for record in usage {
            let Some(entry) = self.providers.get(&record.provider) else {
                continue;
            };
            for key in &entry.keys {
                let mut key = key.lock();
                if key.key_id == record.key_id {
                    key.window_usage = record.window_usage;
                    key.total_uses = record.total_uses;
                    restored += 1;
                }
            }
        }
        restored
    }
}

impl Default for KeyPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn policy(cooldown_secs: u64, window_limit: u32) -> KeyPolicy {
        KeyPolicy {
            cooldown: Duration::from_secs(cooldown_secs),
            window: Duration::from_secs(3_600),
            window_limit,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robins_least_recently_used() {
        let pool = KeyPool::new().with_provider("groq", &secrets(&["k1", "k2", "k3"]), policy(60, 100));
        let picked: Vec<_> = (0..6)
            .map(|_| pool.acquire("groq").unwrap().secret.to_string())
            .collect();
        assert_eq!(picked, vec!["k1", "k2", "k3", "k1", "k2", "k3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_excludes_key_until_expiry() {
        let pool = KeyPool::new().with_provider("groq", &secrets(&["k1", "k2"]), policy(30, 100));
        let first = pool.acquire("groq").unwrap();
        pool.cool_down(&first, "429");

        for _ in 0..5 {
            assert_eq!(&*pool.acquire("groq").unwrap().secret, "k2");
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(&*pool.acquire("groq").unwrap().secret, "k1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_keys_cooling_reports_unavailable() {
        let pool = KeyPool::new().with_provider("gemini", &secrets(&["a", "b"]), policy(30, 100));
        let a = pool.acquire("gemini").unwrap();
        let b = pool.acquire("gemini").unwrap();
        pool.cool_down(&a, "quota");
        pool.cool_down(&b, "quota");

        let err = pool.acquire("gemini").unwrap_err();
        assert_eq!(err.provider, "gemini");
        assert!(!pool.has_available_key());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(pool.acquire("gemini").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_limit_and_reset() {
        let pool = KeyPool::new().with_provider("openai", &secrets(&["only"]), policy(30, 2));
        assert!(pool.acquire("openai").is_ok());
        assert!(pool.acquire("openai").is_ok());
        assert!(pool.acquire("openai").is_err());

        tokio::time::advance(Duration::from_secs(3_600)).await;
        assert!(pool.acquire("openai").is_ok());
    }

    #[test]
    fn test_unknown_provider_and_blank_keys() {
        let pool = KeyPool::new().with_provider("groq", &secrets(&[" ", "", "k1", "k1"]), KeyPolicy::default());
        assert_eq!(pool.usage_report()["groq"].total_keys, 1);
        assert!(pool.acquire("azure").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_never_returns_cooling_key() {
        let pool = Arc::new(KeyPool::new().with_provider("groq", &secrets(&["hot", "cold"]), policy(600, 10_000)));
        let cold = loop {
            let lease = pool.acquire("groq").unwrap();
            if &*lease.secret == "cold" {
                break lease;
            }
        };
        pool.cool_down(&cold, "quota");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                (0..50)
                    .map(|_| pool.acquire("groq").unwrap().secret.to_string())
                    .collect::<Vec<_>>()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().iter().all(|s| s == "hot"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_restore() {
        let pool = KeyPool::new().with_provider("groq", &secrets(&["k1", "k2"]), policy(60, 100));
        pool.acquire("groq").unwrap();
        pool.acquire("groq").unwrap();
        pool.acquire("groq").unwrap();
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.iter().map(|u| u.total_uses).sum::<u64>(), 3);

        let fresh = KeyPool::new().with_provider("groq", &secrets(&["k1", "k2"]), policy(60, 100));
        assert_eq!(fresh.restore(&snapshot), 2);
        assert_eq!(fresh.snapshot(), snapshot);
        assert!(snapshot.iter().all(|u| u.key_id.len() == 8 && u.key_id != "k1"));
    }
}
