use serde::Serialize;
use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::dispatcher::Dispatcher;
use crate::key_pool::ProviderUsage;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize)]
pub struct DependencyStatus {
    pub cache: CacheStatus,
    pub providers: BTreeMap<String, ProviderUsage>,
    pub admission: AdmissionStatus,
}

#[derive(Debug, Serialize)]
pub struct CacheStatus {
    /// `local_only`, `healthy` or `degraded`.
    pub tier: String,
    pub local_entries: usize,
}

#[derive(Debug, Serialize)]
pub struct AdmissionStatus {
    pub running: usize,
    pub queued: usize,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> HealthChecker<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();

        let providers: BTreeMap<String, ProviderUsage> =
            self.dispatcher.keys().usage_report().into_iter().collect();
        let cache = self.dispatcher.cache();

        HealthStatus {
            status: overall_status(self.dispatcher.keys().has_available_key(), cache.is_degraded()).to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            dependencies: DependencyStatus {
                cache: CacheStatus {
                    tier: cache.tier_state().to_string(),
                    local_entries: cache.local_len(),
                },
                providers,
                admission: AdmissionStatus {
                    running: self.dispatcher.admission().running(),
                    queued: self.dispatcher.admission().queued(),
                },
            },
        }
    }
}

/// No usable key at all is unhealthy; a degraded remote cache only degrades.
fn overall_status(any_key_available: bool, cache_degraded: bool) -> &'static str {
    match (any_key_available, cache_degraded) {
        (false, _) => "unhealthy",
        (true, true) => "degraded",
        (true, false) => "healthy",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_status() {
        assert_eq!(overall_status(true, false), "healthy");
        assert_eq!(overall_status(true, true), "degraded");
        assert_eq!(overall_status(false, false), "unhealthy");
    }

    #[test]
    fn test_health_status_serialization() {
        let mut providers = BTreeMap::new();
        providers.insert(
            "groq".to_string(),
            ProviderUsage {
                total_keys: 2,
                available_keys: 1,
                cooling_down: 1,
                total_uses: 40,
                failures: 3,
            },
        );
        let status = HealthStatus {
            status: "healthy".to_string(),
            timestamp: 1234567890,
            version: "0.1.0".to_string(),
            uptime_seconds: 3600,
            dependencies: DependencyStatus {
                cache: CacheStatus {
                    tier: "local_only".to_string(),
                    local_entries: 5,
                },
                providers,
                admission: AdmissionStatus { running: 0, queued: 0 },
            },
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("1234567890"));
        assert!(json.contains("\"cooling_down\":1"));
        assert!(json.contains("local_only"));
    }
}
