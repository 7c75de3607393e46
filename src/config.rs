use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::admission::AdmissionConfig;
use crate::cache::CacheConfig;
use crate::config_validator::ConfigValidator;
use crate::error::ConfigError;
use crate::key_pool::KeyPolicy;
use crate::rate_limit_config::{BucketRule, RateLimitConfig};
use crate::router::RoutingConfig;
use crate::validation::ValidationConfig;

/// Service configuration. Immutable once the dispatcher is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    pub log_level: String,
    /// No URL means the cache runs local-only.
    pub redis_url: Option<String>,
    /// In priority order.
    pub providers: Vec<ProviderSettings>,
    pub rate_limits: RateLimitConfig,
    pub cache: CacheConfig,
    pub admission: AdmissionConfig,
    pub routing: RoutingConfig,
    pub validation: ValidationConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub name: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,
    #[serde(default = "default_window_limit")]
    pub window_limit: u32,
}

const OFFLINE_KEY: &str = "offline";

fn default_cooldown() -> Duration {
    Duration::from_secs(60)
}

fn default_window() -> Duration {
    Duration::from_secs(86_400)
}

fn default_window_limit() -> u32 {
    1_000
}

impl ProviderSettings {
    pub fn new(name: &str, window_limit: u32) -> Self {
        Self {
            name: name.to_string(),
            keys: Vec::new(),
            base_url: None,
            model: None,
            cooldown: default_cooldown(),
            window: default_window(),
            window_limit,
        }
    }

    /// The scripted provider needs no credentials.
    pub fn is_offline(&self) -> bool {
        self.name == "scripted"
    }

    /// Keys the pool leases for this provider. Offline providers without
    /// configured keys get a single placeholder so calls can be leased.
    pub fn lease_keys(&self) -> Vec<String> {
        if self.keys.is_empty() && self.is_offline() {
            vec![OFFLINE_KEY.to_string()]
        } else {
            self.keys.clone()
        }
    }

    pub fn key_policy(&self) -> KeyPolicy {
        KeyPolicy {
            cooldown: self.cooldown,
            window: self.window,
            window_limit: self.window_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    #[serde(with = "humantime_serde")]
    pub bucket_idle_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            bucket_idle_ttl: Duration::from_secs(3_600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:3000".to_string(),
            log_level: "info".to_string(),
            redis_url: None,
            providers: vec![
                ProviderSettings::new("groq", 2_000),
                ProviderSettings::new("gemini", 1_000),
                ProviderSettings::new("openai", 500),
            ],
            rate_limits: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            admission: AdmissionConfig::default(),
            routing: RoutingConfig::default(),
            validation: ValidationConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, then the optional JSON file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(addr) = get("BIND_ADDR") {
            self.bind_address = addr;
        }
        if let Some(url) = get("REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }

        for (var, provider) in [("GROQ_KEYS", "groq"), ("GEMINI_KEYS", "gemini"), ("OPENAI_KEYS", "openai")] {
            if let Some(raw) = get(var) {
                let keys = split_keys(&raw);
                match self.providers.iter_mut().find(|p| p.name == provider) {
                    Some(settings) => settings.keys = keys,
                    None => self.providers.push(ProviderSettings {
                        keys,
                        ..ProviderSettings::new(provider, default_window_limit())
                    }),
                }
            }
        }

        if let Some(raw) = get("MAX_IN_FLIGHT") {
            self.admission.max_in_flight = parse_number("MAX_IN_FLIGHT", &raw)?;
        }
        if let Some(raw) = get("MAX_QUEUED") {
            self.admission.max_queued = parse_number("MAX_QUEUED", &raw)?;
        }
        if let Some(raw) = get("CACHE_TTL") {
            self.cache.ttl = parse_duration("CACHE_TTL", &raw)?;
        }
        if let Some(raw) = get("CACHE_MAX_SIZE") {
            self.cache.local_capacity = parse_number("CACHE_MAX_SIZE", &raw)?;
        }
        if let Some(raw) = get("CALL_TIMEOUT") {
            self.routing.call_timeout = parse_duration("CALL_TIMEOUT", &raw)?;
        }
        if let Some(raw) = get("DAILY_LIMIT_PER_USER") {
            let limit: u32 = parse_number("DAILY_LIMIT_PER_USER", &raw)?;
            self.rate_limits.user = BucketRule::per_period(limit, 86_400);
        }
        Ok(())
    }
}

fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::Env {
        var: var.to_string(),
        reason: e.to_string(),
    })
}

/// Humantime (`90s`, `1h`) or bare seconds.
fn parse_duration(var: &str, raw: &str) -> Result<Duration, ConfigError> {
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime_serde::re::humantime::parse_duration(raw).map_err(|e| ConfigError::Env {
        var: var.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_address, "127.0.0.1:3000");
        let names: Vec<_> = config.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["groq", "gemini", "openai"]);
        assert_eq!(config.admission.max_in_flight, 10);
        assert_eq!(config.cache.ttl, Duration::from_secs(3_600));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[
                ("GROQ_KEYS", "g1, g2,,"),
                ("REDIS_URL", "redis://cache:6379"),
                ("MAX_IN_FLIGHT", "4"),
                ("CACHE_TTL", "2h"),
                ("CALL_TIMEOUT", "15"),
                ("LOG_LEVEL", "DEBUG"),
                ("DAILY_LIMIT_PER_USER", "20"),
            ]))
            .unwrap();

        assert_eq!(config.providers[0].keys, vec!["g1", "g2"]);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.admission.max_in_flight, 4);
        assert_eq!(config.cache.ttl, Duration::from_secs(7_200));
        assert_eq!(config.routing.call_timeout, Duration::from_secs(15));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.rate_limits.user.capacity, 20);
    }

    #[test]
    fn test_bad_env_value_names_variable() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(env(&[("MAX_IN_FLIGHT", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref var, .. } if var == "MAX_IN_FLIGHT"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let raw = r#"{
            "bind_address": "0.0.0.0:8080",
            "providers": [{"name": "gemini", "keys": ["k"], "cooldown": "2m"}],
            "cache": {"ttl": "30m"},
            "routing": {"max_retries": 3}
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].cooldown, Duration::from_secs(120));
        assert_eq!(config.providers[0].window_limit, 1_000);
        assert_eq!(config.cache.ttl, Duration::from_secs(1_800));
        assert_eq!(config.cache.local_capacity, 1_000);
        assert_eq!(config.routing.max_retries, 3);
        assert_eq!(config.routing.call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_offline_provider_gets_placeholder_key() {
        let scripted = ProviderSettings::new("scripted", 100);
        assert_eq!(scripted.lease_keys(), vec!["offline"]);
        assert!(ProviderSettings::new("groq", 100).lease_keys().is_empty());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Config::from_file(Path::new("/nonexistent/dispatcher.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
