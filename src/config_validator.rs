use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::Config;
use crate::error::ConfigError;

/// Startup checks for a loaded `Config`.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        Self::validate_bind_address(&config.bind_address)?;
        if let Some(url) = &config.redis_url {
            Self::validate_redis_url(url)?;
        }
        Self::validate_providers(config)?;

        config.rate_limits.validate().map_err(ConfigError::Invalid)?;

        if config.admission.max_in_flight == 0 {
            return Err(invalid("admission.max_in_flight must be greater than 0"));
        }
        if config.cache.local_capacity == 0 {
            return Err(invalid("cache.local_capacity must be greater than 0"));
        }
        if config.cache.ttl.is_zero() {
            return Err(invalid("cache.ttl must be positive"));
        }
        if config.cache.remote_timeout.is_zero() || config.routing.call_timeout.is_zero() {
            return Err(invalid("timeouts must be positive"));
        }
        if config.validation.max_text_chars == 0 {
            return Err(invalid("validation.max_text_chars must be greater than 0"));
        }
        if config.maintenance.cleanup_interval.is_zero() {
            return Err(invalid("maintenance.cleanup_interval must be positive"));
        }
        Ok(())
    }

    pub fn validate_redis_url(url: &str) -> Result<(), ConfigError> {
        if url.is_empty() {
            return Err(invalid("Redis URL cannot be empty"));
        }
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(invalid("Redis URL must start with 'redis://' or 'rediss://'"));
        }
        Ok(())
    }

    pub fn validate_bind_address(address: &str) -> Result<(), ConfigError> {
        address
            .parse::<SocketAddr>()
            .map(|_| ())
            .map_err(|_| invalid(format!("bind address '{}' must be in host:port form", address)))
    }

    /// At least one provider must be usable; names must be unique.
    pub fn validate_providers(config: &Config) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for provider in &config.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(invalid(format!("provider '{}' is listed twice", provider.name)));
            }
            if provider.window_limit == 0 {
                return Err(invalid(format!("provider '{}' has a zero window limit", provider.name)));
            }
            if provider.window.is_zero() {
                return Err(invalid(format!("provider '{}' has a zero usage window", provider.name)));
            }
        }

        if !config.providers.iter().any(|p| !p.lease_keys().is_empty()) {
            return Err(invalid(
                "no provider has API keys; set GROQ_KEYS, GEMINI_KEYS or OPENAI_KEYS",
            ));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSettings;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.providers[0].keys = vec!["gsk_test".to_string()];
        config
    }

    #[test]
    fn test_valid_config() {
        assert!(ConfigValidator::validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_redis_url() {
        assert!(ConfigValidator::validate_redis_url("redis://localhost:6379").is_ok());
        assert!(ConfigValidator::validate_redis_url("rediss://localhost:6379").is_ok());
        assert!(ConfigValidator::validate_redis_url("").is_err());
        assert!(ConfigValidator::validate_redis_url("http://localhost:6379").is_err());
    }

    #[test]
    fn test_bind_address() {
        assert!(ConfigValidator::validate_bind_address("127.0.0.1:8080").is_ok());
        assert!(ConfigValidator::validate_bind_address("0.0.0.0:3000").is_ok());
        assert!(ConfigValidator::validate_bind_address("localhost").is_err());
        assert!(ConfigValidator::validate_bind_address("").is_err());
    }

    #[test]
    fn test_requires_a_provider_with_keys() {
        let err = ConfigValidator::validate(&Config::default()).unwrap_err();
        assert!(err.to_string().contains("GROQ_KEYS"));
    }

    #[test]
    fn test_offline_provider_needs_no_keys() {
        let mut config = Config::default();
        config.providers = vec![ProviderSettings::new("scripted", 100)];
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_rejects_duplicate_providers() {
        let mut config = valid_config();
        config.providers.push(ProviderSettings::new("groq", 10));
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_rejects_zero_ceilings() {
        let mut config = valid_config();
        config.admission.max_in_flight = 0;
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = valid_config();
        config.rate_limits.global.capacity = 0;
        assert!(ConfigValidator::validate(&config)
            .unwrap_err()
            .to_string()
            .contains("global"));
    }
}
