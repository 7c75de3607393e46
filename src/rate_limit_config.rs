use serde::{Deserialize, Serialize};

use crate::rate_limiter::Dimension;

/// Per-dimension token bucket rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub user: BucketRule,
    pub ip: BucketRule,
    pub global: BucketRule,
}

/// Burst allowance (`capacity`) and sustained rate (`refill_per_second`) for one dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketRule {
    pub capacity: u32,
    pub refill_per_second: f64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            // 50 translations per user per day
            user: BucketRule::per_period(50, 86_400),
            // 100 per source address per hour
            ip: BucketRule::per_period(100, 3_600),
            // 1000 across the service per hour
            global: BucketRule::per_period(1_000, 3_600),
        }
    }
}

impl RateLimitConfig {
    pub fn rule(&self, dimension: Dimension) -> &BucketRule {
        match dimension {
            Dimension::User => &self.user,
            Dimension::Ip => &self.ip,
            Dimension::Global => &self.global,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for dimension in Dimension::ALL {
            self.rule(dimension)
                .validate()
                .map_err(|e| format!("{} rate limit: {}", dimension, e))?;
        }
        Ok(())
    }
}

impl BucketRule {
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            enabled: true,
        }
    }

    /// A bucket that refills `requests` tokens over `period_secs`.
    pub fn per_period(requests: u32, period_secs: u64) -> Self {
        Self::new(requests, requests as f64 / period_secs as f64)
    }

    pub fn disabled() -> Self {
        Self {
            capacity: 0,
            refill_per_second: 0.0,
            enabled: false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.capacity == 0 {
            return Err("capacity must be greater than 0".to_string());
        }
        if !self.refill_per_second.is_finite() || self.refill_per_second <= 0.0 {
            return Err("refill rate must be a positive number".to_string());
        }
        Ok(())
    }
}
