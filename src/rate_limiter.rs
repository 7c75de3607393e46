use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::PolicyRejection;
use crate::key_generator::Subject;
use crate::rate_limit_config::{BucketRule, RateLimitConfig};
use crate::token_bucket::TokenBucket;

/// Independent limiter dimensions. Every enabled one must admit a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    User,
    Ip,
    Global,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::User, Dimension::Ip, Dimension::Global];
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::User => f.write_str("user"),
            Dimension::Ip => f.write_str("ip"),
            Dimension::Global => f.write_str("global"),
        }
    }
}

/// Token-bucket gates keyed by subject. Each bucket has its own lock, so
/// unrelated subjects never contend.
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<RateLimitConfig>,
    buckets: Arc<DashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            config: Arc::new(config),
            buckets: Arc::new(DashMap::new()),
        }
    }

    fn bucket(&self, key: &str, rule: &BucketRule) -> Arc<Mutex<TokenBucket>> {
        if let Some(existing) = self.buckets.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(TokenBucket::new(
                rule.capacity,
                rule.refill_per_second,
            )))
        });
        Arc::clone(entry.value())
    }

    /// Charge `cost` against a single subject. Disabled dimensions always admit.
    pub fn try_acquire(&self, key: &str, dimension: Dimension, cost: u32) -> bool {
        let rule = self.config.rule(dimension);
        if !rule.enabled {
            return true;
        }
        let bucket = self.bucket(key, rule);
        let granted = bucket.lock().try_consume(cost);
        granted
    }

    /// Charge `cost` against every subject in order. The first denial wins and
    /// refunds whatever earlier subjects already paid for this request.
    pub fn check(&self, subjects: &[Subject], cost: u32) -> Result<(), PolicyRejection> {
        let mut charged: Vec<Arc<Mutex<TokenBucket>>> = Vec::with_capacity(subjects.len());

        for subject in subjects {
            let rule = self.config.rule(subject.dimension);
            if !rule.enabled {
                continue;
            }

            let bucket = self.bucket(&subject.key, rule);
            let denied_for = {
                let mut guard = bucket.lock();
                if guard.try_consume(cost) {
                    None
                } else {
                    Some(guard.time_until_available(cost).unwrap_or_default())
                }
            };

            match denied_for {
                None => charged.push(bucket),
                Some(retry_after) => {
                    for paid in &charged {
                        paid.lock().refund(cost);
                    }
                    debug!(
                        subject = %subject.key,
                        dimension = %subject.dimension,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Rate limit exceeded"
                    );
                    return Err(PolicyRejection::RateLimited {
                        dimension: subject.dimension,
                        retry_after,
                    });
                }
            }
        }

        Ok(())
    }

    /// Remaining whole tokens for a subject; untouched subjects report full capacity.
    pub fn remaining(&self, key: &str, dimension: Dimension) -> u32 {
        let rule = self.config.rule(dimension);
        match self.buckets.get(key) {
            Some(bucket) => bucket.value().lock().available_tokens(),
            None => rule.capacity,
        }
    }

    /// Drop buckets that have not been touched for `max_idle`.
    pub fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let initial_count = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.lock().idle_for() < max_idle);
        initial_count.saturating_sub(self.buckets.len())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
