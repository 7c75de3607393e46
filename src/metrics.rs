use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::DispatchError;
use crate::request::{Dispatched, ResultSource};

/// The single terminal outcome every handled request ends in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    CacheHit,
    ProviderSuccess,
    RejectedByPolicy,
    ValidationError,
    AllProvidersFailed,
}

impl Terminal {
    pub fn of(outcome: &Result<Dispatched, DispatchError>) -> Self {
        match outcome {
            Ok(dispatched) if dispatched.source == ResultSource::Cache => Terminal::CacheHit,
            Ok(_) => Terminal::ProviderSuccess,
            Err(DispatchError::RejectedByPolicy(_)) => Terminal::RejectedByPolicy,
            Err(DispatchError::Validation(_)) => Terminal::ValidationError,
            Err(DispatchError::AllProvidersFailed(_)) => Terminal::AllProvidersFailed,
        }
    }
}

#[derive(Debug)]
pub struct DispatchStats {
    cache_hits: AtomicU64,
    provider_successes: AtomicU64,
    rejected_by_policy: AtomicU64,
    validation_errors: AtomicU64,
    all_providers_failed: AtomicU64,
    started_at: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub provider_successes: u64,
    pub rejected_by_policy: u64,
    pub validation_errors: u64,
    pub all_providers_failed: u64,
    pub coalesced: u64,
    pub cache_hit_rate: f64,
    pub started_at: u64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            provider_successes: AtomicU64::new(0),
            rejected_by_policy: AtomicU64::new(0),
            validation_errors: AtomicU64::new(0),
            all_providers_failed: AtomicU64::new(0),
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn record(&self, outcome: &Result<Dispatched, DispatchError>) -> Terminal {
        let terminal = Terminal::of(outcome);
        self.counter(terminal).fetch_add(1, Ordering::Relaxed);
        terminal
    }

    pub fn count(&self, terminal: Terminal) -> u64 {
        self.counter(terminal).load(Ordering::Relaxed)
    }

    fn counter(&self, terminal: Terminal) -> &AtomicU64 {
        match terminal {
            Terminal::CacheHit => &self.cache_hits,
            Terminal::ProviderSuccess => &self.provider_successes,
            Terminal::RejectedByPolicy => &self.rejected_by_policy,
            Terminal::ValidationError => &self.validation_errors,
            Terminal::AllProvidersFailed => &self.all_providers_failed,
        }
    }

    /// `coalesced` comes from the admission queue, which owns that count.
    pub fn snapshot(&self, coalesced: u64) -> StatsSnapshot {
        let cache_hits = self.count(Terminal::CacheHit);
        let provider_successes = self.count(Terminal::ProviderSuccess);
        let rejected_by_policy = self.count(Terminal::RejectedByPolicy);
        let validation_errors = self.count(Terminal::ValidationError);
        let all_providers_failed = self.count(Terminal::AllProvidersFailed);
        let total_requests =
            cache_hits + provider_successes + rejected_by_policy + validation_errors + all_providers_failed;
        let served = cache_hits + provider_successes;

        StatsSnapshot {
            total_requests,
            cache_hits,
            provider_successes,
            rejected_by_policy,
            validation_errors,
            all_providers_failed,
            coalesced,
            cache_hit_rate: if served == 0 {
                0.0
            } else {
                cache_hits as f64 / served as f64
            },
            started_at: self.started_at,
        }
    }
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self::new()
    }
}
