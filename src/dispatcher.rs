//! The request dispatch pipeline.
//!
//! validate → rate limit → cache probe → admission (coalescing) → provider
//! router → cache write-through → every waiter.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionQueue, Outcome, Worker};
use crate::cache::{RemoteStore, ResultCache};
use crate::config::{Config, MaintenanceConfig};
use crate::error::{ConfigError, DispatchError, DispatchResult, ProviderFailure};
use crate::key_generator::KeyGenerator;
use crate::key_pool::{KeyPool, KeyUsage};
use crate::metrics::{DispatchStats, StatsSnapshot};
use crate::providers::{self, TranslationProvider};
use crate::rate_limiter::RateLimiter;
use crate::redis::RedisStore;
use crate::request::{Dispatched, ResultSource, TranslationRequest};
use crate::router::ProviderRouter;
use crate::validation::{DocumentMessage, IncomingMessage, RequestValidator};

/// Remote-store key holding the persisted key usage snapshot.
pub const KEY_USAGE_KEY: &str = "dispatcher:key_usage";

/// Runs one admitted fingerprint: re-check the cache, route, write through.
pub struct RoutingWorker {
    router: ProviderRouter,
    cache: Arc<ResultCache>,
}

#[async_trait]
impl Worker for RoutingWorker {
    async fn process(&self, request: Arc<TranslationRequest>) -> Outcome {
        // A computation that finished between the caller's miss and now already cached this.
        if let Some(translation) = self.cache.get(request.fingerprint()).await {
            return Ok(Dispatched {
                fingerprint: request.fingerprint().clone(),
                translation,
                source: ResultSource::Cache,
            });
        }

        let translation = self.router.translate(&request).await?;
        self.cache.put(request.fingerprint(), translation.clone()).await;

        Ok(Dispatched {
            fingerprint: request.fingerprint().clone(),
            translation,
            source: ResultSource::Provider,
        })
    }
}

pub struct Dispatcher {
    validator: RequestValidator,
    limiter: RateLimiter,
    cache: Arc<ResultCache>,
    admission: AdmissionQueue<RoutingWorker>,
    keys: Arc<KeyPool>,
    stats: DispatchStats,
    maintenance: MaintenanceConfig,
}

impl Dispatcher {
    /// Assemble the pipeline around already-built adapters (given in priority order).
    pub fn new(
        config: &Config,
        providers: Vec<Arc<dyn TranslationProvider>>,
        remote: Option<Arc<dyn RemoteStore>>,
    ) -> Self {
        let keys = config
            .providers
            .iter()
            .fold(KeyPool::new(), |pool, settings| {
                pool.with_provider(&settings.name, &settings.lease_keys(), settings.key_policy())
            });
        let keys = Arc::new(keys);

        let cache = Arc::new(ResultCache::new(config.cache.clone(), remote));
        let router = ProviderRouter::new(providers, Arc::clone(&keys), config.routing.clone());
        info!(providers = ?router.provider_names(), "Provider priority order");

        let worker = RoutingWorker {
            router,
            cache: Arc::clone(&cache),
        };

        Self {
            validator: RequestValidator::new(config.validation.clone()),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            admission: AdmissionQueue::new(worker, config.admission.clone()),
            cache,
            keys,
            stats: DispatchStats::new(),
            maintenance: config.maintenance.clone(),
        }
    }

    /// Build HTTP adapters for every provider with keys, and a Redis remote tier if configured.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {}", e)))?;

        let mut adapters = Vec::new();
        for settings in &config.providers {
            if settings.lease_keys().is_empty() {
                warn!(provider = %settings.name, "Provider has no API keys, skipping");
                continue;
            }
            adapters.push(providers::from_settings(settings, &http)?);
        }

        let remote: Option<Arc<dyn RemoteStore>> = match &config.redis_url {
            Some(url) => {
                let store = RedisStore::new(url, &config.cache.key_prefix)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Some(Arc::new(store))
            }
            None => {
                info!("No Redis URL configured, result cache is local only");
                None
            }
        };

        Ok(Self::new(config, adapters, remote))
    }

    /// Translate one text message.
    pub async fn handle(&self, message: IncomingMessage) -> DispatchResult<Dispatched> {
        let user_id = message.user_id.clone();
        let outcome = self.run(message).await;
        let terminal = self.stats.record(&outcome);

        match &outcome {
            Ok(dispatched) => info!(
                user_id = %user_id,
                fingerprint = %dispatched.fingerprint.short(),
                provider = %dispatched.translation.provider,
                outcome = ?terminal,
                "Request completed"
            ),
            Err(e) => info!(user_id = %user_id, outcome = ?terminal, error = %e, "Request failed"),
        }
        outcome
    }

    async fn run(&self, message: IncomingMessage) -> DispatchResult<Dispatched> {
        let request = self.validator.build(message)?;
        debug!(
            request_id = %request.id(),
            fingerprint = %request.fingerprint().short(),
            text_type = %request.text_type(),
            size_class = ?request.size_class(),
            "Validated request"
        );

        self.limiter
            .check(&KeyGenerator::subjects(&request), 1)
            .map_err(DispatchError::RejectedByPolicy)?;

        resolve(&self.cache, &self.admission, request).await
    }

    /// Translate the extracted segments of one document.
    ///
    /// The document is validated and rate-limited once. Each non-blank segment
    /// is dispatched as batch work; results come back in segment order, with
    /// blank segments reported as validation errors in their slot.
    pub async fn handle_segments(
        &self,
        document: DocumentMessage,
    ) -> DispatchResult<Vec<DispatchResult<Dispatched>>> {
        let requests = match self.admit_document(document) {
            Ok(requests) => requests,
            Err(e) => {
                self.stats.record(&Err(e.clone()));
                return Err(e);
            }
        };

        let mut results: Vec<Option<DispatchResult<Dispatched>>> = vec![None; requests.len()];
        let mut tasks = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            match request {
                Some(request) => {
                    let cache = Arc::clone(&self.cache);
                    let admission = self.admission.clone();
                    tasks.spawn(async move { (index, resolve(&cache, &admission, request).await) });
                }
                None => results[index] = Some(Err(DispatchError::Validation("segment is blank".to_string()))),
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    self.stats.record(&outcome);
                    results[index] = Some(outcome);
                }
                Err(e) => error!(error = %e, "Segment task failed"),
            }
        }

        Ok(results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(DispatchError::AllProvidersFailed(vec![ProviderFailure::new(
                        "dispatcher",
                        "segment task aborted",
                    )]))
                })
            })
            .collect())
    }

    fn admit_document(&self, document: DocumentMessage) -> DispatchResult<Vec<Option<TranslationRequest>>> {
        let requests = self.validator.build_segments(document)?;
        let subjects = match requests.iter().flatten().next() {
            Some(first) => KeyGenerator::subjects(first),
            None => return Err(DispatchError::Validation("document has no text to translate".to_string())),
        };
        self.limiter
            .check(&subjects, 1)
            .map_err(DispatchError::RejectedByPolicy)?;

        debug!(segments = requests.len(), "Admitted document");
        Ok(requests)
    }

    /// Periodically evict idle rate buckets and persist key usage. Stops once
    /// the dispatcher is dropped.
    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.maintenance.cleanup_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(dispatcher) = weak.upgrade() else {
                    break;
                };
                let removed = dispatcher
                    .limiter
                    .cleanup_idle(dispatcher.maintenance.bucket_idle_ttl);
                if removed > 0 {
                    debug!(removed, remaining = dispatcher.limiter.bucket_count(), "Evicted idle rate buckets");
                }
                dispatcher.persist_key_usage().await;
            }
        })
    }

    /// Write the key usage snapshot to the remote store.
    pub async fn persist_key_usage(&self) -> bool {
        let snapshot = self.keys.snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(raw) => self.cache.store_raw(KEY_USAGE_KEY, &raw).await,
            Err(e) => {
                warn!(error = %e, "Failed to encode key usage");
                false
            }
        }
    }

    /// Seed key usage from a previous run. Returns the number of keys restored.
    pub async fn restore_key_usage(&self) -> usize {
        let Some(raw) = self.cache.load_raw(KEY_USAGE_KEY).await else {
            return 0;
        };
        match serde_json::from_str::<Vec<KeyUsage>>(&raw) {
            Ok(usage) => {
                let restored = self.keys.restore(&usage);
                info!(restored, "Restored provider key usage");
                restored
            }
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable key usage snapshot");
                0
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.admission.coalesced())
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn keys(&self) -> &KeyPool {
        &self.keys
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn admission(&self) -> &AdmissionQueue<RoutingWorker> {
        &self.admission
    }
}

async fn resolve(
    cache: &ResultCache,
    admission: &AdmissionQueue<RoutingWorker>,
    request: TranslationRequest,
) -> DispatchResult<Dispatched> {
    if let Some(translation) = cache.get(request.fingerprint()).await {
        debug!(request_id = %request.id(), "Served from cache");
        return Ok(Dispatched {
            fingerprint: request.fingerprint().clone(),
            translation,
            source: ResultSource::Cache,
        });
    }
    admission.submit(request).await
}
