//! Ordered multi-provider fallback.
//!
//! Routing is an explicit state machine. `RouteState::next` is a pure
//! transition function; `ProviderRouter::translate` drives it, performing the
//! side effects (key acquisition, the call, backoff) each state asks for.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ProviderError, ProviderFailure, RouterError};
use crate::key_pool::KeyPool;
use crate::providers::{ProviderCall, TranslationProvider};
use crate::request::{TranslationRequest, Translation};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_retries: 1,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Pending,
    Trying { provider: usize, attempt: u32 },
    Retrying { provider: usize, attempt: u32 },
    FallingBack { next: usize },
    Success { provider: usize },
    Exhausted { aborted: bool },
}

/// What happened while in a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteEvent {
    /// Leave a waiting state (start, backoff elapsed, fallback announced).
    Proceed,
    Succeeded,
    TransientFailure,
    /// Quota or auth failure on the current key; another key may work.
    KeyFailure,
    /// The provider has no usable key left for this request.
    NoKey,
    RejectedInput,
}

#[derive(Debug, Clone, Copy)]
pub struct RouteLimits {
    pub providers: usize,
    pub max_retries: u32,
}

impl RouteState {
    pub fn next(self, event: RouteEvent, limits: &RouteLimits) -> RouteState {
        use RouteEvent::*;
        use RouteState::*;

        let fall_back = |provider: usize| {
            if provider + 1 < limits.providers {
                FallingBack { next: provider + 1 }
            } else {
                Exhausted { aborted: false }
            }
        };

        match (self, event) {
            (Pending, Proceed) if limits.providers == 0 => Exhausted { aborted: false },
            (Pending, Proceed) => Trying {
                provider: 0,
                attempt: 0,
            },
            (Trying { provider, .. }, Succeeded) => Success { provider },
            (Trying { provider, attempt }, TransientFailure) => {
                if attempt < limits.max_retries {
                    Retrying {
                        provider,
                        attempt: attempt + 1,
                    }
                } else {
                    fall_back(provider)
                }
            }
            (Trying { provider, attempt }, KeyFailure) => Trying { provider, attempt },
            (Trying { provider, .. }, NoKey) => fall_back(provider),
            (Trying { .. }, RejectedInput) => Exhausted { aborted: true },
            (Retrying { provider, attempt }, Proceed) => Trying { provider, attempt },
            (FallingBack { next }, Proceed) => Trying {
                provider: next,
                attempt: 0,
            },
            (state, _) => state,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RouteState::Success { .. } | RouteState::Exhausted { .. })
    }
}

pub struct ProviderRouter {
    providers: Vec<Arc<dyn TranslationProvider>>,
    keys: Arc<KeyPool>,
    config: RoutingConfig,
}

impl ProviderRouter {
    /// `providers` in priority order.
    pub fn new(providers: Vec<Arc<dyn TranslationProvider>>, keys: Arc<KeyPool>, config: RoutingConfig) -> Self {
        Self {
            providers,
            keys,
            config,
        }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub async fn translate(&self, request: &TranslationRequest) -> Result<Translation, RouterError> {
        let call = ProviderCall {
            text: request.payload().to_string(),
            source_lang: request.source_lang().to_string(),
            target_lang: request.target_lang().to_string(),
            text_type: request.text_type(),
        };
        let limits = RouteLimits {
            providers: self.providers.len(),
            max_retries: self.config.max_retries,
        };

        let mut failures = Vec::new();
        let mut abort: Option<ProviderFailure> = None;
        let mut last_reason = String::new();
        let mut key_failures = 0usize;
        let mut state = RouteState::Pending;

        loop {
            match state {
                RouteState::Pending | RouteState::FallingBack { .. } => {
                    state = state.next(RouteEvent::Proceed, &limits);
                    if let RouteState::Trying { provider, .. } = state {
                        debug!(request_id = %request.id(), provider = %self.providers[provider].name(), "Routing to provider");
                    }
                }
                RouteState::Retrying { provider, attempt } => {
                    debug!(
                        request_id = %request.id(),
                        provider = %self.providers[provider].name(),
                        attempt,
                        "Retrying provider after backoff"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                    state = state.next(RouteEvent::Proceed, &limits);
                }
                RouteState::Trying { provider, .. } => {
                    let adapter = &self.providers[provider];
                    let name = adapter.name();

                    let (event, reply) = match self.keys.acquire(name) {
                        Err(e) => {
                            last_reason = e.to_string();
                            (RouteEvent::NoKey, None)
                        }
                        Ok(lease) => {
                            let outcome = tokio::time::timeout(
                                self.config.call_timeout,
                                adapter.translate(&lease.secret, &call),
                            )
                            .await
                            .unwrap_or_else(|_| {
                                Err(ProviderError::Transient(format!(
                                    "timed out after {:?}",
                                    self.config.call_timeout
                                )))
                            });

                            match outcome {
                                Ok(reply) => (RouteEvent::Succeeded, Some(reply)),
                                Err(err) if err.is_key_failure() => {
                                    self.keys.cool_down(&lease, &err.to_string());
                                    last_reason = err.to_string();
                                    key_failures += 1;
                                    if key_failures >= self.keys.key_count(name) {
                                        (RouteEvent::NoKey, None)
                                    } else {
                                        (RouteEvent::KeyFailure, None)
                                    }
                                }
                                Err(ProviderError::Rejected(reason)) => {
                                    abort = Some(ProviderFailure::new(name, reason));
                                    (RouteEvent::RejectedInput, None)
                                }
                                Err(err) => {
                                    warn!(request_id = %request.id(), provider = %name, error = %err, "Provider call failed");
                                    last_reason = err.to_string();
                                    (RouteEvent::TransientFailure, None)
                                }
                            }
                        }
                    };

                    let next = state.next(event, &limits);
                    match (next, reply) {
                        (RouteState::Success { .. }, Some(reply)) => {
                            return Ok(Translation {
                                text: reply.text,
                                provider: name.to_string(),
                                text_type: reply.detected_text_type.unwrap_or(request.text_type()),
                            });
                        }
                        (RouteState::FallingBack { next: fallback }, _) => {
                            info!(
                                request_id = %request.id(),
                                from = %name,
                                to = %self.providers[fallback].name(),
                                reason = %last_reason,
                                "Falling back to next provider"
                            );
                            failures.push(ProviderFailure::new(name, std::mem::take(&mut last_reason)));
                            key_failures = 0;
                        }
                        (RouteState::Exhausted { aborted: false }, _) => {
                            failures.push(ProviderFailure::new(name, std::mem::take(&mut last_reason)));
                        }
                        _ => {}
                    }
                    state = next;
                }
                RouteState::Exhausted { aborted } => {
                    return match (aborted, abort.take()) {
                        (true, Some(rejection)) => {
                            info!(request_id = %request.id(), provider = %rejection.provider, "Request rejected by provider");
                            Err(RouterError::Rejected {
                                provider: rejection.provider,
                                reason: rejection.reason,
                            })
                        }
                        _ => {
                            warn!(request_id = %request.id(), attempts = failures.len(), "All providers failed");
                            Err(RouterError::AllProvidersFailed(failures))
                        }
                    };
                }
                RouteState::Success { .. } => {
                    // Success returns from the Trying arm with its reply.
                    return Err(RouterError::AllProvidersFailed(failures));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pool::KeyPolicy;
    use crate::providers::{ProviderReply, ScriptedProvider, ScriptedReply};
    use tokio_test::assert_ok;

    const LIMITS: RouteLimits = RouteLimits {
        providers: 2,
        max_retries: 1,
    };

    #[test]
    fn test_transitions_happy_path() {
        let state = RouteState::Pending.next(RouteEvent::Proceed, &LIMITS);
        assert_eq!(state, RouteState::Trying { provider: 0, attempt: 0 });
        assert_eq!(
            state.next(RouteEvent::Succeeded, &LIMITS),
            RouteState::Success { provider: 0 }
        );
    }

    #[test]
    fn test_transient_retries_then_falls_back() {
        let trying = RouteState::Trying { provider: 0, attempt: 0 };
        let retrying = trying.next(RouteEvent::TransientFailure, &LIMITS);
        assert_eq!(retrying, RouteState::Retrying { provider: 0, attempt: 1 });

        let again = retrying.next(RouteEvent::Proceed, &LIMITS);
        assert_eq!(again, RouteState::Trying { provider: 0, attempt: 1 });
        assert_eq!(
            again.next(RouteEvent::TransientFailure, &LIMITS),
            RouteState::FallingBack { next: 1 }
        );
        assert_eq!(
            RouteState::FallingBack { next: 1 }.next(RouteEvent::Proceed, &LIMITS),
            RouteState::Trying { provider: 1, attempt: 0 }
        );
    }

    #[test]
    fn test_key_failure_stays_on_provider_without_retry_budget() {
        let trying = RouteState::Trying { provider: 0, attempt: 0 };
        assert_eq!(trying.next(RouteEvent::KeyFailure, &LIMITS), trying);
        assert_eq!(
            trying.next(RouteEvent::NoKey, &LIMITS),
            RouteState::FallingBack { next: 1 }
        );
    }

    #[test]
    fn test_last_provider_exhausts() {
        let last = RouteState::Trying { provider: 1, attempt: 1 };
        assert_eq!(
            last.next(RouteEvent::TransientFailure, &LIMITS),
            RouteState::Exhausted { aborted: false }
        );
        assert_eq!(
            RouteState::Pending.next(RouteEvent::Proceed, &RouteLimits { providers: 0, max_retries: 1 }),
            RouteState::Exhausted { aborted: false }
        );
    }

    #[test]
    fn test_rejection_aborts_and_terminal_states_are_sticky() {
        let aborted = RouteState::Trying { provider: 0, attempt: 0 }.next(RouteEvent::RejectedInput, &LIMITS);
        assert_eq!(aborted, RouteState::Exhausted { aborted: true });
        assert!(aborted.is_terminal());
        assert_eq!(aborted.next(RouteEvent::Proceed, &LIMITS), aborted);
        assert_eq!(
            RouteState::Success { provider: 1 }.next(RouteEvent::TransientFailure, &LIMITS),
            RouteState::Success { provider: 1 }
        );
    }

    fn keys(providers: &[(&str, &[&str])]) -> Arc<KeyPool> {
        let pool = providers.iter().fold(KeyPool::new(), |pool, (name, secrets)| {
            let secrets: Vec<String> = secrets.iter().map(|s| s.to_string()).collect();
            pool.with_provider(name, &secrets, KeyPolicy::default())
        });
        Arc::new(pool)
    }

    fn router(providers: Vec<Arc<ScriptedProvider>>, keys: Arc<KeyPool>) -> ProviderRouter {
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn TranslationProvider>)
            .collect();
        ProviderRouter::new(providers, keys, RoutingConfig::default())
    }

    fn request() -> TranslationRequest {
        TranslationRequest::new("Good morning", "en", "fr", "42")
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_short_circuits() {
        let a = Arc::new(ScriptedProvider::new("a").with_script([ScriptedReply::Success("bonjour".into())]));
        let b = Arc::new(ScriptedProvider::new("b"));
        let router = router(vec![a.clone(), b.clone()], keys(&[("a", &["a1"]), ("b", &["b1"])]));

        let translation = assert_ok!(router.translate(&request()).await);
        assert_eq!(translation.text, "bonjour");
        assert_eq!(translation.provider, "a");
        assert_eq!(b.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_rotates_keys_then_falls_back() {
        let a = Arc::new(
            ScriptedProvider::new("a").with_script([ScriptedReply::Quota, ScriptedReply::Unauthorized]),
        );
        let b = Arc::new(ScriptedProvider::new("b"));
        let keys = keys(&[("a", &["a1", "a2"]), ("b", &["b1"])]);
        let router = router(vec![a.clone(), b.clone()], keys.clone());

        let translation = assert_ok!(router.translate(&request()).await);
        assert_eq!(translation.provider, "b");

        let used: Vec<_> = a.calls().into_iter().map(|(key, _)| key).collect();
        assert_eq!(used, vec!["a1", "a2"]);
        assert_eq!(keys.available_keys("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_retry_then_fall_back() {
        let a = Arc::new(ScriptedProvider::new("a").with_script([ScriptedReply::Hang, ScriptedReply::Hang]));
        let b = Arc::new(ScriptedProvider::new("b").with_script([ScriptedReply::Success("hola".into())]));
        let router = router(vec![a.clone(), b.clone()], keys(&[("a", &["a1"]), ("b", &["b1"])]));

        let translation = assert_ok!(router.translate(&request()).await);
        assert_eq!(translation.provider, "b");
        assert_eq!(a.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_aborts_chain() {
        let a = Arc::new(ScriptedProvider::new("a").with_script([ScriptedReply::Rejected]));
        let b = Arc::new(ScriptedProvider::new("b"));
        let router = router(vec![a, b.clone()], keys(&[("a", &["a1"]), ("b", &["b1"])]));

        let err = router.translate(&request()).await.unwrap_err();
        assert!(matches!(err, RouterError::Rejected { ref provider, .. } if provider == "a"));
        assert_eq!(b.call_count(), 0);
    }

    /// Appends the provider name to a shared log before delegating.
    struct Logged {
        inner: Arc<ScriptedProvider>,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl TranslationProvider for Logged {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn translate(&self, key: &str, call: &ProviderCall) -> Result<ProviderReply, ProviderError> {
            self.log.lock().push(format!("{}:{}", self.inner.name(), key));
            self.inner.translate(key, call).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_keys_fall_back_in_priority_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let scripted = [
            ScriptedProvider::new("a").with_script([ScriptedReply::Quota, ScriptedReply::Quota]),
            ScriptedProvider::new("b").with_script([ScriptedReply::Transient, ScriptedReply::Transient]),
            ScriptedProvider::new("c"),
        ];
        let providers: Vec<Arc<dyn TranslationProvider>> = scripted
            .into_iter()
            .map(|inner| {
                Arc::new(Logged {
                    inner: Arc::new(inner),
                    log: Arc::clone(&log),
                }) as Arc<dyn TranslationProvider>
            })
            .collect();
        let keys = keys(&[("a", &["a1", "a2"]), ("b", &["b1"]), ("c", &["c1"])]);
        let router = ProviderRouter::new(providers, keys, RoutingConfig::default());

        let translation = assert_ok!(router.translate(&request()).await);
        assert_eq!(translation.provider, "c");
        assert_eq!(*log.lock(), vec!["a:a1", "a:a2", "b:b1", "b:b1", "c:c1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_lists_every_provider() {
        let a = Arc::new(ScriptedProvider::new("a").with_script([ScriptedReply::Transient, ScriptedReply::Transient]));
        let b = Arc::new(ScriptedProvider::new("b").with_script([ScriptedReply::Quota]));
        let c = Arc::new(ScriptedProvider::new("c"));
        let router = router(vec![a, b, c.clone()], keys(&[("a", &["a1"]), ("b", &["b1"])]));

        match router.translate(&request()).await {
            Err(RouterError::AllProvidersFailed(failures)) => {
                let names: Vec<_> = failures.iter().map(|f| f.provider.as_str()).collect();
                assert_eq!(names, vec!["a", "b", "c"]);
                assert!(failures[0].reason.contains("503"));
                assert!(failures[2].reason.contains("no key available"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(c.call_count(), 0);
    }
}
