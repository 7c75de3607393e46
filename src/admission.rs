//! Bounded, priority-aware intake with request coalescing.
//!
//! Each distinct fingerprint owns one `watch` slot while it is running or
//! queued. Later submissions of the same fingerprint subscribe to that slot
//! instead of scheduling more work. At most `max_in_flight` worker tasks run;
//! a worker that finishes pulls the next queued fingerprint itself.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::error::{DispatchError, PolicyRejection, ProviderFailure};
use crate::fingerprint::Fingerprint;
use crate::request::{Dispatched, Priority, TranslationRequest};

pub type Outcome = Result<Dispatched, DispatchError>;

#[async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn process(&self, request: Arc<TranslationRequest>) -> Outcome;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub max_in_flight: usize,
    pub max_queued: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            max_queued: 256,
        }
    }
}

struct Queued {
    priority: Priority,
    seq: u64,
    request: Arc<TranslationRequest>,
}

impl Ord for Queued {
    // Max-heap: higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .rank()
            .cmp(&other.priority.rank())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

#[derive(Default)]
struct QueueState {
    in_flight: HashMap<Fingerprint, watch::Sender<Option<Outcome>>>,
    waiting: BinaryHeap<Queued>,
    running: usize,
    next_seq: u64,
}

struct Shared<W> {
    worker: Arc<W>,
    config: AdmissionConfig,
    state: Mutex<QueueState>,
    coalesced: AtomicU64,
}

pub struct AdmissionQueue<W: Worker> {
    shared: Arc<Shared<W>>,
}

impl<W: Worker> Clone for AdmissionQueue<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

fn worker_aborted() -> DispatchError {
    DispatchError::AllProvidersFailed(vec![ProviderFailure::new("dispatcher", "worker aborted")])
}

impl<W: Worker> AdmissionQueue<W> {
    pub fn new(worker: W, config: AdmissionConfig) -> Self {
        let config = AdmissionConfig {
            max_in_flight: config.max_in_flight.max(1),
            ..config
        };
        Self {
            shared: Arc::new(Shared {
                worker: Arc::new(worker),
                config,
                state: Mutex::new(QueueState::default()),
                coalesced: AtomicU64::new(0),
            }),
        }
    }

    /// Resolve `request`, sharing the result with every concurrent submission
    /// of the same fingerprint.
    pub async fn submit(&self, request: TranslationRequest) -> Outcome {
        let mut rx = {
            let mut state = self.shared.state.lock();
            let shared = &self.shared;

            if let Some(slot) = state.in_flight.get(request.fingerprint()) {
                shared.coalesced.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(
                    request_id = %request.id(),
                    fingerprint = %request.fingerprint().short(),
                    "Coalesced with in-flight request"
                );
                slot.subscribe()
            } else {
                let saturated = state.running >= shared.config.max_in_flight;
                if saturated && state.waiting.len() >= shared.config.max_queued {
                    debug!(queued = state.waiting.len(), "Admission queue full");
                    return Err(DispatchError::RejectedByPolicy(PolicyRejection::QueueFull {
                        queued: state.waiting.len(),
                    }));
                }

                let (tx, rx) = watch::channel(None);
                state.in_flight.insert(request.fingerprint().clone(), tx);
                let request = Arc::new(request);

                if saturated {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    debug!(
                        request_id = %request.id(),
                        priority = ?request.priority(),
                        position = state.waiting.len(),
                        "Queued request"
                    );
                    state.waiting.push(Queued {
                        priority: request.priority(),
                        seq,
                        request,
                    });
                } else {
                    state.running += 1;
                    spawn_worker(Arc::clone(shared), request);
                }
                rx
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|slot| (*slot).clone());
        outcome.unwrap_or_else(|| Err(worker_aborted()))
    }

    pub fn running(&self) -> usize {
        self.shared.state.lock().running
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().waiting.len()
    }

    /// Distinct fingerprints running or queued.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    pub fn coalesced(&self) -> u64 {
        self.shared.coalesced.load(AtomicOrdering::Relaxed)
    }
}

fn spawn_worker<W: Worker>(shared: Arc<Shared<W>>, first: Arc<TranslationRequest>) {
    tokio::spawn(async move {
        let mut next = Some(first);
        while let Some(request) = next {
            let worker = Arc::clone(&shared.worker);
            let job = Arc::clone(&request);
            // The inner task isolates panics so the slot is always resolved.
            let outcome = match tokio::spawn(async move { worker.process(job).await }).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(request_id = %request.id(), error = %e, "Worker task failed");
                    Err(worker_aborted())
                }
            };
            next = shared.complete(request.fingerprint(), outcome);
        }
    });
}

impl<W> Shared<W> {
    /// Publish an outcome and hand back the next queued request, skipping
    /// entries nobody is waiting for any more.
    fn complete(&self, fingerprint: &Fingerprint, outcome: Outcome) -> Option<Arc<TranslationRequest>> {
        let mut state = self.state.lock();
        if let Some(slot) = state.in_flight.remove(fingerprint) {
            slot.send_replace(Some(outcome));
        }

        while let Some(queued) = state.waiting.pop() {
            let fingerprint = queued.request.fingerprint();
            let abandoned = state
                .in_flight
                .get(fingerprint)
                .map_or(true, |slot| slot.receiver_count() == 0);
            if abandoned {
                state.in_flight.remove(fingerprint);
                debug!(request_id = %queued.request.id(), "Dropped abandoned queued request");
                continue;
            }
            return Some(queued.request);
        }

        state.running = state.running.saturating_sub(1);
        None
    }
}
