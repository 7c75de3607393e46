use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use super::{ProviderCall, ProviderReply, TranslationProvider};
use crate::error::ProviderError;

/// One canned outcome.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Success(String),
    Transient,
    Quota,
    Unauthorized,
    Rejected,
    /// Never answers; only the caller's timeout ends the call.
    Hang,
}

/// Deterministic provider that replays queued outcomes, then echoes.
///
/// Used for offline runs and to drive the router in tests.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<ScriptedReply>>,
    calls: Mutex<Vec<(String, String)>>,
    latency: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    pub fn with_script(self, replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        self.script.lock().extend(replies);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.script.lock().push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// `(key, text)` for every call received, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn echo(&self, call: &ProviderCall) -> String {
        format!("[{}:{}] {}", self.name, call.target_lang, call.text)
    }
}

#[async_trait]
impl TranslationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn translate(&self, key: &str, call: &ProviderCall) -> Result<ProviderReply, ProviderError> {
        self.calls.lock().push((key.to_string(), call.text.clone()));
        let next = self.script.lock().pop_front();

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let text = match next {
            None => self.echo(call),
            Some(ScriptedReply::Success(text)) => text,
            Some(ScriptedReply::Transient) => {
                return Err(ProviderError::Transient("503 scripted outage".to_string()))
            }
            Some(ScriptedReply::Quota) => {
                return Err(ProviderError::QuotaExhausted("429 scripted quota".to_string()))
            }
            Some(ScriptedReply::Unauthorized) => {
                return Err(ProviderError::Unauthorized("401 scripted auth failure".to_string()))
            }
            Some(ScriptedReply::Rejected) => {
                return Err(ProviderError::Rejected("422 scripted rejection".to_string()))
            }
            Some(ScriptedReply::Hang) => std::future::pending().await,
        };

        Ok(ProviderReply {
            text,
            detected_text_type: None,
        })
    }
}
