use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{build_prompt, classify_status, ProviderCall, ProviderReply, TranslationProvider};
use crate::error::ProviderError;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_MODEL: &str = "gemini-pro";

pub struct Gemini {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

impl GenerateResponse {
    fn into_text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content.parts.into_iter().map(|p| p.text).collect();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

impl Gemini {
    pub fn new(http: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn hosted(http: reqwest::Client) -> Self {
        Self::new(http, GEMINI_BASE_URL, GEMINI_MODEL)
    }
}

#[async_trait]
impl TranslationProvider for Gemini {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn translate(&self, key: &str, call: &ProviderCall) -> Result<ProviderReply, ProviderError> {
        let body = json!({
            "contents": [{"parts": [{"text": build_prompt(call)}]}],
            "generationConfig": {"temperature": 0.1}
        });

        let response = self
            .http
            .post(format!("{}/models/{}:generateContent", self.base_url, self.model))
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: GenerateResponse = response.json().await?;
        // A 200 without candidates means the prompt was blocked by safety filters.
        let text = parsed
            .into_text()
            .ok_or_else(|| ProviderError::Rejected("no candidates returned".to_string()))?;

        debug!(provider = "gemini", model = %self.model, chars = text.len(), "Provider call succeeded");
        Ok(ProviderReply {
            text,
            detected_text_type: None,
        })
    }
}
