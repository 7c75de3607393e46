use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{build_prompt, classify_status, ProviderCall, ProviderReply, TranslationProvider};
use crate::error::ProviderError;

pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const GROQ_MODEL: &str = "llama3-8b-8192";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_MODEL: &str = "gpt-3.5-turbo";

/// Any provider speaking the OpenAI chat-completions protocol (OpenAI, Groq).
pub struct OpenAiCompatible {
    name: String,
    http: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

impl OpenAiCompatible {
    pub fn new(name: &str, http: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            max_tokens: 2_000,
        }
    }

    pub fn groq(http: reqwest::Client) -> Self {
        Self::new("groq", http, GROQ_BASE_URL, GROQ_MODEL)
    }

    pub fn openai(http: reqwest::Client) -> Self {
        Self::new("openai", http, OPENAI_BASE_URL, OPENAI_MODEL)
    }
}

#[async_trait]
impl TranslationProvider for OpenAiCompatible {
    fn name(&self) -> &str {
        &self.name
    }

    async fn translate(&self, key: &str, call: &ProviderCall) -> Result<ProviderReply, ProviderError> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": build_prompt(call)}],
            "max_tokens": self.max_tokens,
            "temperature": 0.1
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: ChatResponse = response.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ProviderError::Transient("empty completion".to_string()))?;

        debug!(provider = %self.name, model = %self.model, chars = text.len(), "Provider call succeeded");
        Ok(ProviderReply {
            text,
            detected_text_type: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let groq = OpenAiCompatible::groq(reqwest::Client::new());
        assert_eq!(groq.name(), "groq");
        assert_eq!(groq.base_url, GROQ_BASE_URL);
        assert_eq!(groq.model, GROQ_MODEL);

        let custom = OpenAiCompatible::new("local", reqwest::Client::new(), "http://localhost:8000/v1/", "m");
        assert_eq!(custom.base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn test_parses_chat_response() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"  مرحبا  "}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("  مرحبا  "));
    }
}
