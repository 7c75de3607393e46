//! Outbound translation provider adapters.

mod gemini;
mod openai;
mod scripted;

pub use gemini::Gemini;
pub use openai::OpenAiCompatible;
pub use scripted::{ScriptedProvider, ScriptedReply};

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;

use crate::config::ProviderSettings;
use crate::error::{ConfigError, ProviderError};
use crate::request::TextType;

/// What a provider is asked to translate.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCall {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub text_type: TextType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub text: String,
    pub detected_text_type: Option<TextType>,
}

#[async_trait]
pub trait TranslationProvider: Send + Sync {
    fn name(&self) -> &str;

    /// One call with one key. Timeouts are enforced by the caller.
    async fn translate(&self, key: &str, call: &ProviderCall) -> Result<ProviderReply, ProviderError>;
}

/// Build the adapter for a configured provider. Known names get their
/// hosted defaults; any other name needs an OpenAI-compatible `base_url`.
pub fn from_settings(
    settings: &ProviderSettings,
    http: &reqwest::Client,
) -> Result<Arc<dyn TranslationProvider>, ConfigError> {
    let base_url = settings.base_url.as_deref();
    let model = settings.model.as_deref();

    let provider: Arc<dyn TranslationProvider> = match settings.name.as_str() {
        "groq" => Arc::new(OpenAiCompatible::new(
            "groq",
            http.clone(),
            base_url.unwrap_or(openai::GROQ_BASE_URL),
            model.unwrap_or(openai::GROQ_MODEL),
        )),
        "openai" => Arc::new(OpenAiCompatible::new(
            "openai",
            http.clone(),
            base_url.unwrap_or(openai::OPENAI_BASE_URL),
            model.unwrap_or(openai::OPENAI_MODEL),
        )),
        "gemini" => Arc::new(Gemini::new(
            http.clone(),
            base_url.unwrap_or(gemini::GEMINI_BASE_URL),
            model.unwrap_or(gemini::GEMINI_MODEL),
        )),
        "scripted" => Arc::new(ScriptedProvider::new("scripted")),
        other => match (base_url, model) {
            (Some(base_url), Some(model)) => Arc::new(OpenAiCompatible::new(other, http.clone(), base_url, model)),
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}' needs base_url and model",
                    other
                )))
            }
        },
    };
    Ok(provider)
}

/// Normalize an HTTP failure into the router's error classes.
pub fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = format!("{} {}", status.as_u16(), truncate(body, 200));
    match status.as_u16() {
        429 => ProviderError::QuotaExhausted(detail),
        401 | 403 => ProviderError::Unauthorized(detail),
        400 | 404 | 413 | 422 => ProviderError::Rejected(detail),
        _ => ProviderError::Transient(detail),
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub(crate) fn language_name(code: &str) -> &str {
    match code {
        "en" => "English",
        "ar" => "Arabic",
        "fr" => "French",
        "de" => "German",
        "es" => "Spanish",
        "it" => "Italian",
        "pt" => "Portuguese",
        "ru" => "Russian",
        "zh" => "Chinese",
        "ja" => "Japanese",
        "ko" => "Korean",
        "tr" => "Turkish",
        other => other,
    }
}

/// Prompt specialised for the text type.
pub(crate) fn build_prompt(call: &ProviderCall) -> String {
    let target = language_name(&call.target_lang);
    let source = if call.source_lang == "auto" {
        "the source language".to_string()
    } else {
        language_name(&call.source_lang).to_string()
    };

    let guidance = match call.text_type {
        TextType::Technical => {
            "You are a translator specialised in technical and scientific texts.\n\
             Keep technical terms precise, translate equations and symbols carefully,\n\
             preserve the structure of scientific sentences and keep terminology consistent."
        }
        TextType::Academic => {
            "You are an academic translator specialised in research texts.\n\
             Keep a formal academic register, preserve references and citations exactly\n\
             and use established research terminology."
        }
        TextType::General => {
            "Translate naturally and clearly, preserving the original meaning\n\
             and using idiomatic expressions of the target language."
        }
    };

    format!(
        "{}\n\nTranslate the following text from {} to {}. Reply with the translation only.\n\n{}",
        guidance, source, target, call.text
    )
}
