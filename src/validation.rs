use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::LazyLock;
use tracing::warn;
use validator::Validate;

use crate::error::DispatchError;
use crate::fingerprint::normalize_lang;
use crate::request::{Priority, SizeClass, TextType, TranslationRequest};

/// A text message as delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IncomingMessage {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[serde(default)]
    pub source_ip: Option<IpAddr>,
    pub text: String,
    #[serde(default = "auto_detect")]
    #[validate(length(min = 2, max = 8))]
    pub source_lang: String,
    #[validate(length(min = 2, max = 8))]
    pub target_lang: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub text_type: Option<TextType>,
}

/// Segments extracted from one uploaded document.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DocumentMessage {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[serde(default)]
    pub source_ip: Option<IpAddr>,
    #[validate(length(min = 1, max = 2_000))]
    pub segments: Vec<String>,
    #[serde(default = "auto_detect")]
    #[validate(length(min = 2, max = 8))]
    pub source_lang: String,
    #[validate(length(min = 2, max = 8))]
    pub target_lang: String,
    #[serde(default)]
    pub text_type: Option<TextType>,
}

fn auto_detect() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_text_chars: usize,
    pub supported_languages: Vec<String>,
    pub reject_suspicious: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_text_chars: 100_000,
            supported_languages: ["auto", "en", "ar", "fr", "de", "es", "it", "pt", "ru", "zh", "ja", "ko", "tr"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            reject_suspicious: true,
        }
    }
}

static SUSPICIOUS: LazyLock<Option<RegexSet>> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)<script",
        r"(?i)javascript:",
        r"(?i)data:text/html",
        r"(?i)eval\(",
        r"(?i)document\.cookie",
        r"\.\./",
        r"(?i)file://",
    ])
    .ok()
});

/// Turns transport messages into immutable translation requests.
///
/// Everything here runs before any rate-limit token is spent.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    config: ValidationConfig,
}

impl RequestValidator {
    pub fn new(config: ValidationConfig) -> Self {
        let config = ValidationConfig {
            supported_languages: config
                .supported_languages
                .iter()
                .map(|l| normalize_lang(l))
                .collect(),
            ..config
        };
        Self { config }
    }

    pub fn build(&self, message: IncomingMessage) -> Result<TranslationRequest, DispatchError> {
        message.validate().map_err(|e| invalid(e.to_string()))?;
        Self::validate_user_id(&message.user_id)?;
        let (source_lang, target_lang) = self.validate_languages(&message.source_lang, &message.target_lang)?;
        self.validate_text(&message.user_id, &message.text)?;

        let size_class = SizeClass::of(&message.text);
        let priority = message.priority.unwrap_or(match size_class {
            SizeClass::Large => Priority::Batch,
            _ => Priority::Interactive,
        });

        let mut request = TranslationRequest::new(message.text, source_lang, target_lang, message.user_id)
            .with_priority(priority)
            .with_source_ip(message.source_ip);
        if let Some(text_type) = message.text_type {
            request = request.with_text_type(text_type);
        }
        Ok(request)
    }

    /// One request per segment, in input order. Blank segments map to `None`.
    pub fn build_segments(
        &self,
        document: DocumentMessage,
    ) -> Result<Vec<Option<TranslationRequest>>, DispatchError> {
        document.validate().map_err(|e| invalid(e.to_string()))?;
        Self::validate_user_id(&document.user_id)?;
        let (source_lang, target_lang) = self.validate_languages(&document.source_lang, &document.target_lang)?;

        if document.segments.iter().all(|s| s.trim().is_empty()) {
            return Err(invalid("document has no text to translate"));
        }
        for segment in document.segments.iter().filter(|s| !s.trim().is_empty()) {
            self.validate_text(&document.user_id, segment)?;
        }

        let DocumentMessage {
            user_id,
            source_ip,
            segments,
            text_type,
            ..
        } = document;

        Ok(segments
            .into_iter()
            .map(|segment| {
                if segment.trim().is_empty() {
                    return None;
                }
                let mut request = TranslationRequest::new(segment, source_lang.as_str(), target_lang.as_str(), user_id.as_str())
                    .with_priority(Priority::Batch)
                    .with_source_ip(source_ip);
                if let Some(text_type) = text_type {
                    request = request.with_text_type(text_type);
                }
                Some(request)
            })
            .collect())
    }

    pub fn validate_user_id(user_id: &str) -> Result<(), DispatchError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(invalid("user id cannot be empty"));
        }
        if !user_id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '@' || c == '.')
        {
            return Err(invalid("user id contains invalid characters"));
        }
        Ok(())
    }

    fn validate_languages(&self, source: &str, target: &str) -> Result<(String, String), DispatchError> {
        let source = normalize_lang(source);
        let target = normalize_lang(target);

        for lang in [&source, &target] {
            if !self.config.supported_languages.contains(lang) {
                return Err(invalid(format!("unsupported language '{}'", lang)));
            }
        }
        if target == "auto" {
            return Err(invalid("target language must be explicit"));
        }
        if source == target {
            return Err(invalid("source and target languages are identical"));
        }
        Ok((source, target))
    }

    fn validate_text(&self, user_id: &str, text: &str) -> Result<(), DispatchError> {
        if text.trim().is_empty() {
            return Err(invalid("text cannot be empty"));
        }
        let chars = text.chars().count();
        if chars > self.config.max_text_chars {
            return Err(invalid(format!(
                "text too long: {} characters (maximum {})",
                chars, self.config.max_text_chars
            )));
        }
        if self.config.reject_suspicious {
            if let Some(patterns) = SUSPICIOUS.as_ref() {
                if patterns.is_match(text) {
                    warn!(user_id = %user_id, chars, "Rejected text with suspicious content");
                    return Err(invalid("text contains suspicious content"));
                }
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> DispatchError {
    DispatchError::Validation(message.into())
}
