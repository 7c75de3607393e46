//! Translation work items and their results.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;

/// Scheduling class. Interactive work always precedes batch work in the admission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Interactive,
    Batch,
}

impl Priority {
    pub(crate) fn rank(self) -> u8 {
        match self {
            Priority::Interactive => 1,
            Priority::Batch => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub fn of(text: &str) -> Self {
        match text.chars().count() {
            0..=999 => SizeClass::Small,
            1_000..=9_999 => SizeClass::Medium,
            _ => SizeClass::Large,
        }
    }
}

/// Classification hint that changes how providers are prompted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TextType {
    #[default]
    General,
    Technical,
    Academic,
}

static TECHNICAL_INDICATORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\b(algorithm|function|variable|equation|formula)s?\b",
        r"(?i)\b(api|http|json|xml|sql)\b",
        r"(?i)\b(server|database|network|protocol)s?\b",
        r"\s[=+*/]\s|\b\d+\.\d+\b",
        r"(?i)\b(fig\.|table|figure)\s+\d+",
    ])
});

static ACADEMIC_INDICATORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\b(research|study|analysis|methodology)\b",
        r"(?i)\b(hypothesis|conclusion|abstract|bibliography)\b",
        r"(?i)\bet al\.|\bibid\.|\bop\. cit\.",
        r"\[\d+\]|\(\d{4}\)",
        r"(?i)\b(p|pp|vol|no)\.\s*\d+",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

impl TextType {
    /// Scores the text against indicator patterns; more than two hits are needed to leave `General`.
    pub fn detect(text: &str) -> Self {
        let score = |patterns: &[Regex]| patterns.iter().filter(|re| re.is_match(text)).count();
        let technical = score(&TECHNICAL_INDICATORS);
        let academic = score(&ACADEMIC_INDICATORS);

        if technical > academic && technical > 2 {
            TextType::Technical
        } else if academic > 2 {
            TextType::Academic
        } else {
            TextType::General
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TextType::General => "general",
            TextType::Technical => "technical",
            TextType::Academic => "academic",
        }
    }
}

impl fmt::Display for TextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated unit of translation work. Immutable once built.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    id: Uuid,
    fingerprint: Fingerprint,
    payload: String,
    source_lang: String,
    target_lang: String,
    text_type: TextType,
    priority: Priority,
    submitted_by: String,
    source_ip: Option<IpAddr>,
    size_class: SizeClass,
}

impl TranslationRequest {
    pub fn new(
        payload: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
        submitted_by: impl Into<String>,
    ) -> Self {
        let payload = payload.into();
        let source_lang = source_lang.into();
        let target_lang = target_lang.into();
        let text_type = TextType::detect(&payload);
        let fingerprint = Fingerprint::compute(&payload, &source_lang, &target_lang, text_type);
        let size_class = SizeClass::of(&payload);

        Self {
            id: Uuid::new_v4(),
            fingerprint,
            payload,
            source_lang,
            target_lang,
            text_type,
            priority: Priority::default(),
            submitted_by: submitted_by.into(),
            source_ip: None,
            size_class,
        }
    }

    /// Overrides the detected text type; the fingerprint follows.
    pub fn with_text_type(mut self, text_type: TextType) -> Self {
        self.text_type = text_type;
        self.fingerprint =
            Fingerprint::compute(&self.payload, &self.source_lang, &self.target_lang, text_type);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.source_ip = ip;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn source_lang(&self) -> &str {
        &self.source_lang
    }

    pub fn target_lang(&self) -> &str {
        &self.target_lang
    }

    pub fn text_type(&self) -> TextType {
        self.text_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn submitted_by(&self) -> &str {
        &self.submitted_by
    }

    pub fn source_ip(&self) -> Option<IpAddr> {
        self.source_ip
    }

    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }
}

/// A translated text and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub text: String,
    pub provider: String,
    pub text_type: TextType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Cache,
    Provider,
}

/// Successful pipeline outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dispatched {
    pub fingerprint: Fingerprint,
    pub translation: Translation,
    pub source: ResultSource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_boundaries() {
        assert_eq!(SizeClass::of("hello"), SizeClass::Small);
        assert_eq!(SizeClass::of(&"a".repeat(1_000)), SizeClass::Medium);
        assert_eq!(SizeClass::of(&"a".repeat(10_000)), SizeClass::Large);
    }

    #[test]
    fn test_detects_technical_text() {
        let text = "The server exposes a JSON API over HTTP; the algorithm runs in 2.5 seconds.";
        assert_eq!(TextType::detect(text), TextType::Technical);
    }

    #[test]
    fn test_detects_academic_text() {
        let text = "This study extends prior research (2019) by Smith et al. and the hypothesis in [3].";
        assert_eq!(TextType::detect(text), TextType::Academic);
    }

    #[test]
    fn test_plain_text_is_general() {
        assert_eq!(TextType::detect("Good morning, how are you today?"), TextType::General);
    }

    #[test]
    fn test_text_type_override_changes_fingerprint() {
        let request = TranslationRequest::new("Good morning", "en", "ar", "42");
        let original = request.fingerprint().clone();
        let academic = request.with_text_type(TextType::Academic);
        assert_ne!(&original, academic.fingerprint());
        assert_eq!(academic.text_type(), TextType::Academic);
    }

    #[test]
    fn test_interactive_outranks_batch() {
        assert!(Priority::Interactive.rank() > Priority::Batch.rank());
    }
}
