//! Cache identity of a translation request.
//!
//! The digest is blake3 over a versioned, NUL-separated record:
//!
//! ```text
//! "v1" \0 source_lang \0 target_lang \0 text_type \0 normalized_text
//! ```
//!
//! Language codes are trimmed and ASCII-lowercased. Text is trimmed and every
//! run of whitespace collapses to one space; case is kept because it changes
//! translations (names, acronyms). Changing any of this invalidates every
//! cached entry, so bump the version tag when doing so.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::request::TextType;

const FINGERPRINT_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(text: &str, source_lang: &str, target_lang: &str, text_type: TextType) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(FINGERPRINT_VERSION.as_bytes());
        hasher.update(b"\0");
        hasher.update(normalize_lang(source_lang).as_bytes());
        hasher.update(b"\0");
        hasher.update(normalize_lang(target_lang).as_bytes());
        hasher.update(b"\0");
        hasher.update(text_type.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(normalize_text(text).as_bytes());
        Fingerprint(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize_lang(lang: &str) -> String {
    lang.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_is_normalized() {
        let a = Fingerprint::compute("Hello   world\n", "en", "ar", TextType::General);
        let b = Fingerprint::compute("  Hello world", "en", "ar", TextType::General);
        assert_eq!(a, b);
    }

    #[test]
    fn test_language_codes_are_case_insensitive() {
        let a = Fingerprint::compute("Hello", "EN", " Ar ", TextType::General);
        let b = Fingerprint::compute("Hello", "en", "ar", TextType::General);
        assert_eq!(a, b);
    }

    #[test]
    fn test_text_case_is_significant() {
        let a = Fingerprint::compute("Apple", "en", "ar", TextType::General);
        let b = Fingerprint::compute("apple", "en", "ar", TextType::General);
        assert_ne!(a, b);
    }

    #[test]
    fn test_language_pair_and_type_participate() {
        let base = Fingerprint::compute("Hello", "en", "ar", TextType::General);
        assert_ne!(base, Fingerprint::compute("Hello", "en", "fr", TextType::General));
        assert_ne!(base, Fingerprint::compute("Hello", "ar", "en", TextType::General));
        assert_ne!(base, Fingerprint::compute("Hello", "en", "ar", TextType::Technical));
    }

    #[test]
    fn test_field_boundaries_do_not_collide() {
        let a = Fingerprint::compute("x", "en", "ar", TextType::General);
        let b = Fingerprint::compute("x", "e", "nar", TextType::General);
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let fp = Fingerprint::compute("Hello", "en", "ar", TextType::General);
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, Fingerprint::compute("Hello", "en", "ar", TextType::General));
        assert_eq!(fp.short().len(), 12);
    }
}
