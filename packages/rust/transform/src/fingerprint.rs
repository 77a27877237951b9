//! Content fingerprints used for duplicate detection.

use std::borrow::Cow;

use lakehouse_shared::FingerprintRules;
use sha2::{Digest, Sha256};

use crate::cleanup::collapse_whitespace;

/// Apply the configured normalization before hashing.
pub fn normalize<'a>(content: &'a str, rules: &FingerprintRules) -> Cow<'a, str> {
    let mut text = Cow::Borrowed(content);

    if rules.collapse_whitespace {
        text = Cow::Owned(collapse_whitespace(&text));
    }
    if !rules.case_sensitive {
        text = Cow::Owned(text.to_lowercase());
    }

    text
}

/// SHA-256 (hex) over the normalized content.
pub fn fingerprint(content: &str, rules: &FingerprintRules) -> String {
    let normalized = normalize(content, rules);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_insensitive_by_default() {
        let rules = FingerprintRules::default();
        assert_eq!(
            fingerprint("alpha  beta\n", &rules),
            fingerprint("alpha beta", &rules)
        );
    }

    #[test]
    fn case_sensitive_by_default() {
        let rules = FingerprintRules::default();
        assert_ne!(fingerprint("Alpha", &rules), fingerprint("alpha", &rules));
    }

    #[test]
    fn case_folding_when_configured() {
        let rules = FingerprintRules {
            case_sensitive: false,
            collapse_whitespace: true,
        };
        assert_eq!(fingerprint("Alpha Beta", &rules), fingerprint("alpha beta", &rules));
    }

    #[test]
    fn exact_mode_keeps_whitespace() {
        let rules = FingerprintRules {
            case_sensitive: true,
            collapse_whitespace: false,
        };
        assert!(matches!(normalize("a  b", &rules), Cow::Borrowed(_)));
        assert_ne!(fingerprint("a  b", &rules), fingerprint("a b", &rules));
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint("content", &FingerprintRules::default());
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
