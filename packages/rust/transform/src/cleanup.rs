//! Text cleanup passes applied by the stage transforms.
//!
//! Each pass is a function `&str -> String` applied in sequence, so every
//! step can be tested on its own.

use std::sync::LazyLock;

use regex::Regex;

/// RAW → CLEANED: remove markup and normalize whitespace.
pub(crate) fn clean_pipeline(text: &str) -> String {
    let mut result = strip_script_blocks(text);

    result = strip_tags(&result);
    result = decode_entities(&result);
    result = strip_control_chars(&result);
    result = collapse_whitespace(&result);

    result
}

/// CLEANED → CURATED: final normalization for retrieval.
pub(crate) fn curate_pipeline(text: &str) -> String {
    let mut result = text.to_lowercase();

    result = replace_disallowed_chars(&result);
    result = collapse_whitespace(&result);

    result
}

// ---------------------------------------------------------------------------
// Pass 1: Drop script/style/noscript blocks including their content
// ---------------------------------------------------------------------------

fn strip_script_blocks(text: &str) -> String {
    static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?is)<script\b[^>]*>.*?</script>|<style\b[^>]*>.*?</style>|<noscript\b[^>]*>.*?</noscript>")
            .expect("valid regex")
    });

    BLOCK_RE.replace_all(text, " ").to_string()
}

// ---------------------------------------------------------------------------
// Pass 2: Strip remaining tags and comments (keep inner text)
// ---------------------------------------------------------------------------

fn strip_tags(text: &str) -> String {
    static COMMENT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
    static TAG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"</?[a-zA-Z][^<>]*>").expect("valid regex"));

    let without_comments = COMMENT_RE.replace_all(text, " ");
    // Tags become spaces so adjacent block elements don't glue words together.
    TAG_RE.replace_all(&without_comments, " ").to_string()
}

// ---------------------------------------------------------------------------
// Pass 3: Decode the handful of entities scrapers leave behind
// ---------------------------------------------------------------------------

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    // &amp; last, so "&amp;lt;" decodes to "&lt;" and not "<".
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

// ---------------------------------------------------------------------------
// Pass 4: Remove control characters
// ---------------------------------------------------------------------------

fn strip_control_chars(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() && !c.is_whitespace() { ' ' } else { c })
        .collect()
}

// ---------------------------------------------------------------------------
// Pass 5: Collapse whitespace
// ---------------------------------------------------------------------------

/// Collapse every whitespace run to one space and trim the ends.
pub(crate) fn collapse_whitespace(text: &str) -> String {
    static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

    WS_RE.replace_all(text, " ").trim().to_string()
}

// ---------------------------------------------------------------------------
// Curated pass: keep words, digits, whitespace and basic punctuation
// ---------------------------------------------------------------------------

fn replace_disallowed_chars(text: &str) -> String {
    static DISALLOWED_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^\w\s.,!?;:\-()]").expect("valid regex"));

    DISALLOWED_RE.replace_all(text, " ").to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
