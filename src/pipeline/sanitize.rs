//! Redaction of one-time codes before message text is persisted.

use std::sync::LazyLock;

use regex::Regex;

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b((?:login|telegram|verification|reset)\s+code|code)(\s*:?\s*)(\d{5,6})\b")
        .expect("code pattern is valid")
});

const REDACTED: &str = "[REDACTED]";

/// Replace 5-6 digit codes that follow a code keyword. Returns the text and
/// whether anything was redacted.
pub fn redact_codes(text: &str) -> (String, bool) {
    if !CODE_PATTERN.is_match(text) {
        return (text.to_string(), false);
    }
    let redacted = CODE_PATTERN.replace_all(text, format!("${{1}}${{2}}{REDACTED}").as_str());
    (redacted.into_owned(), true)
}
