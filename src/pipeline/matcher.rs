//! Case-insensitive, word-boundary phrase matching shared by classification and routing.
//!
//! A phrase matches when it occurs in the normalized text and is not adjacent
//! to a word character on either side, so "go" never matches inside "going"
//! and "c++" matches in "C++ developer".

/// Lowercase and collapse whitespace runs to single spaces.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whether `phrase` occurs in `haystack` on word boundaries. Both must already be normalized.
pub fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    if phrase.is_empty() {
        return false;
    }
    haystack.match_indices(phrase).any(|(start, _)| {
        let end = start + phrase.len();
        let clear_before = haystack[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !is_word_char(c));
        let clear_after = haystack[end..].chars().next().is_none_or(|c| !is_word_char(c));
        clear_before && clear_after
    })
}

/// Distinct phrases from `phrases` found in `haystack`, in list order.
pub fn matched_phrases<'a>(haystack: &str, phrases: &'a [String]) -> Vec<&'a str> {
    phrases
        .iter()
        .filter(|p| contains_phrase(haystack, p))
        .map(String::as_str)
        .collect()
}

/// Normalize a keyword list, dropping blanks and duplicates while keeping first-seen order.
pub fn normalize_phrases<I, S>(phrases: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for phrase in phrases {
        let phrase = normalize(phrase.as_ref());
        if !phrase.is_empty() && !out.contains(&phrase) {
            out.push(phrase);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_substring_leakage() {
        let text = normalize("We are going places");
        assert!(!contains_phrase(&text, "go"));
        assert!(contains_phrase(&normalize("Go developer"), "go"));
    }

    #[test]
    fn punctuation_edges_are_boundaries() {
        let text = normalize("Senior C++ / .NET engineer (Node.js)");
        assert!(contains_phrase(&text, "c++"));
        assert!(contains_phrase(&text, ".net"));
        assert!(contains_phrase(&text, "node.js"));
        assert!(!contains_phrase(&normalize("asp.net shop"), ".net"));
    }

    #[test]
    fn multi_word_phrases_survive_whitespace_noise() {
        let text = normalize("Looking for a  Full\n Stack dev");
        assert!(contains_phrase(&text, "full stack"));
    }

    #[test]
    fn later_occurrence_can_match_after_rejected_one() {
        let text = normalize("gopher go");
        assert!(contains_phrase(&text, "go"));
    }

    #[test]
    fn normalize_phrases_dedupes_case_insensitively() {
        let phrases = normalize_phrases(["API", "api", " ", "SQL", "Python "]);
        assert_eq!(phrases, vec!["api", "sql", "python"]);
    }

    #[test]
    fn matched_phrases_keep_list_order() {
        let phrases = normalize_phrases(["rust", "python", "java"]);
        let text = normalize("Python and Rust, not JavaScript");
        assert_eq!(matched_phrases(&text, &phrases), vec!["rust", "python"]);
    }
}
