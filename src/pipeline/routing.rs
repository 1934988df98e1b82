//! Profile routing and recipient extraction.
//!
//! Routing picks at most one applicant profile for a message. Ambiguity is
//! never resolved by guessing: close scores and multiple addresses are skips.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::config::ApplicantProfile;
use crate::error::ValidationError;
use crate::outbox::SkipReason;
use crate::pipeline::matcher::{matched_phrases, normalize, normalize_phrases};

const POSITIVE_WEIGHT: f64 = 1.0;
const NEGATIVE_WEIGHT: f64 = -1.5;

/// Minimum lead the top candidate needs over the runner-up.
pub const TIE_MARGIN: f64 = 0.1;

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
        .expect("email pattern is valid")
});

/// Explanation attached to every routing decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingMetadata {
    /// `no_profile_above_threshold`, `single_match`, `scores_too_close` or `clear_winner`.
    pub decision: &'static str,
    /// Candidates at or above their threshold, best first.
    pub matched_profiles: Vec<String>,
    /// Lead of the best candidate over the runner-up, when there are two or more.
    pub margin: Option<f64>,
    pub matched_keywords: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub profile_id: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub scores: BTreeMap<String, f64>,
    pub metadata: RoutingMetadata,
}

/// Score one profile against already-normalized text.
fn score_profile(haystack: &str, profile: &ApplicantProfile) -> (f64, Vec<String>) {
    let positive = normalize_phrases(&profile.keywords_positive);
    let negative = normalize_phrases(&profile.keywords_negative);
    let pos_hits = matched_phrases(haystack, &positive);
    let neg_hits = matched_phrases(haystack, &negative);

    let score = POSITIVE_WEIGHT * pos_hits.len() as f64 + NEGATIVE_WEIGHT * neg_hits.len() as f64;
    let keywords = pos_hits.into_iter().map(String::from).collect();
    (score, keywords)
}

/// Route `text` to at most one profile.
pub fn route(text: &str, profiles: &BTreeMap<String, ApplicantProfile>) -> RoutingDecision {
    let haystack = normalize(text);
    let mut scores = BTreeMap::new();
    let mut matched_keywords = BTreeMap::new();
    let mut candidates = Vec::new();

    for (id, profile) in profiles {
        let (score, keywords) = score_profile(&haystack, profile);
        scores.insert(id.clone(), score);
        if !keywords.is_empty() {
            matched_keywords.insert(id.clone(), keywords);
        }
        if score >= profile.threshold {
            candidates.push((id.clone(), score));
        }
    }

    decide(candidates, scores, matched_keywords)
}

/// Apply the tie rules to scored candidates.
pub fn decide(
    mut candidates: Vec<(String, f64)>,
    scores: BTreeMap<String, f64>,
    matched_keywords: BTreeMap<String, Vec<String>>,
) -> RoutingDecision {
    // Stable sort keeps profile-id order among equal scores.
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    let matched_profiles: Vec<String> = candidates.iter().map(|(id, _)| id.clone()).collect();

    let (profile_id, skip_reason, decision, margin) = match candidates.as_slice() {
        [] => (
            None,
            Some(SkipReason::NoMatch),
            "no_profile_above_threshold",
            None,
        ),
        [(only, _)] => (Some(only.clone()), None, "single_match", None),
        [(best, top), (_, second), ..] => {
            let margin = top - second;
            if margin < TIE_MARGIN {
                (None, Some(SkipReason::TieClose), "scores_too_close", Some(margin))
            } else {
                (Some(best.clone()), None, "clear_winner", Some(margin))
            }
        }
    };

    RoutingDecision {
        profile_id,
        skip_reason,
        scores,
        metadata: RoutingMetadata {
            decision,
            matched_profiles,
            margin,
            matched_keywords,
        },
    }
}

/// Email addresses in `text`, de-duplicated case-insensitively in first-seen order.
pub fn extract_emails(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    EMAIL_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|email| seen.insert(email.to_lowercase()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailSelection {
    Selected(String),
    NoEmail,
    Ambiguous,
}

/// Choose the recipient. A single address is always used; several need `pick`.
pub fn select_email(
    emails: &[String],
    pick: Option<usize>,
) -> Result<EmailSelection, ValidationError> {
    match (emails, pick) {
        ([], _) => Ok(EmailSelection::NoEmail),
        ([only], _) => Ok(EmailSelection::Selected(only.clone())),
        (_, None) => Ok(EmailSelection::Ambiguous),
        (many, Some(index)) => many
            .get(index)
            .cloned()
            .map(EmailSelection::Selected)
            .ok_or(ValidationError::EmailIndexOutOfRange {
                index,
                len: many.len(),
            }),
    }
}
