//! Outbox entry types and the status state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an application email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Draft,
    Pending,
    Sent,
    Failed,
    Skipped,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Sent, failed and skipped accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Skipped)
    }

    pub fn can_transition_to(self, next: OutboxStatus) -> bool {
        match self {
            Self::Draft => matches!(
                next,
                Self::Pending | Self::Sent | Self::Failed | Self::Skipped
            ),
            Self::Pending => matches!(next, Self::Sent | Self::Failed | Self::Skipped),
            Self::Sent | Self::Failed | Self::Skipped => false,
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an entry was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoMatch,
    TieClose,
    NoEmailFound,
    MultipleEmailsAmbiguous,
    Duplicate,
    SecurityGate,
    InvalidEmailIndex,
    InvalidTemplateIndex,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoMatch => "no_match",
            Self::TieClose => "tie_close",
            Self::NoEmailFound => "no_email_found",
            Self::MultipleEmailsAmbiguous => "multiple_emails_ambiguous",
            Self::Duplicate => "duplicate",
            Self::SecurityGate => "security_gate",
            Self::InvalidEmailIndex => "invalid_email_index",
            Self::InvalidTemplateIndex => "invalid_template_index",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One version of an outbox row. The ledger holds many versions per `outbox_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub outbox_id: Uuid,
    pub profile_id: Option<String>,
    pub source_id: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub permalink: Option<String>,
    pub job_title: String,
    #[serde(default)]
    pub extracted_emails: Vec<String>,
    pub selected_email: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub cv_path: Option<PathBuf>,
    pub status: OutboxStatus,
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub routing_scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub routing_metadata: serde_json::Value,
    pub skip_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub transport_response: Option<String>,
    #[serde(default)]
    pub attempt_count: u32,
}

/// Fields supplied when creating an entry; the ledger derives status and dedupe key.
#[derive(Debug, Clone, Default)]
pub struct NewOutboxEntry {
    pub profile_id: Option<String>,
    pub source_id: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub permalink: Option<String>,
    pub job_title: String,
    pub extracted_emails: Vec<String>,
    pub selected_email: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub cv_path: Option<PathBuf>,
    pub routing_scores: BTreeMap<String, f64>,
    pub routing_metadata: serde_json::Value,
    pub skip_reason: Option<SkipReason>,
}

/// A status change plus the audit fields that go with it.
#[derive(Debug, Clone)]
pub struct EntryUpdate {
    pub status: OutboxStatus,
    pub skip_reason: Option<SkipReason>,
    pub last_error: Option<String>,
    pub transport_response: Option<String>,
}

impl EntryUpdate {
    pub fn status(status: OutboxStatus) -> Self {
        Self {
            status,
            skip_reason: None,
            last_error: None,
            transport_response: None,
        }
    }

    pub fn skipped(reason: SkipReason, last_error: Option<String>) -> Self {
        Self {
            status: OutboxStatus::Skipped,
            skip_reason: Some(reason),
            last_error,
            transport_response: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.transport_response = Some(response.into());
        self
    }
}

/// Dedupe key for an (chat, message, recipient) triple.
pub fn dedupe_key(chat_id: i64, message_id: i64, email: &str) -> String {
    format!("{chat_id}:{message_id}:{}", email.to_lowercase())
}

/// Counts over the latest version of every entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutboxStats {
    pub total: usize,
    pub draft: usize,
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub by_skip_reason: BTreeMap<String, usize>,
}

impl OutboxStats {
    pub(crate) fn record(&mut self, entry: &OutboxEntry) {
        self.total += 1;
        match entry.status {
            OutboxStatus::Draft => self.draft += 1,
            OutboxStatus::Pending => self.pending += 1,
            OutboxStatus::Sent => self.sent += 1,
            OutboxStatus::Failed => self.failed += 1,
            OutboxStatus::Skipped => self.skipped += 1,
        }
        if let Some(reason) = &entry.skip_reason {
            *self.by_skip_reason.entry(reason.clone()).or_default() += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_can_move_anywhere_but_back() {
        let draft = OutboxStatus::Draft;
        assert!(draft.can_transition_to(OutboxStatus::Pending));
        assert!(draft.can_transition_to(OutboxStatus::Sent));
        assert!(draft.can_transition_to(OutboxStatus::Failed));
        assert!(draft.can_transition_to(OutboxStatus::Skipped));
        assert!(!draft.can_transition_to(OutboxStatus::Draft));
    }

    #[test]
    fn pending_cannot_return_to_draft() {
        let pending = OutboxStatus::Pending;
        assert!(!pending.can_transition_to(OutboxStatus::Draft));
        assert!(!pending.can_transition_to(OutboxStatus::Pending));
        assert!(pending.can_transition_to(OutboxStatus::Sent));
    }

    #[test]
    fn terminal_states_are_final() {
        for status in [OutboxStatus::Sent, OutboxStatus::Failed, OutboxStatus::Skipped] {
            assert!(status.is_terminal());
            for next in [
                OutboxStatus::Draft,
                OutboxStatus::Pending,
                OutboxStatus::Sent,
                OutboxStatus::Failed,
                OutboxStatus::Skipped,
            ] {
                assert!(!status.can_transition_to(next), "{status} -> {next}");
            }
        }
    }

    #[test]
    fn skip_reason_serializes_as_snake_case() {
        let json = serde_json::to_string(&SkipReason::MultipleEmailsAmbiguous).unwrap();
        assert_eq!(json, "\"multiple_emails_ambiguous\"");
        assert_eq!(SkipReason::SecurityGate.as_str(), "security_gate");
    }

    #[test]
    fn dedupe_key_ignores_email_case() {
        assert_eq!(
            dedupe_key(-1001, 42, "Jobs@Example.com"),
            "-1001:42:jobs@example.com"
        );
    }
}
