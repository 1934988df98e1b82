//! `Database` trait: the single async interface for all persistence.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;

/// Outcome of the last ingestion run for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Some items failed; the watermark stopped below the first failure.
    Partial,
    Failed,
    RateLimited,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::RateLimited => "rate_limited",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "partial" => Self::Partial,
            "rate_limited" => Self::RateLimited,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-source ingestion watermark.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cursor {
    pub source_id: String,
    pub chat_id: i64,
    pub last_message_id: i64,
    pub last_message_date: Option<DateTime<Utc>>,
    pub last_run_at: DateTime<Utc>,
    pub last_run_status: RunStatus,
    pub last_error: Option<String>,
}

/// Classification state of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedStatus {
    Pending,
    Classified,
}

impl ProcessedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Classified => "classified",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "classified" => Self::Classified,
            _ => Self::Pending,
        }
    }
}

/// A sanitized message ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub source_id: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub date: Option<DateTime<Utc>>,
    pub sender_id: Option<i64>,
    pub text: String,
    pub permalink: Option<String>,
    pub raw_payload: Option<String>,
}

/// A persisted inbound message.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub source_id: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub date: Option<DateTime<Utc>>,
    pub sender_id: Option<i64>,
    pub text: String,
    pub permalink: Option<String>,
    pub raw_payload: Option<String>,
    pub ingested_at: DateTime<Utc>,
    pub processed_status: ProcessedStatus,
    pub is_relevant: Option<bool>,
    pub relevance_score: Option<f64>,
    pub classified_at: Option<DateTime<Utc>>,
}

/// Audit row for one classifier verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationRecord {
    pub source_id: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub classifier_version: String,
    pub is_relevant: bool,
    pub score: f64,
    pub reasons: Vec<String>,
    pub metadata: serde_json::Value,
    pub classified_at: DateTime<Utc>,
}

/// A relevant message with its most recent classification, if any.
#[derive(Debug, Clone)]
pub struct RelevantMessage {
    pub message: StoredMessage,
    pub classification: Option<ClassificationRecord>,
}

/// Aggregate classification counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClassificationStats {
    pub total: i64,
    pub pending: i64,
    pub classified: i64,
    pub relevant: i64,
    pub not_relevant: i64,
    pub avg_score: Option<f64>,
}

/// Message counts for one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceMessageStats {
    pub source_id: String,
    pub total: i64,
    pub pending: i64,
    pub relevant: i64,
    pub max_message_id: i64,
}

/// Backend-agnostic database trait covering cursors, messages and classifications.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Cursors ─────────────────────────────────────────────────────

    async fn get_cursor(&self, source_id: &str) -> Result<Option<Cursor>, DatabaseError>;

    /// Upsert by `source_id`. The stored watermark never moves backwards.
    async fn upsert_cursor(&self, cursor: &Cursor) -> Result<(), DatabaseError>;

    /// All cursors, ordered by source id.
    async fn list_cursors(&self) -> Result<Vec<Cursor>, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Idempotent insert. Returns `false` if `(source_id, message_id)` already exists.
    async fn insert_message_if_new(&self, message: &NewMessage) -> Result<bool, DatabaseError>;

    async fn get_message(
        &self,
        source_id: &str,
        message_id: i64,
    ) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Messages awaiting classification (or all of them when `reprocess`), oldest first.
    async fn fetch_pending_messages(
        &self,
        limit: usize,
        only_source: Option<&str>,
        reprocess: bool,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Messages flagged relevant, oldest first, with their latest classification.
    async fn fetch_relevant_messages(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<RelevantMessage>, DatabaseError>;

    /// Highest stored message id for a source.
    async fn max_message_id(&self, source_id: &str) -> Result<Option<i64>, DatabaseError>;

    async fn message_stats_by_source(&self) -> Result<Vec<SourceMessageStats>, DatabaseError>;

    // ── Classifications ─────────────────────────────────────────────

    /// Insert or overwrite the row for `(source_id, message_id, classifier_version)`.
    async fn upsert_classification(
        &self,
        record: &ClassificationRecord,
    ) -> Result<(), DatabaseError>;

    /// Denormalize a verdict onto the message row.
    async fn mark_message_classified(
        &self,
        source_id: &str,
        message_id: i64,
        is_relevant: bool,
        score: f64,
    ) -> Result<(), DatabaseError>;

    async fn list_classifications(
        &self,
        source_id: &str,
        message_id: i64,
    ) -> Result<Vec<ClassificationRecord>, DatabaseError>;

    async fn classification_stats(&self) -> Result<ClassificationStats, DatabaseError>;
}
