//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    ClassificationRecord, ClassificationStats, Cursor, Database, NewMessage, ProcessedStatus,
    RelevantMessage, RunStatus, SourceMessageStats, StoredMessage,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

const CURSOR_COLUMNS: &str = "source_id, chat_id, last_message_id, last_message_date, last_run_at, last_run_status, last_error";

const MESSAGE_COLUMNS: &str = "m.id, m.source_id, m.chat_id, m.message_id, m.date, m.sender_id, m.text, m.permalink, m.raw_payload, m.ingested_at, m.processed_status, m.is_relevant, m.relevance_score, m.classified_at";

const CLASSIFICATION_COLUMNS: &str = "c.source_id, c.chat_id, c.message_id, c.classifier_version, c.is_relevant, c.score, c.reasons, c.metadata, c.classified_at";

fn row_to_cursor(row: &libsql::Row) -> Result<Cursor, libsql::Error> {
    let last_run_at: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(Cursor {
        source_id: row.get(0)?,
        chat_id: row.get(1)?,
        last_message_id: row.get(2)?,
        last_message_date: parse_optional_datetime(row.get(3).ok()),
        last_run_at: parse_datetime(&last_run_at),
        last_run_status: RunStatus::from_db(&status),
        last_error: row.get(6).ok(),
    })
}

/// Map the first 14 columns (`MESSAGE_COLUMNS`) of a row to a StoredMessage.
fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, libsql::Error> {
    let ingested_at: String = row.get(9)?;
    let status: String = row.get(10)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        source_id: row.get(1)?,
        chat_id: row.get(2)?,
        message_id: row.get(3)?,
        date: parse_optional_datetime(row.get(4).ok()),
        sender_id: row.get(5).ok(),
        text: row.get(6)?,
        permalink: row.get(7).ok(),
        raw_payload: row.get(8).ok(),
        ingested_at: parse_datetime(&ingested_at),
        processed_status: ProcessedStatus::from_db(&status),
        is_relevant: row.get::<i64>(11).ok().map(|v| v != 0),
        relevance_score: row.get(12).ok(),
        classified_at: parse_optional_datetime(row.get(13).ok()),
    })
}

/// Map `CLASSIFICATION_COLUMNS` starting at column `offset`.
fn row_to_classification(
    row: &libsql::Row,
    offset: i32,
) -> Result<ClassificationRecord, libsql::Error> {
    let reasons: String = row.get(offset + 6)?;
    let metadata: String = row.get(offset + 7)?;
    let classified_at: String = row.get(offset + 8)?;
    Ok(ClassificationRecord {
        source_id: row.get(offset)?,
        chat_id: row.get(offset + 1)?,
        message_id: row.get(offset + 2)?,
        classifier_version: row.get(offset + 3)?,
        is_relevant: row.get::<i64>(offset + 4)? != 0,
        score: row.get(offset + 5)?,
        reasons: serde_json::from_str(&reasons).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        classified_at: parse_datetime(&classified_at),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Cursors ─────────────────────────────────────────────────────

    async fn get_cursor(&self, source_id: &str) -> Result<Option<Cursor>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CURSOR_COLUMNS} FROM ingestion_cursors WHERE source_id = ?1"),
                params![source_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_cursor: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let cursor = row_to_cursor(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(cursor))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_cursor: {e}"))),
        }
    }

    async fn upsert_cursor(&self, cursor: &Cursor) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO ingestion_cursors (source_id, chat_id, last_message_id,
                    last_message_date, last_run_at, last_run_status, last_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(source_id) DO UPDATE SET
                    chat_id = excluded.chat_id,
                    last_message_date = CASE
                        WHEN excluded.last_message_id > ingestion_cursors.last_message_id
                        THEN excluded.last_message_date
                        ELSE COALESCE(ingestion_cursors.last_message_date, excluded.last_message_date)
                    END,
                    last_message_id = MAX(ingestion_cursors.last_message_id, excluded.last_message_id),
                    last_run_at = excluded.last_run_at,
                    last_run_status = excluded.last_run_status,
                    last_error = excluded.last_error",
                params![
                    cursor.source_id.as_str(),
                    cursor.chat_id,
                    cursor.last_message_id,
                    opt_datetime(cursor.last_message_date),
                    cursor.last_run_at.to_rfc3339(),
                    cursor.last_run_status.as_str(),
                    opt_text(cursor.last_error.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_cursor: {e}")))?;

        debug!(
            source_id = %cursor.source_id,
            last_message_id = cursor.last_message_id,
            status = %cursor.last_run_status,
            "Cursor upserted"
        );
        Ok(())
    }

    async fn list_cursors(&self) -> Result<Vec<Cursor>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CURSOR_COLUMNS} FROM ingestion_cursors ORDER BY source_id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_cursors: {e}")))?;

        let mut cursors = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_cursor(&row) {
                Ok(cursor) => cursors.push(cursor),
                Err(e) => warn!("Skipping cursor row: {e}"),
            }
        }
        Ok(cursors)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message_if_new(&self, message: &NewMessage) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO messages (source_id, chat_id, message_id, date, sender_id, text,
                    permalink, raw_payload, ingested_at, processed_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending')
                 ON CONFLICT(source_id, message_id) DO NOTHING",
                params![
                    message.source_id.as_str(),
                    message.chat_id,
                    message.message_id,
                    opt_datetime(message.date),
                    opt_int(message.sender_id),
                    message.text.as_str(),
                    opt_text(message.permalink.as_deref()),
                    opt_text(message.raw_payload.as_deref()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message_if_new: {e}")))?;

        if inserted > 0 {
            debug!(
                source_id = %message.source_id,
                message_id = message.message_id,
                "Message inserted into DB"
            );
        }
        Ok(inserted > 0)
    }

    async fn get_message(
        &self,
        source_id: &str,
        message_id: i64,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m
                     WHERE m.source_id = ?1 AND m.message_id = ?2"
                ),
                params![source_id, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let msg = row_to_message(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(msg))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_message: {e}"))),
        }
    }

    async fn fetch_pending_messages(
        &self,
        limit: usize,
        only_source: Option<&str>,
        reprocess: bool,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let status_filter = if reprocess {
            "1 = 1"
        } else {
            "m.processed_status = 'pending'"
        };
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m
                     WHERE {status_filter} AND (?1 IS NULL OR m.source_id = ?1)
                     ORDER BY m.id ASC
                     LIMIT ?2"
                ),
                params![opt_text(only_source), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_pending_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn fetch_relevant_messages(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<RelevantMessage>, DatabaseError> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS}, {CLASSIFICATION_COLUMNS}
                     FROM messages m
                     LEFT JOIN message_classifications c ON c.id = (
                        SELECT id FROM message_classifications
                        WHERE source_id = m.source_id AND message_id = m.message_id
                        ORDER BY classified_at DESC, id DESC
                        LIMIT 1
                     )
                     WHERE m.is_relevant = 1
                     ORDER BY m.date ASC, m.id ASC
                     LIMIT ?1"
                ),
                params![limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_relevant_messages: {e}")))?;

        let mut relevant = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(message) => relevant.push(RelevantMessage {
                    message,
                    classification: row_to_classification(&row, 14).ok(),
                }),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        Ok(relevant)
    }

    async fn max_message_id(&self, source_id: &str) -> Result<Option<i64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT MAX(message_id) FROM messages WHERE source_id = ?1",
                params![source_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("max_message_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("max_message_id: {e}"))),
        }
    }

    async fn message_stats_by_source(&self) -> Result<Vec<SourceMessageStats>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT source_id,
                        COUNT(*),
                        COALESCE(SUM(CASE WHEN processed_status = 'pending' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN is_relevant = 1 THEN 1 ELSE 0 END), 0),
                        MAX(message_id)
                 FROM messages
                 GROUP BY source_id
                 ORDER BY source_id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("message_stats_by_source: {e}")))?;

        let mut stats = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let parsed = (|| -> Result<SourceMessageStats, libsql::Error> {
                Ok(SourceMessageStats {
                    source_id: row.get(0)?,
                    total: row.get(1)?,
                    pending: row.get(2)?,
                    relevant: row.get(3)?,
                    max_message_id: row.get(4)?,
                })
            })();
            match parsed {
                Ok(s) => stats.push(s),
                Err(e) => warn!("Skipping stats row: {e}"),
            }
        }
        Ok(stats)
    }

    // ── Classifications ─────────────────────────────────────────────

    async fn upsert_classification(
        &self,
        record: &ClassificationRecord,
    ) -> Result<(), DatabaseError> {
        let reasons = serde_json::to_string(&record.reasons)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO message_classifications (source_id, chat_id, message_id,
                    classifier_version, is_relevant, score, reasons, metadata, classified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(source_id, message_id, classifier_version) DO UPDATE SET
                    chat_id = excluded.chat_id,
                    is_relevant = excluded.is_relevant,
                    score = excluded.score,
                    reasons = excluded.reasons,
                    metadata = excluded.metadata,
                    classified_at = excluded.classified_at",
                params![
                    record.source_id.as_str(),
                    record.chat_id,
                    record.message_id,
                    record.classifier_version.as_str(),
                    record.is_relevant as i64,
                    record.score,
                    reasons,
                    metadata,
                    record.classified_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_classification: {e}")))?;
        Ok(())
    }

    async fn mark_message_classified(
        &self,
        source_id: &str,
        message_id: i64,
        is_relevant: bool,
        score: f64,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE messages
                 SET processed_status = 'classified', is_relevant = ?1,
                     relevance_score = ?2, classified_at = ?3
                 WHERE source_id = ?4 AND message_id = ?5",
                params![
                    is_relevant as i64,
                    score,
                    Utc::now().to_rfc3339(),
                    source_id,
                    message_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_message_classified: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "message".into(),
                id: format!("{source_id}:{message_id}"),
            });
        }
        Ok(())
    }

    async fn list_classifications(
        &self,
        source_id: &str,
        message_id: i64,
    ) -> Result<Vec<ClassificationRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CLASSIFICATION_COLUMNS} FROM message_classifications c
                     WHERE c.source_id = ?1 AND c.message_id = ?2
                     ORDER BY c.id ASC"
                ),
                params![source_id, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_classifications: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_classification(&row, 0) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping classification row: {e}"),
            }
        }
        Ok(records)
    }

    async fn classification_stats(&self) -> Result<ClassificationStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN processed_status = 'pending' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN processed_status = 'classified' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN is_relevant = 1 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN is_relevant = 0 THEN 1 ELSE 0 END), 0),
                        AVG(relevance_score)
                 FROM messages",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("classification_stats: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(ClassificationStats::default()),
            Err(e) => return Err(DatabaseError::Query(format!("classification_stats: {e}"))),
        };
        let count = |idx: i32| -> Result<i64, DatabaseError> {
            row.get(idx)
                .map_err(|e| DatabaseError::Query(format!("classification_stats: {e}")))
        };
        Ok(ClassificationStats {
            total: count(0)?,
            pending: count(1)?,
            classified: count(2)?,
            relevant: count(3)?,
            not_relevant: count(4)?,
            avg_score: row.get::<f64>(5).ok(),
        })
    }
}
