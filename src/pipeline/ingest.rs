//! Incremental ingestion from chat sources into the message store.
//!
//! Per source, a pass reads the cursor watermark, fetches strictly newer
//! messages, redacts one-time codes and inserts idempotently. The watermark
//! only moves past messages that were handled; a failed insert freezes it so
//! the next run retries from there.
//!
//! Chat updates are acknowledged to the source only after a pass that read
//! every enabled source to the end. Anything less could confirm updates that
//! were never stored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::channels::{ChatSource, EntityHandle, RawMessage};
use crate::config::{SourceConfig, SourcesFile};
use crate::error::{ChannelError, Error, PipelineError};
use crate::pipeline::sanitize::redact_codes;
use crate::store::{Cursor, Database, NewMessage, RunStatus};

pub const DEFAULT_LIMIT_PER_SOURCE: usize = 200;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub only: Option<String>,
    pub limit_per_source: usize,
    pub dry_run: bool,
    /// Ignore validation status and ingest every enabled source.
    pub force: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            only: None,
            limit_per_source: DEFAULT_LIMIT_PER_SOURCE,
            dry_run: false,
            force: false,
        }
    }
}

/// Outcome for one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceIngestResult {
    pub source_id: String,
    pub fetched: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub redacted: usize,
    pub errors: usize,
    pub previous_watermark: i64,
    pub new_watermark: i64,
    /// The fetch returned a full batch; more messages may be waiting.
    pub truncated: bool,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl SourceIngestResult {
    fn new(source_id: &str, watermark: i64) -> Self {
        Self {
            source_id: source_id.to_string(),
            fetched: 0,
            inserted: 0,
            skipped: 0,
            redacted: 0,
            errors: 0,
            previous_watermark: watermark,
            new_watermark: watermark,
            truncated: false,
            status: RunStatus::Success,
            error: None,
        }
    }
}

/// Summary of a whole ingestion pass.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub total_sources: usize,
    pub total_fetched: usize,
    pub total_inserted: usize,
    pub total_skipped: usize,
    pub total_errors: usize,
    pub sources_with_errors: Vec<String>,
    pub rate_limited_retry_after_secs: Option<u64>,
    pub sources: Vec<SourceIngestResult>,
}

impl IngestReport {
    fn new(dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            dry_run,
            total_sources: 0,
            total_fetched: 0,
            total_inserted: 0,
            total_skipped: 0,
            total_errors: 0,
            sources_with_errors: Vec::new(),
            rate_limited_retry_after_secs: None,
            sources: Vec::new(),
        }
    }

    fn add(&mut self, result: SourceIngestResult) {
        self.total_sources += 1;
        self.total_fetched += result.fetched;
        self.total_inserted += result.inserted;
        self.total_skipped += result.skipped;
        self.total_errors += result.errors;
        if result.errors > 0 || result.error.is_some() {
            self.sources_with_errors.push(result.source_id.clone());
        }
        self.sources.push(result);
    }

    /// Whether every source finished cleanly.
    pub fn is_clean(&self) -> bool {
        self.sources_with_errors.is_empty() && self.rate_limited_retry_after_secs.is_none()
    }
}

/// Sources a pass should read, in file order.
pub fn select_sources<'a>(
    file: &'a SourcesFile,
    only: Option<&str>,
    force: bool,
) -> Result<Vec<&'a SourceConfig>, PipelineError> {
    let candidates: Vec<&SourceConfig> = match only {
        Some(id) => vec![file.find(id).ok_or_else(|| PipelineError::UnknownSource {
            source_id: id.to_string(),
        })?],
        None => file.sources.iter().collect(),
    };
    Ok(candidates
        .into_iter()
        .filter(|s| s.enabled && (force || s.validation_status.is_ingestible()))
        .collect())
}

pub struct Ingestor {
    db: Arc<dyn Database>,
    chat: Arc<dyn ChatSource>,
}

impl Ingestor {
    pub fn new(db: Arc<dyn Database>, chat: Arc<dyn ChatSource>) -> Self {
        Self { db, chat }
    }

    /// Ingest every selected source. A rate limit stops the pass; other
    /// per-source failures are recorded and the pass continues.
    pub async fn ingest_all(
        &self,
        sources: &SourcesFile,
        options: &IngestOptions,
    ) -> Result<IngestReport, Error> {
        let selected = select_sources(sources, options.only.as_deref(), options.force)?;
        let covers_every_source =
            options.only.is_none() && selected.len() == sources.enabled().count();
        let mut report = IngestReport::new(options.dry_run);

        info!(
            sources = selected.len(),
            dry_run = options.dry_run,
            "Starting ingestion pass"
        );

        for source in selected {
            match self.ingest_source(source, options).await {
                Ok(result) => report.add(result),
                Err(Error::Pipeline(PipelineError::RateLimited { retry_after, .. })) => {
                    warn!(
                        source = %source.source_id,
                        retry_after_secs = retry_after.as_secs(),
                        "Rate limited, stopping ingestion pass"
                    );
                    let watermark = self.stored_watermark(&source.source_id).await;
                    let mut result = SourceIngestResult::new(&source.source_id, watermark);
                    result.status = RunStatus::RateLimited;
                    result.error = Some(format!("retry after {}s", retry_after.as_secs()));
                    report.add(result);
                    report.rate_limited_retry_after_secs = Some(retry_after.as_secs());
                    break;
                }
                Err(e) => {
                    error!(source = %source.source_id, "Ingestion failed: {e}");
                    let watermark = self.stored_watermark(&source.source_id).await;
                    let mut result = SourceIngestResult::new(&source.source_id, watermark);
                    result.status = RunStatus::Failed;
                    result.error = Some(e.to_string());
                    report.add(result);
                }
            }
        }

        report.finished_at = Utc::now();

        let drained = report.sources.iter().all(|s| !s.truncated);
        if !options.dry_run {
            if report.is_clean() && covers_every_source && drained {
                self.chat.acknowledge().await?;
            } else {
                debug!(
                    clean = report.is_clean(),
                    covers_every_source, drained, "Leaving chat updates unacknowledged"
                );
            }
        }

        info!(
            fetched = report.total_fetched,
            inserted = report.total_inserted,
            skipped = report.total_skipped,
            errors = report.total_errors,
            "Ingestion pass complete"
        );
        Ok(report)
    }

    /// Ingest one source. Returns `PipelineError::RateLimited` after recording
    /// the limit on the cursor; other channel failures land in the result.
    pub async fn ingest_source(
        &self,
        source: &SourceConfig,
        options: &IngestOptions,
    ) -> Result<SourceIngestResult, Error> {
        let cursor = self.db.get_cursor(&source.source_id).await?;
        let watermark = cursor.as_ref().map_or(0, |c| c.last_message_id);
        let mut result = SourceIngestResult::new(&source.source_id, watermark);

        let entity = match self.chat.resolve_entity(source).await {
            Ok(entity) => entity,
            Err(e) => return self.channel_failure(source, cursor, result, e, options).await,
        };

        let mut messages = match self
            .chat
            .fetch_messages_since(&entity, watermark, options.limit_per_source)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                let cursor = cursor.or_else(|| Some(empty_cursor(source, entity.chat_id)));
                return self.channel_failure(source, cursor, result, e, options).await;
            }
        };
        result.truncated = messages.len() >= options.limit_per_source;
        messages.sort_by_key(|m| m.message_id);

        debug!(
            source = %source.source_id,
            watermark,
            fetched = messages.len(),
            "Fetched messages"
        );

        let mut frozen = false;
        let mut last_date = cursor.as_ref().and_then(|c| c.last_message_date);

        for raw in messages.iter().filter(|m| m.message_id > watermark) {
            result.fetched += 1;
            let handled = self
                .handle_message(source, &entity, raw, options.dry_run, &mut result)
                .await;
            if !handled {
                frozen = true;
            }
            if !frozen {
                result.new_watermark = raw.message_id;
                last_date = raw.date.or(last_date);
            }
        }

        result.status = if result.errors > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };

        if !options.dry_run {
            self.db
                .upsert_cursor(&Cursor {
                    source_id: source.source_id.clone(),
                    chat_id: entity.chat_id,
                    last_message_id: result.new_watermark,
                    last_message_date: last_date,
                    last_run_at: Utc::now(),
                    last_run_status: result.status,
                    last_error: (result.errors > 0)
                        .then(|| format!("{} message(s) failed to persist", result.errors)),
                })
                .await?;
        }

        info!(
            source = %source.source_id,
            fetched = result.fetched,
            inserted = result.inserted,
            skipped = result.skipped,
            errors = result.errors,
            watermark = result.new_watermark,
            "Source ingested"
        );
        Ok(result)
    }

    /// Returns false when the message could not be persisted.
    async fn handle_message(
        &self,
        source: &SourceConfig,
        entity: &EntityHandle,
        raw: &RawMessage,
        dry_run: bool,
        result: &mut SourceIngestResult,
    ) -> bool {
        let Some(text) = raw.text.as_deref().filter(|t| !t.trim().is_empty()) else {
            result.skipped += 1;
            return true;
        };

        let (text, redacted) = redact_codes(text);
        if redacted {
            result.redacted += 1;
        }

        if dry_run {
            match self.db.get_message(&source.source_id, raw.message_id).await {
                Ok(Some(_)) => result.skipped += 1,
                Ok(None) => result.inserted += 1,
                Err(e) => {
                    warn!(source = %source.source_id, "Dry-run lookup failed: {e}");
                    result.errors += 1;
                    return false;
                }
            }
            return true;
        }

        let message = NewMessage {
            source_id: source.source_id.clone(),
            chat_id: entity.chat_id,
            message_id: raw.message_id,
            date: raw.date,
            sender_id: raw.sender_id,
            text,
            permalink: entity.permalink(raw.message_id),
            raw_payload: serde_json::to_string(&raw.raw).ok(),
        };

        match self.db.insert_message_if_new(&message).await {
            Ok(true) => {
                result.inserted += 1;
                true
            }
            Ok(false) => {
                result.skipped += 1;
                true
            }
            Err(e) => {
                error!(
                    source = %source.source_id,
                    message_id = raw.message_id,
                    "Failed to insert message: {e}"
                );
                result.errors += 1;
                false
            }
        }
    }

    /// Watermark on record, or 0 when there is none or it cannot be read.
    async fn stored_watermark(&self, source_id: &str) -> i64 {
        match self.db.get_cursor(source_id).await {
            Ok(cursor) => cursor.map_or(0, |c| c.last_message_id),
            Err(e) => {
                warn!(source = %source_id, "Could not read cursor: {e}");
                0
            }
        }
    }

    async fn channel_failure(
        &self,
        source: &SourceConfig,
        cursor: Option<Cursor>,
        mut result: SourceIngestResult,
        err: ChannelError,
        options: &IngestOptions,
    ) -> Result<SourceIngestResult, Error> {
        let (status, message, retry_after) = match &err {
            ChannelError::RateLimited { retry_after, .. } => (
                RunStatus::RateLimited,
                format!("retry after {}s", retry_after.as_secs()),
                Some(*retry_after),
            ),
            other => (RunStatus::Failed, other.to_string(), None),
        };

        if !options.dry_run {
            let chat_id = cursor
                .as_ref()
                .map(|c| c.chat_id)
                .or(source.resolved_entity_id)
                .unwrap_or_default();
            let mut record = cursor.unwrap_or_else(|| empty_cursor(source, chat_id));
            record.last_run_at = Utc::now();
            record.last_run_status = status;
            record.last_error = Some(message.clone());
            self.db.upsert_cursor(&record).await?;
        }

        if let Some(retry_after) = retry_after {
            return Err(PipelineError::RateLimited {
                source_id: source.source_id.clone(),
                retry_after,
            }
            .into());
        }

        error!(source = %source.source_id, "Ingestion failed: {message}");
        result.status = status;
        result.error = Some(message);
        Ok(result)
    }
}

fn empty_cursor(source: &SourceConfig, chat_id: i64) -> Cursor {
    Cursor {
        source_id: source.source_id.clone(),
        chat_id,
        last_message_id: 0,
        last_message_date: None,
        last_run_at: Utc::now(),
        last_run_status: RunStatus::Success,
        last_error: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{SourceKind, ValidationStatus};
    use crate::error::DatabaseError;
    use crate::store::{LibSqlBackend, StoredMessage};

    struct StubChat {
        messages: Vec<RawMessage>,
        rate_limit: Option<Duration>,
        acks: Mutex<usize>,
    }

    impl StubChat {
        fn new(messages: Vec<RawMessage>) -> Self {
            Self {
                messages,
                rate_limit: None,
                acks: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatSource for StubChat {
        fn name(&self) -> &str {
            "stub"
        }

        async fn resolve_entity(&self, _source: &SourceConfig) -> Result<EntityHandle, ChannelError> {
            Ok(EntityHandle {
                chat_id: -1001,
                handle: Some("remotejobs".into()),
            })
        }

        async fn fetch_messages_since(
            &self,
            _entity: &EntityHandle,
            watermark: i64,
            limit: usize,
        ) -> Result<Vec<RawMessage>, ChannelError> {
            if let Some(retry_after) = self.rate_limit {
                return Err(ChannelError::RateLimited {
                    name: "stub".into(),
                    retry_after,
                });
            }
            Ok(self
                .messages
                .iter()
                .filter(|m| m.message_id > watermark)
                .take(limit)
                .cloned()
                .collect())
        }

        async fn acknowledge(&self) -> Result<(), ChannelError> {
            *self.acks.lock().unwrap() += 1;
            Ok(())
        }
    }

    /// Delegates to an in-memory backend, failing the configured calls.
    struct FlakyDb {
        inner: LibSqlBackend,
        fail_ids: HashSet<i64>,
        fail_cursor_for: Option<&'static str>,
        fail_lookups: bool,
    }

    impl FlakyDb {
        async fn new() -> Self {
            Self {
                inner: LibSqlBackend::new_memory().await.unwrap(),
                fail_ids: HashSet::new(),
                fail_cursor_for: None,
                fail_lookups: false,
            }
        }
    }

    #[async_trait]
    impl Database for FlakyDb {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            self.inner.run_migrations().await
        }
        async fn get_cursor(&self, source_id: &str) -> Result<Option<Cursor>, DatabaseError> {
            if self.fail_cursor_for == Some(source_id) {
                return Err(DatabaseError::Query("database is locked".into()));
            }
            self.inner.get_cursor(source_id).await
        }
        async fn upsert_cursor(&self, cursor: &Cursor) -> Result<(), DatabaseError> {
            self.inner.upsert_cursor(cursor).await
        }
        async fn list_cursors(&self) -> Result<Vec<Cursor>, DatabaseError> {
            self.inner.list_cursors().await
        }
        async fn insert_message_if_new(&self, message: &NewMessage) -> Result<bool, DatabaseError> {
            if self.fail_ids.contains(&message.message_id) {
                return Err(DatabaseError::Query("disk full".into()));
            }
            self.inner.insert_message_if_new(message).await
        }
        async fn get_message(
            &self,
            source_id: &str,
            message_id: i64,
        ) -> Result<Option<StoredMessage>, DatabaseError> {
            if self.fail_lookups {
                return Err(DatabaseError::Query("database is locked".into()));
            }
            self.inner.get_message(source_id, message_id).await
        }
        async fn fetch_pending_messages(
            &self,
            limit: usize,
            only_source: Option<&str>,
            reprocess: bool,
        ) -> Result<Vec<StoredMessage>, DatabaseError> {
            self.inner
                .fetch_pending_messages(limit, only_source, reprocess)
                .await
        }
        async fn fetch_relevant_messages(
            &self,
            limit: Option<usize>,
        ) -> Result<Vec<crate::store::RelevantMessage>, DatabaseError> {
            self.inner.fetch_relevant_messages(limit).await
        }
        async fn max_message_id(&self, source_id: &str) -> Result<Option<i64>, DatabaseError> {
            self.inner.max_message_id(source_id).await
        }
        async fn message_stats_by_source(
            &self,
        ) -> Result<Vec<crate::store::SourceMessageStats>, DatabaseError> {
            self.inner.message_stats_by_source().await
        }
        async fn upsert_classification(
            &self,
            record: &crate::store::ClassificationRecord,
        ) -> Result<(), DatabaseError> {
            self.inner.upsert_classification(record).await
        }
        async fn mark_message_classified(
            &self,
            source_id: &str,
            message_id: i64,
            is_relevant: bool,
            score: f64,
        ) -> Result<(), DatabaseError> {
            self.inner
                .mark_message_classified(source_id, message_id, is_relevant, score)
                .await
        }
        async fn list_classifications(
            &self,
            source_id: &str,
            message_id: i64,
        ) -> Result<Vec<crate::store::ClassificationRecord>, DatabaseError> {
            self.inner.list_classifications(source_id, message_id).await
        }
        async fn classification_stats(
            &self,
        ) -> Result<crate::store::ClassificationStats, DatabaseError> {
            self.inner.classification_stats().await
        }
    }

    fn raw(message_id: i64, text: Option<&str>) -> RawMessage {
        RawMessage {
            message_id,
            date: Some(Utc::now()),
            sender_id: Some(7),
            text: text.map(String::from),
            raw: serde_json::json!({ "message_id": message_id }),
        }
    }

    fn sources() -> SourcesFile {
        SourcesFile {
            sources: vec![
                SourceConfig {
                    source_id: "remote_jobs".into(),
                    display_name: "Remote Jobs".into(),
                    kind: SourceKind::Channel,
                    public_handle: Some("@remotejobs".into()),
                    invite_link: None,
                    resolved_entity_id: None,
                    enabled: true,
                    validation_status: ValidationStatus::Joined,
                    last_validated_at: None,
                    last_error: None,
                },
                SourceConfig {
                    source_id: "unvalidated".into(),
                    display_name: "Unvalidated".into(),
                    kind: SourceKind::Group,
                    public_handle: Some("@other".into()),
                    invite_link: None,
                    resolved_entity_id: None,
                    enabled: true,
                    validation_status: ValidationStatus::Pending,
                    last_validated_at: None,
                    last_error: None,
                },
            ],
        }
    }

    fn batch() -> Vec<RawMessage> {
        vec![
            raw(3, Some("Python developer, login code: 12345")),
            raw(1, Some("Rust engineer wanted")),
            raw(2, None),
            raw(4, Some("Barista wanted")),
        ]
    }

    async fn memory_db() -> Arc<dyn Database> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn ingests_new_messages_and_advances_watermark() {
        let db = memory_db().await;
        let chat = Arc::new(StubChat::new(batch()));
        let ingestor = Ingestor::new(db.clone(), chat.clone());

        let report = ingestor
            .ingest_all(&sources(), &IngestOptions::default())
            .await
            .unwrap();

        // Unvalidated source is not read without --force.
        assert_eq!(report.total_sources, 1);
        assert_eq!(report.total_fetched, 4);
        assert_eq!(report.total_inserted, 3);
        assert_eq!(report.total_skipped, 1);
        assert_eq!(report.sources[0].redacted, 1);
        // The unvalidated source was not read, so its updates stay unconfirmed.
        assert_eq!(*chat.acks.lock().unwrap(), 0);

        let cursor = db.get_cursor("remote_jobs").await.unwrap().unwrap();
        assert_eq!(cursor.last_message_id, 4);
        assert_eq!(cursor.last_run_status, RunStatus::Success);

        let stored = db.get_message("remote_jobs", 3).await.unwrap().unwrap();
        assert_eq!(stored.text, "Python developer, login code: [REDACTED]");
        assert_eq!(stored.permalink.as_deref(), Some("https://t.me/remotejobs/3"));
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let db = memory_db().await;
        let ingestor = Ingestor::new(db.clone(), Arc::new(StubChat::new(batch())));
        ingestor
            .ingest_all(&sources(), &IngestOptions::default())
            .await
            .unwrap();

        let again = ingestor
            .ingest_all(&sources(), &IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(again.total_fetched, 0);
        assert_eq!(again.total_inserted, 0);
        assert_eq!(db.max_message_id("remote_jobs").await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn failed_insert_freezes_watermark() {
        let db: Arc<dyn Database> = Arc::new(FlakyDb {
            fail_ids: HashSet::from([3]),
            ..FlakyDb::new().await
        });
        let chat = Arc::new(StubChat::new(batch()));
        let ingestor = Ingestor::new(db.clone(), chat.clone());

        let report = ingestor
            .ingest_all(&sources(), &IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(report.total_errors, 1);
        assert_eq!(report.sources_with_errors, vec!["remote_jobs"]);
        // Message 4 was still attempted.
        assert!(db.get_message("remote_jobs", 4).await.unwrap().is_some());
        // Pass had errors: nothing acknowledged.
        assert_eq!(*chat.acks.lock().unwrap(), 0);

        let cursor = db.get_cursor("remote_jobs").await.unwrap().unwrap();
        assert_eq!(cursor.last_message_id, 2);
        assert_eq!(cursor.last_run_status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn rate_limit_keeps_watermark_and_stops() {
        let db = memory_db().await;
        db.upsert_cursor(&Cursor {
            source_id: "remote_jobs".into(),
            chat_id: -1001,
            last_message_id: 10,
            last_message_date: None,
            last_run_at: Utc::now(),
            last_run_status: RunStatus::Success,
            last_error: None,
        })
        .await
        .unwrap();

        let mut chat = StubChat::new(batch());
        chat.rate_limit = Some(Duration::from_secs(42));
        let ingestor = Ingestor::new(db.clone(), Arc::new(chat));

        let report = ingestor
            .ingest_all(&sources(), &IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(report.rate_limited_retry_after_secs, Some(42));

        assert_eq!(report.sources[0].previous_watermark, 10);
        assert_eq!(report.sources[0].new_watermark, 10);

        let cursor = db.get_cursor("remote_jobs").await.unwrap().unwrap();
        assert_eq!(cursor.last_message_id, 10);
        assert_eq!(cursor.last_run_status, RunStatus::RateLimited);
        assert_eq!(cursor.last_error.as_deref(), Some("retry after 42s"));

        let err = ingestor
            .ingest_source(&sources().sources[0], &IngestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let db = memory_db().await;
        let ingestor = Ingestor::new(db.clone(), Arc::new(StubChat::new(batch())));
        let options = IngestOptions {
            dry_run: true,
            ..Default::default()
        };

        let report = ingestor.ingest_all(&sources(), &options).await.unwrap();
        assert_eq!(report.total_inserted, 3);
        assert!(db.get_cursor("remote_jobs").await.unwrap().is_none());
        assert_eq!(db.max_message_id("remote_jobs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn only_and_force_select_sources() {
        let file = sources();
        let forced = select_sources(&file, Some("unvalidated"), true).unwrap();
        assert_eq!(forced.len(), 1);
        assert!(select_sources(&file, Some("unvalidated"), false).unwrap().is_empty());
        assert!(matches!(
            select_sources(&file, Some("missing"), false),
            Err(PipelineError::UnknownSource { .. })
        ));
    }

    #[tokio::test]
    async fn dry_run_lookup_failures_are_counted() {
        let db: Arc<dyn Database> = Arc::new(FlakyDb {
            fail_lookups: true,
            ..FlakyDb::new().await
        });
        let ingestor = Ingestor::new(db, Arc::new(StubChat::new(batch())));
        let options = IngestOptions {
            dry_run: true,
            ..Default::default()
        };

        let report = ingestor.ingest_all(&sources(), &options).await.unwrap();
        assert_eq!(report.total_errors, 3);
        assert_eq!(report.total_inserted, 0);
        assert_eq!(report.sources[0].new_watermark, 0);
    }

    #[tokio::test]
    async fn store_failure_on_one_source_does_not_stop_the_pass() {
        let db: Arc<dyn Database> = Arc::new(FlakyDb {
            fail_cursor_for: Some("remote_jobs"),
            ..FlakyDb::new().await
        });
        let chat = Arc::new(StubChat::new(batch()));
        let ingestor = Ingestor::new(db.clone(), chat.clone());
        let options = IngestOptions {
            force: true,
            ..Default::default()
        };

        let report = ingestor.ingest_all(&sources(), &options).await.unwrap();
        assert_eq!(report.total_sources, 2);
        assert_eq!(report.sources_with_errors, vec!["remote_jobs"]);
        assert_eq!(report.sources[0].status, RunStatus::Failed);
        assert!(report.sources[0].error.as_deref().unwrap().contains("locked"));
        assert_eq!(report.sources[1].inserted, 3);
        assert_eq!(db.max_message_id("unvalidated").await.unwrap(), Some(4));
        assert_eq!(*chat.acks.lock().unwrap(), 0);
    }

    /// Per-chat update queue; acknowledging confirms and drops everything
    /// queued, the way a Bot API offset confirmation does.
    struct QueueChat {
        queue: Mutex<Vec<(i64, RawMessage)>>,
        acks: Mutex<usize>,
    }

    impl QueueChat {
        fn new(updates: Vec<(i64, i64)>) -> Self {
            Self {
                queue: Mutex::new(
                    updates
                        .into_iter()
                        .map(|(chat_id, id)| (chat_id, raw(id, Some("Rust engineer wanted"))))
                        .collect(),
                ),
                acks: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatSource for QueueChat {
        fn name(&self) -> &str {
            "queue"
        }

        async fn resolve_entity(&self, source: &SourceConfig) -> Result<EntityHandle, ChannelError> {
            Ok(EntityHandle {
                chat_id: source.resolved_entity_id.unwrap_or_default(),
                handle: None,
            })
        }

        async fn fetch_messages_since(
            &self,
            entity: &EntityHandle,
            watermark: i64,
            limit: usize,
        ) -> Result<Vec<RawMessage>, ChannelError> {
            let mut messages: Vec<RawMessage> = self
                .queue
                .lock()
                .unwrap()
                .iter()
                .filter(|(chat_id, m)| *chat_id == entity.chat_id && m.message_id > watermark)
                .map(|(_, m)| m.clone())
                .collect();
            messages.sort_by_key(|m| m.message_id);
            messages.truncate(limit);
            Ok(messages)
        }

        async fn acknowledge(&self) -> Result<(), ChannelError> {
            self.queue.lock().unwrap().clear();
            *self.acks.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn joined(source_id: &str, chat_id: i64) -> SourceConfig {
        SourceConfig {
            source_id: source_id.into(),
            display_name: source_id.into(),
            kind: SourceKind::Channel,
            public_handle: None,
            invite_link: None,
            resolved_entity_id: Some(chat_id),
            enabled: true,
            validation_status: ValidationStatus::Joined,
            last_validated_at: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn full_batches_are_not_acknowledged() {
        let db = memory_db().await;
        let chat = Arc::new(QueueChat::new(vec![(-1, 1), (-1, 2), (-1, 3)]));
        let ingestor = Ingestor::new(db.clone(), chat.clone());
        let file = SourcesFile {
            sources: vec![joined("a", -1)],
        };
        let options = IngestOptions {
            limit_per_source: 1,
            ..Default::default()
        };

        for _ in 0..3 {
            let report = ingestor.ingest_all(&file, &options).await.unwrap();
            assert!(report.sources[0].truncated);
        }
        assert_eq!(db.max_message_id("a").await.unwrap(), Some(3));
        assert_eq!(*chat.acks.lock().unwrap(), 0);

        // Nothing left behind the watermark: now the updates can be confirmed.
        let report = ingestor.ingest_all(&file, &options).await.unwrap();
        assert!(!report.sources[0].truncated);
        assert_eq!(*chat.acks.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn single_source_pass_keeps_other_updates() {
        let db = memory_db().await;
        let chat = Arc::new(QueueChat::new(vec![(-1, 1), (-2, 10)]));
        let ingestor = Ingestor::new(db.clone(), chat.clone());
        let file = SourcesFile {
            sources: vec![joined("a", -1), joined("b", -2)],
        };

        let only_a = IngestOptions {
            only: Some("a".into()),
            ..Default::default()
        };
        ingestor.ingest_all(&file, &only_a).await.unwrap();
        assert_eq!(*chat.acks.lock().unwrap(), 0);

        ingestor
            .ingest_all(&file, &IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(db.max_message_id("a").await.unwrap(), Some(1));
        assert_eq!(db.max_message_id("b").await.unwrap(), Some(10));
        assert_eq!(*chat.acks.lock().unwrap(), 1);
    }
}
