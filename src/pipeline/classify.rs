//! Classification pass over stored messages, and CSV export of candidates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{Error, PipelineError};
use crate::pipeline::rules::RuleTable;
use crate::store::{ClassificationRecord, Database, RelevantMessage};

pub const DEFAULT_CLASSIFY_LIMIT: usize = 500;

const SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct ClassifyOptions {
    pub limit: usize,
    pub only: Option<String>,
    /// Re-run messages that already have a verdict.
    pub reprocess: bool,
    pub dry_run: bool,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_CLASSIFY_LIMIT,
            only: None,
            reprocess: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassifyReport {
    pub classifier_version: String,
    pub processed: usize,
    pub relevant: usize,
    pub not_relevant: usize,
    pub errors: usize,
    pub dry_run: bool,
}

pub struct Classifier {
    db: Arc<dyn Database>,
    rules: RuleTable,
}

impl Classifier {
    pub fn new(db: Arc<dyn Database>, rules: RuleTable) -> Self {
        Self { db, rules }
    }

    /// Classify pending messages (or all, with `reprocess`). Per-message
    /// failures are counted and the pass continues.
    pub async fn run(&self, options: &ClassifyOptions) -> Result<ClassifyReport, Error> {
        let messages = self
            .db
            .fetch_pending_messages(options.limit, options.only.as_deref(), options.reprocess)
            .await?;

        let mut report = ClassifyReport {
            classifier_version: self.rules.classifier_version(),
            dry_run: options.dry_run,
            ..Default::default()
        };
        info!(
            messages = messages.len(),
            version = %report.classifier_version,
            dry_run = options.dry_run,
            "Starting classification pass"
        );

        for message in messages {
            let verdict = self.rules.classify(&message.text);
            report.processed += 1;
            if verdict.relevant {
                report.relevant += 1;
            } else {
                report.not_relevant += 1;
            }
            debug!(
                source = %message.source_id,
                message_id = message.message_id,
                score = verdict.score,
                relevant = verdict.relevant,
                "Classified"
            );

            if options.dry_run {
                continue;
            }

            let metadata = match serde_json::to_value(&verdict.metadata) {
                Ok(value) => value,
                Err(e) => {
                    error!(message_id = message.message_id, "Metadata encode failed: {e}");
                    report.errors += 1;
                    continue;
                }
            };
            let record = ClassificationRecord {
                source_id: message.source_id.clone(),
                chat_id: message.chat_id,
                message_id: message.message_id,
                classifier_version: verdict.metadata.classifier_version.clone(),
                is_relevant: verdict.relevant,
                score: verdict.score,
                reasons: verdict.reasons.clone(),
                metadata,
                classified_at: Utc::now(),
            };

            let stored = async {
                self.db.upsert_classification(&record).await?;
                self.db
                    .mark_message_classified(
                        &message.source_id,
                        message.message_id,
                        verdict.relevant,
                        verdict.score,
                    )
                    .await
            }
            .await;
            if let Err(e) = stored {
                error!(
                    source = %message.source_id,
                    message_id = message.message_id,
                    "Failed to store classification: {e}"
                );
                report.errors += 1;
            }
        }

        info!(
            processed = report.processed,
            relevant = report.relevant,
            errors = report.errors,
            "Classification pass complete"
        );
        Ok(report)
    }
}

/// Neutralize spreadsheet formula prefixes.
fn csv_cell(value: &str) -> String {
    if value.starts_with(['=', '+', '-', '@', '\t', '\r']) {
        format!("'{value}")
    } else {
        value.to_string()
    }
}

fn matched_keywords(record: Option<&ClassificationRecord>) -> String {
    let Some(phrases) = record
        .and_then(|r| r.metadata.get("matched_phrases"))
        .and_then(|v| v.as_object())
    else {
        return String::new();
    };
    phrases
        .iter()
        .filter(|(group, _)| group.as_str() != "negative_nontech")
        .filter_map(|(_, list)| list.as_array())
        .flatten()
        .filter_map(|v| v.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render relevant messages as CSV.
pub fn render_candidates_csv(rows: &[RelevantMessage]) -> Result<Vec<u8>, PipelineError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "source_id",
            "message_id",
            "date",
            "score",
            "reasons",
            "matched_keywords",
            "permalink",
            "text_snippet",
        ])
        .map_err(|e| PipelineError::Export(e.to_string()))?;

    for row in rows {
        let message = &row.message;
        let classification = row.classification.as_ref();
        let score = classification
            .map(|c| c.score)
            .or(message.relevance_score)
            .unwrap_or_default();
        let reasons = classification
            .map(|c| c.reasons.join("; "))
            .unwrap_or_default();
        let snippet: String = message
            .text
            .chars()
            .take(SNIPPET_CHARS)
            .map(|c| if c == '\n' { ' ' } else { c })
            .collect();

        writer
            .write_record([
                csv_cell(&message.source_id),
                message.message_id.to_string(),
                message.date.map(|d| d.to_rfc3339()).unwrap_or_default(),
                format!("{score:.2}"),
                csv_cell(&reasons),
                csv_cell(&matched_keywords(classification)),
                csv_cell(message.permalink.as_deref().unwrap_or_default()),
                csv_cell(&snippet),
            ])
            .map_err(|e| PipelineError::Export(e.to_string()))?;
    }

    writer
        .into_inner()
        .map_err(|e| PipelineError::Export(e.to_string()))
}

/// Write `ai_candidates_YYYYMMDD_HHMMSS.csv` into `dir`. Returns the path and row count.
pub async fn export_candidates(
    db: &dyn Database,
    dir: &Path,
    limit: Option<usize>,
) -> Result<(PathBuf, usize), Error> {
    let rows = db.fetch_relevant_messages(limit).await?;
    let bytes = render_candidates_csv(&rows)?;

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| PipelineError::Export(format!("{}: {e}", dir.display())))?;
    let path = dir.join(format!(
        "ai_candidates_{}.csv",
        Utc::now().format("%Y%m%d_%H%M%S")
    ));
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| PipelineError::Export(format!("{}: {e}", path.display())))?;

    info!(path = %path.display(), rows = rows.len(), "Exported candidates");
    Ok((path, rows.len()))
}
