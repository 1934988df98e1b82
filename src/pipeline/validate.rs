//! Source access checks. Records the resolved chat id and status on each source.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::channels::ChatSource;
use crate::config::{SourcesFile, ValidationStatus};
use crate::error::{ChannelError, Error, PipelineError};

#[derive(Debug, Clone, Serialize)]
pub struct SourceValidation {
    pub source_id: String,
    pub status: ValidationStatus,
    pub resolved_entity_id: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub validated_at: DateTime<Utc>,
    pub total: usize,
    pub joined: usize,
    pub failed: usize,
    pub rate_limited_retry_after_secs: Option<u64>,
    pub sources: Vec<SourceValidation>,
}

/// Resolve every enabled source (or just `only`) and update `sources` in place.
/// A rate limit ends the pass early; sources already checked keep their result.
pub async fn validate_sources(
    chat: &dyn ChatSource,
    sources: &mut SourcesFile,
    only: Option<&str>,
) -> Result<ValidationReport, Error> {
    if let Some(id) = only
        && sources.find(id).is_none()
    {
        return Err(PipelineError::UnknownSource {
            source_id: id.to_string(),
        }
        .into());
    }

    let targets: Vec<_> = sources
        .enabled()
        .filter(|s| only.is_none_or(|id| s.source_id == id))
        .cloned()
        .collect();

    let mut report = ValidationReport {
        validated_at: Utc::now(),
        total: 0,
        joined: 0,
        failed: 0,
        rate_limited_retry_after_secs: None,
        sources: Vec::new(),
    };

    for source in targets {
        let outcome = match chat.resolve_entity(&source).await {
            Ok(entity) => {
                info!(source = %source.source_id, chat_id = entity.chat_id, "Source reachable");
                report.joined += 1;
                SourceValidation {
                    source_id: source.source_id.clone(),
                    status: ValidationStatus::Joined,
                    resolved_entity_id: Some(entity.chat_id),
                    error: None,
                }
            }
            Err(ChannelError::RateLimited { retry_after, .. }) => {
                warn!(
                    source = %source.source_id,
                    retry_after_secs = retry_after.as_secs(),
                    "Rate limited, stopping validation"
                );
                report.rate_limited_retry_after_secs = Some(retry_after.as_secs());
                break;
            }
            Err(e) => {
                warn!(source = %source.source_id, "Source not reachable: {e}");
                report.failed += 1;
                SourceValidation {
                    source_id: source.source_id.clone(),
                    status: ValidationStatus::JoinFailed,
                    resolved_entity_id: None,
                    error: Some(e.to_string()),
                }
            }
        };

        sources.update_validation(
            &outcome.source_id,
            outcome.status,
            outcome.resolved_entity_id,
            outcome.error.clone(),
        );
        report.total += 1;
        report.sources.push(outcome);
    }

    Ok(report)
}
