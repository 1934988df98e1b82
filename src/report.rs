//! JSON run reports written after each pass.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::error::PipelineError;

/// Write `{kind}_report_YYYYMMDD_HHMMSS.json` into `dir` and return its path.
pub async fn write_report<T: Serialize>(
    dir: &Path,
    kind: &str,
    report: &T,
) -> Result<PathBuf, PipelineError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| PipelineError::Report(format!("{}: {e}", dir.display())))?;

    let path = dir.join(format!(
        "{kind}_report_{}.json",
        Utc::now().format("%Y%m%d_%H%M%S")
    ));
    let body =
        serde_json::to_vec_pretty(report).map_err(|e| PipelineError::Report(e.to_string()))?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|e| PipelineError::Report(format!("{}: {e}", path.display())))?;

    info!(path = %path.display(), "Report written");
    Ok(path)
}
