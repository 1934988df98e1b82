//! Append-only JSONL ledger of outbox entries.
//!
//! Every create or update appends a full row version to `outbox_YYYYMMDD.jsonl`
//! (UTC day of the write). Readers scan all partitions in name order and
//! reduce to the latest version per `outbox_id`.
//!
//! The ledger assumes a single writer process. Concurrent runs against the same
//! directory can interleave appends and race the dedupe check.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::OutboxError;
use crate::outbox::model::{
    EntryUpdate, NewOutboxEntry, OutboxEntry, OutboxStats, OutboxStatus, SkipReason, dedupe_key,
};

const PARTITION_PREFIX: &str = "outbox_";
const PARTITION_SUFFIX: &str = ".jsonl";

pub struct OutboxLedger {
    dir: PathBuf,
    dedupe_index: HashSet<String>,
}

impl OutboxLedger {
    /// Open (creating if needed) a ledger directory and build the dedupe index.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, OutboxError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut ledger = Self {
            dir,
            dedupe_index: HashSet::new(),
        };
        let entries = ledger.read_all().await?;
        ledger.dedupe_index = entries
            .iter()
            .filter_map(|e| e.dedupe_key.clone())
            .collect();

        info!(
            dir = %ledger.dir.display(),
            rows = entries.len(),
            keys = ledger.dedupe_index.len(),
            "Outbox ledger opened"
        );
        Ok(ledger)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether any entry, in any state, ever carried this key.
    pub fn is_duplicate(&self, key: &str) -> bool {
        self.dedupe_index.contains(key)
    }

    /// Append a new entry. Status and dedupe key are derived from the input.
    pub async fn create_entry(&mut self, new: NewOutboxEntry) -> Result<OutboxEntry, OutboxError> {
        let now = Utc::now();
        let key = new
            .selected_email
            .as_deref()
            .map(|email| dedupe_key(new.chat_id, new.message_id, email));

        let (status, skip_reason) = match new.skip_reason {
            Some(reason) => (OutboxStatus::Skipped, Some(reason)),
            None => match (&new.selected_email, &new.profile_id) {
                (Some(_), Some(_)) => (OutboxStatus::Draft, None),
                (Some(_), None) => (OutboxStatus::Skipped, Some(SkipReason::NoMatch)),
                (None, _) => (OutboxStatus::Skipped, Some(SkipReason::NoEmailFound)),
            },
        };

        let entry = OutboxEntry {
            outbox_id: Uuid::new_v4(),
            profile_id: new.profile_id,
            source_id: new.source_id,
            chat_id: new.chat_id,
            message_id: new.message_id,
            permalink: new.permalink,
            job_title: new.job_title,
            extracted_emails: new.extracted_emails,
            selected_email: new.selected_email,
            subject: new.subject,
            body: new.body,
            cv_path: new.cv_path,
            status,
            dedupe_key: key,
            routing_scores: new.routing_scores,
            routing_metadata: new.routing_metadata,
            skip_reason: skip_reason.map(|r| r.as_str().to_string()),
            created_at: now,
            updated_at: now,
            sent_at: None,
            last_error: None,
            transport_response: None,
            attempt_count: 0,
        };

        self.append(&entry).await?;
        if let Some(key) = &entry.dedupe_key {
            self.dedupe_index.insert(key.clone());
        }
        debug!(
            outbox_id = %entry.outbox_id,
            status = %entry.status,
            skip_reason = entry.skip_reason.as_deref().unwrap_or("-"),
            "Outbox entry created"
        );
        Ok(entry)
    }

    /// Append a new version of `outbox_id` with the requested status.
    pub async fn update_entry(
        &mut self,
        outbox_id: Uuid,
        update: EntryUpdate,
    ) -> Result<OutboxEntry, OutboxError> {
        let entries = self.read_all().await?;
        let current =
            latest_version(outbox_id, &entries).ok_or(OutboxError::NotFound { outbox_id })?;

        if !current.status.can_transition_to(update.status) {
            return Err(OutboxError::InvalidTransition {
                outbox_id,
                from: current.status.to_string(),
                to: update.status.to_string(),
            });
        }

        if update.status == OutboxStatus::Sent
            && let Some(key) = &current.dedupe_key
            && let Some(other) = latest_versions(&entries).into_iter().find(|e| {
                e.outbox_id != outbox_id
                    && e.status == OutboxStatus::Sent
                    && e.dedupe_key.as_ref() == Some(key)
            })
        {
            return Err(OutboxError::DuplicateSend {
                dedupe_key: key.clone(),
                sent_by: other.outbox_id,
            });
        }

        let now = Utc::now();
        let mut next = current;
        next.status = update.status;
        next.updated_at = now;
        next.attempt_count += 1;
        if update.status == OutboxStatus::Sent {
            next.sent_at = Some(now);
        }
        if let Some(reason) = update.skip_reason {
            next.skip_reason = Some(reason.as_str().to_string());
        }
        if update.last_error.is_some() {
            next.last_error = update.last_error;
        }
        if update.transport_response.is_some() {
            next.transport_response = update.transport_response;
        }

        self.append(&next).await?;
        debug!(outbox_id = %outbox_id, status = %next.status, "Outbox entry updated");
        Ok(next)
    }

    /// Latest version of one entry.
    pub async fn get_entry(&self, outbox_id: Uuid) -> Result<Option<OutboxEntry>, OutboxError> {
        let entries = self.read_all().await?;
        Ok(latest_version(outbox_id, &entries))
    }

    /// Latest versions of every entry, in first-appearance order.
    pub async fn entries(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
        Ok(latest_versions(&self.read_all().await?))
    }

    /// Entries still waiting on a send decision (draft or pending).
    pub async fn pending_entries(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| matches!(e.status, OutboxStatus::Draft | OutboxStatus::Pending))
            .collect())
    }

    pub async fn statistics(&self) -> Result<OutboxStats, OutboxError> {
        let mut stats = OutboxStats::default();
        for entry in self.entries().await? {
            stats.record(&entry);
        }
        Ok(stats)
    }

    /// Per-profile statistics. Entries without a profile are grouped under `unrouted`.
    pub async fn statistics_by_profile(
        &self,
    ) -> Result<BTreeMap<String, OutboxStats>, OutboxError> {
        let mut by_profile: BTreeMap<String, OutboxStats> = BTreeMap::new();
        for entry in self.entries().await? {
            let profile = entry.profile_id.as_deref().unwrap_or("unrouted");
            by_profile.entry(profile.to_string()).or_default().record(&entry);
        }
        Ok(by_profile)
    }

    // ── Storage ─────────────────────────────────────────────────────

    fn current_partition(&self) -> PathBuf {
        self.dir.join(format!(
            "{PARTITION_PREFIX}{}{PARTITION_SUFFIX}",
            Utc::now().format("%Y%m%d")
        ))
    }

    async fn append(&self, entry: &OutboxEntry) -> Result<(), OutboxError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_partition())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn partitions(&self) -> Result<Vec<PathBuf>, OutboxError> {
        let mut paths = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(PARTITION_PREFIX)
                && name.ends_with(PARTITION_SUFFIX)
                && item.file_type().await?.is_file()
            {
                paths.push(item.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Every row version across all partitions, in ledger order.
    async fn read_all(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
        let mut entries = Vec::new();
        for path in self.partitions().await? {
            let raw = fs::read_to_string(&path).await?;
            for (line_no, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<OutboxEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(
                        file = %path.display(),
                        line = line_no + 1,
                        "Skipping corrupt outbox line: {e}"
                    ),
                }
            }
        }
        Ok(entries)
    }
}

/// Last written version of `outbox_id`.
pub fn latest_version(outbox_id: Uuid, entries: &[OutboxEntry]) -> Option<OutboxEntry> {
    entries
        .iter()
        .rev()
        .find(|e| e.outbox_id == outbox_id)
        .cloned()
}

/// Last written version of every id, ordered by first appearance.
pub fn latest_versions(entries: &[OutboxEntry]) -> Vec<OutboxEntry> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut latest: HashMap<Uuid, &OutboxEntry> = HashMap::new();
    for entry in entries {
        if latest.insert(entry.outbox_id, entry).is_none() {
            order.push(entry.outbox_id);
        }
    }
    order
        .into_iter()
        .filter_map(|id| latest.get(&id).map(|e| (*e).clone()))
        .collect()
}
