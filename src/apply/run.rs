//! Route/send pass.
//!
//! Phase one turns every relevant message into an outbox entry (a draft or a
//! skip with a reason). Phase two, only with `send`, pushes drafts through the
//! gated sender. Entries left `pending` by an interrupted run are never resent.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::apply::sender::{SendOutcome, Sender};
use crate::channels::MailEnvelope;
use crate::config::ApplicantProfile;
use crate::error::Error;
use crate::outbox::{
    EntryUpdate, NewOutboxEntry, OutboxEntry, OutboxLedger, OutboxStatus, SkipReason, dedupe_key,
};
use crate::pipeline::routing::{EmailSelection, extract_emails, route, select_email};
use crate::pipeline::templates::{TemplateVars, extract_job_title, render_email, select_template};
use crate::store::{Database, StoredMessage};

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Maximum relevant messages to consider.
    pub limit: Option<usize>,
    /// Recipient index when a posting lists several addresses.
    pub pick_email: Option<usize>,
    /// Template index within the winning profile.
    pub template: Option<usize>,
    /// Push drafts through the sender.
    pub send: bool,
    /// Preview only; the ledger is not touched.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub dry_run: bool,
    pub send: bool,
    pub messages: usize,
    pub drafts: usize,
    pub skipped: usize,
    pub skip_reasons: BTreeMap<String, usize>,
    pub sent: usize,
    pub would_send: usize,
    /// Dry-run previews a send gate would stop. Not counted as skips.
    pub would_block: usize,
    pub failed: usize,
    pub errors: usize,
}

impl ApplyReport {
    fn skip(&mut self, reason: SkipReason) {
        self.skipped += 1;
        *self.skip_reasons.entry(reason.as_str().to_string()).or_default() += 1;
    }
}

pub struct ApplyPass {
    db: Arc<dyn Database>,
    profiles: BTreeMap<String, ApplicantProfile>,
    sender: Sender,
}

impl ApplyPass {
    pub fn new(
        db: Arc<dyn Database>,
        profiles: BTreeMap<String, ApplicantProfile>,
        sender: Sender,
    ) -> Self {
        Self {
            db,
            profiles,
            sender,
        }
    }

    pub async fn run(
        &mut self,
        ledger: &mut OutboxLedger,
        options: &ApplyOptions,
    ) -> Result<ApplyReport, Error> {
        let messages = self.db.fetch_relevant_messages(options.limit).await?;
        let mut report = ApplyReport {
            dry_run: options.dry_run,
            send: options.send,
            messages: messages.len(),
            ..Default::default()
        };
        info!(
            messages = messages.len(),
            profiles = self.profiles.len(),
            send = options.send,
            dry_run = options.dry_run,
            "Starting apply pass"
        );

        // Keys planned in this run; a dry run never writes them to the ledger.
        let mut run_keys: HashSet<String> = HashSet::new();
        let mut previews: Vec<NewOutboxEntry> = Vec::new();

        for relevant in &messages {
            let planned = self.plan_entry(&relevant.message, options, |key| {
                ledger.is_duplicate(key) || run_keys.contains(key)
            });

            match planned.skip_reason {
                Some(reason) => report.skip(reason),
                None => report.drafts += 1,
            }

            if options.dry_run {
                if planned.skip_reason.is_none() {
                    if let Some(email) = &planned.selected_email {
                        run_keys.insert(dedupe_key(planned.chat_id, planned.message_id, email));
                    }
                    previews.push(planned);
                }
                continue;
            }

            if let Err(e) = ledger.create_entry(planned).await {
                error!(
                    source = %relevant.message.source_id,
                    message_id = relevant.message.message_id,
                    "Failed to record outbox entry: {e}"
                );
                report.errors += 1;
            }
        }

        if options.send {
            if options.dry_run {
                self.preview_sends(&previews, &mut report).await;
            } else {
                self.send_drafts(ledger, &mut report).await?;
            }
        }

        info!(
            drafts = report.drafts,
            skipped = report.skipped,
            sent = report.sent,
            failed = report.failed,
            errors = report.errors,
            "Apply pass complete"
        );
        Ok(report)
    }

    /// Decide what entry a message becomes. Pure apart from the dedupe lookup.
    fn plan_entry(
        &self,
        message: &StoredMessage,
        options: &ApplyOptions,
        is_duplicate: impl Fn(&str) -> bool,
    ) -> NewOutboxEntry {
        let emails = extract_emails(&message.text);
        let job_title = extract_job_title(&message.text);
        let decision = route(&message.text, &self.profiles);
        let profile = decision
            .profile_id
            .as_ref()
            .and_then(|id| self.profiles.get(id));

        let mut entry = NewOutboxEntry {
            profile_id: decision.profile_id.clone(),
            source_id: message.source_id.clone(),
            chat_id: message.chat_id,
            message_id: message.message_id,
            permalink: message.permalink.clone(),
            job_title,
            extracted_emails: emails,
            cv_path: profile.map(|p| p.cv_path.clone()),
            routing_scores: decision.scores.clone(),
            routing_metadata: serde_json::to_value(&decision.metadata).unwrap_or_default(),
            ..Default::default()
        };

        let Some(profile) = profile else {
            entry.skip_reason = Some(decision.skip_reason.unwrap_or(SkipReason::NoMatch));
            return entry;
        };

        let email = match select_email(&entry.extracted_emails, options.pick_email) {
            Ok(EmailSelection::Selected(email)) => email,
            Ok(EmailSelection::NoEmail) => {
                entry.skip_reason = Some(SkipReason::NoEmailFound);
                return entry;
            }
            Ok(EmailSelection::Ambiguous) => {
                entry.skip_reason = Some(SkipReason::MultipleEmailsAmbiguous);
                return entry;
            }
            Err(e) => {
                warn!(message_id = message.message_id, "{e}");
                entry.skip_reason = Some(SkipReason::InvalidEmailIndex);
                return entry;
            }
        };
        entry.selected_email = Some(email.clone());

        if is_duplicate(&dedupe_key(message.chat_id, message.message_id, &email)) {
            entry.skip_reason = Some(SkipReason::Duplicate);
            return entry;
        }

        let template = match select_template(profile, options.template) {
            Ok(template) => template,
            Err(e) => {
                warn!(message_id = message.message_id, "{e}");
                entry.skip_reason = Some(SkipReason::InvalidTemplateIndex);
                return entry;
            }
        };

        let vars = TemplateVars {
            job_title: &entry.job_title,
            source_link: message.permalink.as_deref().unwrap_or_default(),
            applicant_name: &profile.applicant_name,
        };
        let (subject, body) = render_email(template, &vars);
        entry.subject = Some(subject);
        entry.body = Some(body);
        entry
    }

    /// Send every draft in the ledger.
    async fn send_drafts(
        &mut self,
        ledger: &mut OutboxLedger,
        report: &mut ApplyReport,
    ) -> Result<(), Error> {
        let entries = ledger.entries().await?;
        let mut sent_keys: HashSet<String> = entries
            .iter()
            .filter(|e| e.status == OutboxStatus::Sent)
            .filter_map(|e| e.dedupe_key.clone())
            .collect();
        let drafts: Vec<OutboxEntry> = entries
            .into_iter()
            .filter(|e| e.status == OutboxStatus::Draft)
            .collect();

        info!(drafts = drafts.len(), "Sending drafts");

        for draft in drafts {
            if draft
                .dedupe_key
                .as_ref()
                .is_some_and(|k| sent_keys.contains(k))
            {
                let update = EntryUpdate::skipped(SkipReason::Duplicate, None);
                match ledger.update_entry(draft.outbox_id, update).await {
                    Ok(_) => report.skip(SkipReason::Duplicate),
                    Err(e) => {
                        error!(outbox_id = %draft.outbox_id, "Failed to skip duplicate: {e}");
                        report.errors += 1;
                    }
                }
                continue;
            }

            let Some((envelope, attachment)) = envelope_for(&draft) else {
                warn!(outbox_id = %draft.outbox_id, "Draft is missing send fields");
                let update = EntryUpdate::skipped(SkipReason::NoEmailFound, None);
                match ledger.update_entry(draft.outbox_id, update).await {
                    Ok(_) => report.skip(SkipReason::NoEmailFound),
                    Err(e) => {
                        error!(outbox_id = %draft.outbox_id, "Failed to skip draft: {e}");
                        report.errors += 1;
                    }
                }
                continue;
            };

            // Nothing is handed to the transport unless the entry is durably pending.
            if let Err(e) = ledger
                .update_entry(draft.outbox_id, EntryUpdate::status(OutboxStatus::Pending))
                .await
            {
                error!(outbox_id = %draft.outbox_id, "Failed to mark draft pending: {e}");
                report.errors += 1;
                continue;
            }

            let update = match self.sender.send(&envelope, attachment, false).await {
                Ok(SendOutcome::Sent { receipt }) => {
                    report.sent += 1;
                    if let Some(key) = &draft.dedupe_key {
                        sent_keys.insert(key.clone());
                    }
                    EntryUpdate::status(OutboxStatus::Sent).with_response(receipt.diagnostic)
                }
                Ok(SendOutcome::Failed { diagnostic }) => {
                    report.failed += 1;
                    EntryUpdate::status(OutboxStatus::Failed).with_error(diagnostic)
                }
                Ok(SendOutcome::DryRun) => continue,
                Err(e) => {
                    warn!(outbox_id = %draft.outbox_id, "Send blocked: {e}");
                    report.skip(SkipReason::SecurityGate);
                    EntryUpdate::skipped(SkipReason::SecurityGate, Some(e.to_string()))
                }
            };

            if let Err(e) = ledger.update_entry(draft.outbox_id, update).await {
                error!(outbox_id = %draft.outbox_id, "Failed to finalize entry: {e}");
                report.errors += 1;
            }
        }
        Ok(())
    }

    /// Dry run: exercise the gates for every previewed draft without sending.
    async fn preview_sends(&mut self, previews: &[NewOutboxEntry], report: &mut ApplyReport) {
        for preview in previews {
            let (Some(to), Some(subject), Some(body), Some(cv_path)) = (
                &preview.selected_email,
                &preview.subject,
                &preview.body,
                &preview.cv_path,
            ) else {
                continue;
            };
            let envelope = MailEnvelope {
                to: to.clone(),
                subject: subject.clone(),
                body: body.clone(),
                attachment_name: attachment_name(cv_path),
            };
            match self.sender.send(&envelope, cv_path, true).await {
                Ok(_) => {
                    info!(to = %to, subject = %subject, "Would send");
                    report.would_send += 1;
                }
                Err(e) => {
                    warn!(to = %to, "Would be blocked: {e}");
                    report.would_block += 1;
                }
            }
        }
    }
}

fn attachment_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cv.pdf".to_string())
}

fn envelope_for(entry: &OutboxEntry) -> Option<(MailEnvelope, &Path)> {
    let cv_path = entry.cv_path.as_deref()?;
    Some((
        MailEnvelope {
            to: entry.selected_email.clone()?,
            subject: entry.subject.clone()?,
            body: entry.body.clone()?,
            attachment_name: attachment_name(cv_path),
        },
        cv_path,
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::channels::{MailTransport, TransportReceipt};
    use crate::config::{ApplyConfig, EmailTemplate};
    use crate::error::ChannelError;
    use crate::store::{LibSqlBackend, NewMessage};

    struct OkTransport;

    #[async_trait]
    impl MailTransport for OkTransport {
        async fn send_mail(
            &self,
            _envelope: &MailEnvelope,
            _attachment: &[u8],
        ) -> Result<TransportReceipt, ChannelError> {
            Ok(TransportReceipt {
                accepted: true,
                diagnostic: "250 OK".into(),
            })
        }
    }

    fn profiles(cv_path: &Path) -> BTreeMap<String, ApplicantProfile> {
        let profile = ApplicantProfile {
            profile_id: "python_dev".into(),
            applicant_name: "Jane Doe".into(),
            cv_path: cv_path.to_path_buf(),
            threshold: 1.0,
            keywords_positive: vec!["python".into(), "django".into()],
            keywords_negative: vec![],
            email_templates: vec![EmailTemplate {
                subject: "Application: {{JOB_TITLE}}".into(),
                body: "{{APPLICANT_NAME}} re {{SOURCE_LINK}}".into(),
            }],
        };
        BTreeMap::from([(profile.profile_id.clone(), profile)])
    }

    async fn db_with(texts: &[(i64, &str)]) -> Arc<dyn Database> {
        let db = LibSqlBackend::new_memory().await.unwrap();
        for (id, text) in texts {
            db.insert_message_if_new(&NewMessage {
                source_id: "remote_jobs".into(),
                chat_id: -1001,
                message_id: *id,
                date: Some(Utc::now()),
                sender_id: None,
                text: text.to_string(),
                permalink: Some(format!("https://t.me/remotejobs/{id}")),
                raw_payload: None,
            })
            .await
            .unwrap();
            db.mark_message_classified("remote_jobs", *id, true, 2.0)
                .await
                .unwrap();
        }
        Arc::new(db)
    }

    fn pass(db: Arc<dyn Database>, cv: &Path, enabled: bool) -> ApplyPass {
        let config = ApplyConfig {
            apply_enabled: enabled,
            max_per_run: 10,
            send_delay: Duration::ZERO,
        };
        ApplyPass::new(db, profiles(cv), Sender::new(Arc::new(OkTransport), config))
    }

    fn cv(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("jane.pdf");
        std::fs::write(&path, b"%PDF-1.4 cv").unwrap();
        path
    }

    #[tokio::test]
    async fn plans_drafts_and_skips() {
        let dir = TempDir::new().unwrap();
        let cv = cv(&dir);
        let db = db_with(&[
            (1, "Python Developer\nApply: jobs@example.com"),
            (2, "Python role, no contact"),
            (3, "Python dev, write a@example.com or b@example.com"),
            (4, "Golang engineer jobs@example.com"),
        ])
        .await;
        let mut ledger = OutboxLedger::open(dir.path().join("outbox")).await.unwrap();

        let report = pass(db, &cv, false)
            .run(&mut ledger, &ApplyOptions::default())
            .await
            .unwrap();
        assert_eq!(report.messages, 4);
        assert_eq!(report.drafts, 1);
        assert_eq!(report.skip_reasons["no_email_found"], 1);
        assert_eq!(report.skip_reasons["multiple_emails_ambiguous"], 1);
        assert_eq!(report.skip_reasons["no_match"], 1);

        let drafts = ledger.pending_entries().await.unwrap();
        assert_eq!(drafts.len(), 1);
        let draft = &drafts[0];
        assert_eq!(draft.subject.as_deref(), Some("Application: Python Developer"));
        assert_eq!(draft.body.as_deref(), Some("Jane Doe re https://t.me/remotejobs/1"));
        assert_eq!(draft.dedupe_key.as_deref(), Some("-1001:1:jobs@example.com"));
    }

    #[tokio::test]
    async fn second_run_marks_duplicates() {
        let dir = TempDir::new().unwrap();
        let cv = cv(&dir);
        let db = db_with(&[(1, "Python Developer jobs@example.com")]).await;
        let mut ledger = OutboxLedger::open(dir.path().join("outbox")).await.unwrap();

        pass(db.clone(), &cv, false)
            .run(&mut ledger, &ApplyOptions::default())
            .await
            .unwrap();
        let again = pass(db, &cv, false)
            .run(&mut ledger, &ApplyOptions::default())
            .await
            .unwrap();
        assert_eq!(again.drafts, 0);
        assert_eq!(again.skip_reasons["duplicate"], 1);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let cv = cv(&dir);
        let db = db_with(&[(1, "Python Developer jobs@example.com")]).await;
        let mut ledger = OutboxLedger::open(dir.path().join("outbox")).await.unwrap();

        let options = ApplyOptions {
            dry_run: true,
            send: true,
            ..Default::default()
        };
        let report = pass(db, &cv, false).run(&mut ledger, &options).await.unwrap();
        assert_eq!(report.drafts, 1);
        assert_eq!(report.would_send, 1);
        assert_eq!(report.sent, 0);
        assert_eq!(ledger.statistics().await.unwrap().total, 0);
        assert!(!ledger.is_duplicate("-1001:1:jobs@example.com"));
    }

    #[tokio::test]
    async fn send_moves_drafts_to_sent() {
        let dir = TempDir::new().unwrap();
        let cv = cv(&dir);
        let db = db_with(&[(1, "Python Developer jobs@example.com")]).await;
        let mut ledger = OutboxLedger::open(dir.path().join("outbox")).await.unwrap();

        let options = ApplyOptions {
            send: true,
            ..Default::default()
        };
        let report = pass(db, &cv, true).run(&mut ledger, &options).await.unwrap();
        assert_eq!(report.sent, 1);

        let entries = ledger.entries().await.unwrap();
        assert_eq!(entries[0].status, OutboxStatus::Sent);
        // draft -> pending -> sent
        assert_eq!(entries[0].attempt_count, 2);
        assert_eq!(entries[0].transport_response.as_deref(), Some("250 OK"));
    }

    #[tokio::test]
    async fn disabled_send_records_security_gate() {
        let dir = TempDir::new().unwrap();
        let cv = cv(&dir);
        let db = db_with(&[(1, "Python Developer jobs@example.com")]).await;
        let mut ledger = OutboxLedger::open(dir.path().join("outbox")).await.unwrap();

        let options = ApplyOptions {
            send: true,
            ..Default::default()
        };
        let report = pass(db, &cv, false).run(&mut ledger, &options).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.skip_reasons["security_gate"], 1);

        let entry = &ledger.entries().await.unwrap()[0];
        assert_eq!(entry.status, OutboxStatus::Skipped);
        assert_eq!(entry.skip_reason.as_deref(), Some("security_gate"));
        assert!(entry.last_error.as_deref().unwrap().contains("disabled"));
    }

    #[tokio::test]
    async fn invalid_indices_are_recorded() {
        let dir = TempDir::new().unwrap();
        let cv = cv(&dir);
        let db = db_with(&[
            (1, "Python dev a@example.com b@example.com"),
            (2, "Python dev c@example.com"),
        ])
        .await;
        let mut ledger = OutboxLedger::open(dir.path().join("outbox")).await.unwrap();

        let options = ApplyOptions {
            pick_email: Some(5),
            template: Some(3),
            ..Default::default()
        };
        let report = pass(db, &cv, false).run(&mut ledger, &options).await.unwrap();
        assert_eq!(report.skip_reasons["invalid_email_index"], 1);
        assert_eq!(report.skip_reasons["invalid_template_index"], 1);
    }

    #[tokio::test]
    async fn ledger_write_failure_does_not_stop_the_send_pass() {
        let dir = TempDir::new().unwrap();
        let cv = cv(&dir);
        let db = db_with(&[
            (1, "Python Developer a@example.com"),
            (2, "Django Developer b@example.com"),
        ])
        .await;
        let outbox = dir.path().join("outbox");
        let mut ledger = OutboxLedger::open(&outbox).await.unwrap();
        pass(db.clone(), &cv, true)
            .run(&mut ledger, &ApplyOptions::default())
            .await
            .unwrap();

        // Move the drafts to an older partition and block today's with a directory.
        let today = outbox.join(format!("outbox_{}.jsonl", Utc::now().format("%Y%m%d")));
        std::fs::rename(&today, outbox.join("outbox_20000101.jsonl")).unwrap();
        std::fs::create_dir(&today).unwrap();

        let mut ledger = OutboxLedger::open(&outbox).await.unwrap();
        let options = ApplyOptions {
            send: true,
            ..Default::default()
        };
        let report = pass(db, &cv, true).run(&mut ledger, &options).await.unwrap();
        assert_eq!(report.errors, 2);
        assert_eq!(report.sent, 0);

        let stats = ledger.statistics().await.unwrap();
        assert_eq!(stats.draft, 2);
    }

    #[tokio::test]
    async fn dry_run_blocked_previews_are_not_skips() {
        let dir = TempDir::new().unwrap();
        let missing_cv = dir.path().join("missing.pdf");
        let db = db_with(&[(1, "Python Developer jobs@example.com")]).await;
        let mut ledger = OutboxLedger::open(dir.path().join("outbox")).await.unwrap();

        let options = ApplyOptions {
            dry_run: true,
            send: true,
            ..Default::default()
        };
        let report = pass(db, &missing_cv, true)
            .run(&mut ledger, &options)
            .await
            .unwrap();
        assert_eq!(report.messages, 1);
        assert_eq!(report.drafts, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.would_send, 0);
        assert_eq!(report.would_block, 1);
    }
}
