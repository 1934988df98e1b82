//! End-to-end: ingest → classify → apply against a stub chat feed and a stub mailer.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use job_scanner::apply::{ApplyOptions, ApplyPass, Sender};
use job_scanner::channels::{
    ChatSource, EntityHandle, MailEnvelope, MailTransport, RawMessage, TransportReceipt,
};
use job_scanner::config::{ApplicantProfile, ApplyConfig, SourceConfig, SourcesFile, parse_profiles};
use job_scanner::error::ChannelError;
use job_scanner::outbox::{OutboxLedger, OutboxStatus};
use job_scanner::pipeline::{ClassifyOptions, Classifier, IngestOptions, Ingestor, RuleTable};
use job_scanner::store::{Database, LibSqlBackend};

struct StubChat {
    messages: Vec<RawMessage>,
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
        Ok(self
            .messages
            .iter()
            .filter(|m| m.message_id > watermark)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct StubMailer {
    sent: Mutex<Vec<MailEnvelope>>,
}

#[async_trait]
impl MailTransport for StubMailer {
    async fn send_mail(
        &self,
        envelope: &MailEnvelope,
        attachment: &[u8],
    ) -> Result<TransportReceipt, ChannelError> {
        assert!(attachment.starts_with(b"%PDF"));
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(TransportReceipt {
            accepted: true,
            diagnostic: "250 2.0.0 queued".into(),
        })
    }
}

fn message(id: i64, text: &str) -> RawMessage {
    RawMessage {
        message_id: id,
        date: Some(Utc::now()),
        sender_id: Some(42),
        text: Some(text.into()),
        raw: serde_json::json!({ "message_id": id, "text": text }),
    }
}

fn sources() -> SourcesFile {
    SourcesFile::parse(
        "sources:
  - source_id: remote_jobs
    display_name: Remote Jobs
    type: channel
    public_handle: \"@remotejobs\"
    validation_status: joined
",
    )
    .unwrap()
}

fn profiles(cv: &Path) -> BTreeMap<String, ApplicantProfile> {
    parse_profiles(&format!(
        "applicants:
  python_dev:
    applicant_name: Jane Doe
    cv_path: {}
    threshold: 1.0
    keywords_positive: [python, django, backend]
    keywords_negative: [php]
    email_templates:
      - subject: \"Application: {{{{JOB_TITLE}}}}\"
        body: \"Hello, I am {{{{APPLICANT_NAME}}}}. Saw your post at {{{{SOURCE_LINK}}}}.\"
",
        cv.display()
    ))
    .unwrap()
}

struct Harness {
    _dir: TempDir,
    db: Arc<dyn Database>,
    outbox_dir: std::path::PathBuf,
    cv: std::path::PathBuf,
}

async fn harness(messages: Vec<RawMessage>) -> Harness {
    let dir = TempDir::new().unwrap();
    let cv = dir.path().join("jane_doe.pdf");
    std::fs::write(&cv, b"%PDF-1.4\n% test cv\n").unwrap();

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let chat = Arc::new(StubChat { messages });

    Ingestor::new(db.clone(), chat)
        .ingest_all(&sources(), &IngestOptions::default())
        .await
        .unwrap();
    Classifier::new(db.clone(), RuleTable::builtin())
        .run(&ClassifyOptions::default())
        .await
        .unwrap();

    Harness {
        outbox_dir: dir.path().join("outbox"),
        _dir: dir,
        db,
        cv,
    }
}

fn apply_pass(h: &Harness, mailer: Arc<StubMailer>, enabled: bool, max: u32) -> ApplyPass {
    let config = ApplyConfig {
        apply_enabled: enabled,
        max_per_run: max,
        send_delay: Duration::ZERO,
    };
    ApplyPass::new(h.db.clone(), profiles(&h.cv), Sender::new(mailer, config))
}

#[tokio::test]
async fn relevant_posting_becomes_a_draft() {
    let h = harness(vec![message(
        1,
        "Senior Python Developer needed, remote, apply to jobs@example.com",
    )])
    .await;

    let stored = h.db.get_message("remote_jobs", 1).await.unwrap().unwrap();
    assert_eq!(stored.is_relevant, Some(true));
    assert!(stored.relevance_score.unwrap() >= 1.0);

    let mut ledger = OutboxLedger::open(&h.outbox_dir).await.unwrap();
    let mailer = Arc::new(StubMailer::default());
    let report = apply_pass(&h, mailer.clone(), false, 10)
        .run(&mut ledger, &ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(report.drafts, 1);

    let entries = ledger.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    let draft = &entries[0];
    assert_eq!(draft.status, OutboxStatus::Draft);
    assert_eq!(draft.profile_id.as_deref(), Some("python_dev"));
    assert_eq!(draft.selected_email.as_deref(), Some("jobs@example.com"));
    assert_eq!(draft.dedupe_key.as_deref(), Some("-1001:1:jobs@example.com"));
    assert_eq!(
        draft.subject.as_deref(),
        Some("Application: Senior Python Developer needed, remote, apply to jobs@example.com")
    );
    assert!(draft
        .body
        .as_deref()
        .unwrap()
        .contains("https://t.me/remotejobs/1"));
    assert!(mailer.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn resubmission_is_recorded_as_duplicate() {
    let h = harness(vec![message(1, "Python backend developer, email jobs@example.com")]).await;
    let mailer = Arc::new(StubMailer::default());

    let mut ledger = OutboxLedger::open(&h.outbox_dir).await.unwrap();
    apply_pass(&h, mailer.clone(), false, 10)
        .run(&mut ledger, &ApplyOptions::default())
        .await
        .unwrap();

    // Fresh process: the dedupe index is rebuilt from disk.
    let mut ledger = OutboxLedger::open(&h.outbox_dir).await.unwrap();
    let report = apply_pass(&h, mailer, false, 10)
        .run(&mut ledger, &ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(report.drafts, 0);
    assert_eq!(report.skip_reasons.get("duplicate"), Some(&1));

    let stats = ledger.statistics().await.unwrap();
    assert_eq!(stats.draft, 1);
    assert_eq!(stats.by_skip_reason.get("duplicate"), Some(&1));
}

#[tokio::test]
async fn two_addresses_are_ambiguous() {
    let h = harness(vec![message(
        1,
        "Python developer. Contact hr@example.com or cto@example.com",
    )])
    .await;
    let mut ledger = OutboxLedger::open(&h.outbox_dir).await.unwrap();

    let report = apply_pass(&h, Arc::new(StubMailer::default()), false, 10)
        .run(&mut ledger, &ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(report.skip_reasons.get("multiple_emails_ambiguous"), Some(&1));

    let entry = &ledger.entries().await.unwrap()[0];
    assert_eq!(entry.status, OutboxStatus::Skipped);
    assert_eq!(entry.dedupe_key, None);
    assert_eq!(entry.extracted_emails.len(), 2);
}

#[tokio::test]
async fn irrelevant_postings_never_reach_the_outbox() {
    let h = harness(vec![
        message(1, "Barista wanted, send CV to cafe@example.com"),
        message(2, "Remote work from home opportunity, flexible schedule"),
    ])
    .await;
    let mut ledger = OutboxLedger::open(&h.outbox_dir).await.unwrap();

    let report = apply_pass(&h, Arc::new(StubMailer::default()), false, 10)
        .run(&mut ledger, &ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(report.messages, 0);
    assert_eq!(ledger.statistics().await.unwrap().total, 0);
}

#[tokio::test]
async fn sending_is_gated_and_capped() {
    let h = harness(vec![
        message(1, "Python developer wanted: a@example.com"),
        message(2, "Django backend role: b@example.com"),
        message(3, "Python backend engineer: c@example.com"),
    ])
    .await;
    let mailer = Arc::new(StubMailer::default());

    // Disabled: --send records a security gate skip and nothing leaves.
    {
        let dir = h.outbox_dir.join("disabled");
        let mut ledger = OutboxLedger::open(&dir).await.unwrap();
        let options = ApplyOptions {
            send: true,
            ..Default::default()
        };
        let report = apply_pass(&h, mailer.clone(), false, 10)
            .run(&mut ledger, &options)
            .await
            .unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.skip_reasons.get("security_gate"), Some(&3));
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    // Enabled with a cap of two.
    let mut ledger = OutboxLedger::open(h.outbox_dir.join("enabled")).await.unwrap();
    let options = ApplyOptions {
        send: true,
        ..Default::default()
    };
    let report = apply_pass(&h, mailer.clone(), true, 2)
        .run(&mut ledger, &options)
        .await
        .unwrap();
    assert_eq!(report.sent, 2);
    assert_eq!(report.skip_reasons.get("security_gate"), Some(&1));
    assert_eq!(mailer.sent.lock().unwrap().len(), 2);

    let stats = ledger.statistics().await.unwrap();
    assert_eq!(stats.sent, 2);
    assert_eq!(stats.skipped, 1);

    for entry in ledger.entries().await.unwrap() {
        if entry.status == OutboxStatus::Sent {
            assert!(entry.sent_at.is_some());
            assert_eq!(entry.transport_response.as_deref(), Some("250 2.0.0 queued"));
        }
    }
}

#[tokio::test]
async fn dry_run_send_previews_without_writing() {
    let h = harness(vec![message(1, "Python developer wanted: a@example.com")]).await;
    let mailer = Arc::new(StubMailer::default());
    let mut ledger = OutboxLedger::open(&h.outbox_dir).await.unwrap();

    let options = ApplyOptions {
        send: true,
        dry_run: true,
        ..Default::default()
    };
    let report = apply_pass(&h, mailer.clone(), false, 10)
        .run(&mut ledger, &options)
        .await
        .unwrap();
    assert_eq!(report.would_send, 1);
    assert!(mailer.sent.lock().unwrap().is_empty());
    assert_eq!(ledger.statistics().await.unwrap().total, 0);
}
