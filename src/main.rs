use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use job_scanner::apply::{ApplyOptions, ApplyPass, Sender};
use job_scanner::channels::{
    MailEnvelope, MailTransport, SmtpConfig, SmtpMailer, TelegramConfig, TelegramSource,
    TransportReceipt,
};
use job_scanner::config::{AppConfig, ApplyConfig, SourcesFile, load_profiles};
use job_scanner::error::ChannelError;
use job_scanner::outbox::OutboxLedger;
use job_scanner::pipeline::{
    ClassifyOptions, Classifier, IngestOptions, Ingestor, RuleTable, export_candidates,
    validate_sources,
};
use job_scanner::report::write_report;
use job_scanner::store::{Database, LibSqlBackend};

/// Exit status when a pass stopped on a source rate limit (EX_TEMPFAIL).
const EXIT_RATE_LIMITED: u8 = 75;

/// Scan chat job feeds, classify postings and send routed applications.
#[derive(Parser, Debug)]
#[command(name = "job-scanner", version, about, long_about = None)]
struct Cli {
    /// Message store path (overrides JOBSCAN_DB_PATH).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that each enabled source is reachable.
    ValidateSources {
        #[arg(long)]
        sources: Option<PathBuf>,
        #[arg(long)]
        only: Option<String>,
        /// Write statuses back to the sources file.
        #[arg(long)]
        write_back: bool,
    },
    /// Pull new messages from sources into the store.
    Ingest {
        #[arg(long)]
        sources: Option<PathBuf>,
        #[arg(long)]
        only: Option<String>,
        #[arg(long, default_value_t = job_scanner::pipeline::ingest::DEFAULT_LIMIT_PER_SOURCE)]
        limit_per_source: usize,
        /// Ignore validation status.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },
    /// Classify stored messages for relevance.
    Classify {
        #[arg(long, default_value_t = job_scanner::pipeline::classify::DEFAULT_CLASSIFY_LIMIT)]
        limit: usize,
        #[arg(long)]
        only: Option<String>,
        /// Reclassify messages that already have a verdict.
        #[arg(long)]
        reprocess: bool,
        #[arg(long)]
        dry_run: bool,
        /// Export relevant messages to CSV after classifying.
        #[arg(long)]
        export: bool,
        #[arg(long)]
        export_limit: Option<usize>,
        #[arg(long)]
        export_dir: Option<PathBuf>,
    },
    /// Route relevant messages into the outbox and optionally send drafts.
    Apply {
        #[arg(long)]
        applicants: Option<PathBuf>,
        #[arg(long)]
        outbox_dir: Option<PathBuf>,
        /// Send drafts (requires APPLY_ENABLED=true unless --dry-run).
        #[arg(long)]
        send: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        max_per_run: Option<u32>,
        #[arg(long)]
        limit: Option<usize>,
        /// Recipient index when a posting lists several addresses.
        #[arg(long)]
        pick_email: Option<usize>,
        /// Template index within the chosen profile.
        #[arg(long)]
        template: Option<usize>,
    },
    /// Print store and outbox statistics.
    Stats {
        #[arg(long)]
        outbox_dir: Option<PathBuf>,
    },
}

/// Stand-in transport when SMTP is not configured. Only reachable from dry runs
/// and disabled sends, which never call it.
struct UnconfiguredTransport;

#[async_trait]
impl MailTransport for UnconfiguredTransport {
    async fn send_mail(
        &self,
        _envelope: &MailEnvelope,
        _attachment: &[u8],
    ) -> Result<TransportReceipt, ChannelError> {
        Err(ChannelError::SendFailed {
            name: "email".into(),
            reason: "SMTP is not configured (set SMTP_HOST)".into(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(db) = cli.db.clone() {
        config.db_path = db;
    }

    let _log_guard = init_tracing(&config);

    eprintln!("📡 Job Scanner v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());

    match cli.command {
        Commands::ValidateSources {
            sources,
            only,
            write_back,
        } => {
            let sources_path = sources.unwrap_or(config.sources_path.clone());
            let mut file = SourcesFile::load(&sources_path)?;
            let chat = TelegramSource::new(TelegramConfig::from_env()?);

            let report = validate_sources(&chat, &mut file, only.as_deref()).await?;
            if write_back {
                file.save(&sources_path)?;
                eprintln!("   Updated {}", sources_path.display());
            }
            write_report(&config.report_dir, "validation", &report).await?;

            eprintln!(
                "   Validated {} source(s): {} joined, {} failed",
                report.total, report.joined, report.failed
            );
            if report.rate_limited_retry_after_secs.is_some() {
                return Ok(ExitCode::from(EXIT_RATE_LIMITED));
            }
        }

        Commands::Ingest {
            sources,
            only,
            limit_per_source,
            force,
            dry_run,
            report_dir,
        } => {
            let file = SourcesFile::load(&sources.unwrap_or(config.sources_path.clone()))?;
            let db = open_db(&config).await?;
            let chat = Arc::new(TelegramSource::new(TelegramConfig::from_env()?));

            let options = IngestOptions {
                only,
                limit_per_source,
                dry_run,
                force,
            };
            let report = Ingestor::new(db, chat).ingest_all(&file, &options).await?;
            let report_path = write_report(
                &report_dir.unwrap_or(config.report_dir.clone()),
                "ingestion",
                &report,
            )
            .await?;

            eprintln!(
                "   Sources: {}  fetched: {}  inserted: {}  skipped: {}  errors: {}",
                report.total_sources,
                report.total_fetched,
                report.total_inserted,
                report.total_skipped,
                report.total_errors
            );
            eprintln!("   Report: {}", report_path.display());
            if let Some(secs) = report.rate_limited_retry_after_secs {
                eprintln!("   Rate limited: retry after {secs}s");
                return Ok(ExitCode::from(EXIT_RATE_LIMITED));
            }
        }

        Commands::Classify {
            limit,
            only,
            reprocess,
            dry_run,
            export,
            export_limit,
            export_dir,
        } => {
            let db = open_db(&config).await?;
            let options = ClassifyOptions {
                limit,
                only,
                reprocess,
                dry_run,
            };
            let report = Classifier::new(db.clone(), RuleTable::builtin())
                .run(&options)
                .await?;
            write_report(&config.report_dir, "classification", &report).await?;

            eprintln!(
                "   Processed: {}  relevant: {}  not relevant: {}  errors: {}",
                report.processed, report.relevant, report.not_relevant, report.errors
            );

            if export {
                let dir = export_dir.unwrap_or(config.export_dir.clone());
                let (path, rows) = export_candidates(db.as_ref(), &dir, export_limit).await?;
                eprintln!("   Exported {rows} candidate(s) to {}", path.display());
            }
        }

        Commands::Apply {
            applicants,
            outbox_dir,
            send,
            dry_run,
            max_per_run,
            limit,
            pick_email,
            template,
        } => {
            let profiles = load_profiles(&applicants.unwrap_or(config.applicants_path.clone()))?;
            let db = open_db(&config).await?;
            let mut ledger = OutboxLedger::open(outbox_dir.unwrap_or(config.outbox_dir.clone()))
                .await
                .context("Failed to open outbox")?;

            let mut apply_config = ApplyConfig::from_env();
            if let Some(max) = max_per_run {
                apply_config.max_per_run = max;
            }
            let transport: Arc<dyn MailTransport> = match SmtpConfig::from_env() {
                Ok(smtp) => Arc::new(SmtpMailer::new(smtp)),
                Err(e) if send && !dry_run && apply_config.apply_enabled => return Err(e.into()),
                Err(_) => Arc::new(UnconfiguredTransport),
            };
            eprintln!(
                "   Sending: {}  max per run: {}",
                if apply_config.apply_enabled { "enabled" } else { "disabled" },
                apply_config.max_per_run
            );

            let options = ApplyOptions {
                limit,
                pick_email,
                template,
                send,
                dry_run,
            };
            let sender = Sender::new(transport, apply_config);
            let report = ApplyPass::new(db, profiles, sender)
                .run(&mut ledger, &options)
                .await?;
            write_report(&config.report_dir, "apply", &report).await?;

            eprintln!(
                "   Messages: {}  drafts: {}  skipped: {}  sent: {}  failed: {}",
                report.messages, report.drafts, report.skipped, report.sent, report.failed
            );
            for (reason, count) in &report.skip_reasons {
                eprintln!("     {reason}: {count}");
            }
            if report.errors > 0 {
                eprintln!("   Errors: {}", report.errors);
            }
            if dry_run && send {
                eprintln!(
                    "   Would send: {}  would block: {}",
                    report.would_send, report.would_block
                );
            }
        }

        Commands::Stats { outbox_dir } => {
            let db = open_db(&config).await?;
            print_stats(db.as_ref(), outbox_dir.unwrap_or(config.outbox_dir.clone())).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "job-scanner.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

async fn open_db(config: &AppConfig) -> anyhow::Result<Arc<dyn Database>> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let db = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
    Ok(Arc::new(db))
}

async fn print_stats(db: &dyn Database, outbox_dir: PathBuf) -> anyhow::Result<()> {
    println!("Messages by source:");
    for s in db.message_stats_by_source().await? {
        println!(
            "  {:<24} total {:>6}  pending {:>6}  relevant {:>6}  max id {}",
            s.source_id, s.total, s.pending, s.relevant, s.max_message_id
        );
    }

    println!("Cursors:");
    for c in db.list_cursors().await? {
        println!(
            "  {:<24} last id {:>8}  {}  {}{}",
            c.source_id,
            c.last_message_id,
            c.last_run_status,
            c.last_run_at.format("%Y-%m-%d %H:%M:%S"),
            c.last_error
                .map(|e| format!("  ({e})"))
                .unwrap_or_default()
        );
    }

    let cls = db.classification_stats().await?;
    println!(
        "Classification: total {}  pending {}  classified {}  relevant {}  not relevant {}  avg score {}",
        cls.total,
        cls.pending,
        cls.classified,
        cls.relevant,
        cls.not_relevant,
        cls.avg_score
            .map(|s| format!("{s:.2}"))
            .unwrap_or_else(|| "-".into())
    );

    let ledger = OutboxLedger::open(outbox_dir).await?;
    let stats = ledger.statistics().await?;
    println!(
        "Outbox: total {}  draft {}  pending {}  sent {}  failed {}  skipped {}",
        stats.total, stats.draft, stats.pending, stats.sent, stats.failed, stats.skipped
    );
    for (reason, count) in &stats.by_skip_reason {
        println!("  {reason}: {count}");
    }
    for (profile, s) in ledger.statistics_by_profile().await? {
        println!(
            "  [{profile}] total {}  draft {}  sent {}  failed {}  skipped {}",
            s.total, s.draft, s.sent, s.failed, s.skipped
        );
    }
    Ok(())
}
