//! Error types for the job scanner.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Safety error: {0}")]
    Safety(#[from] SafetyError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

impl Error {
    /// Retry-after hint when this error came from a rate-limited source.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Channel(ChannelError::RateLimited { retry_after, .. }) => Some(*retry_after),
            Self::Pipeline(PipelineError::RateLimited { retry_after, .. }) => Some(*retry_after),
            _ => None,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors from the external chat source and the mail transport.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Rate limited on channel {name}, retry after {}s", retry_after.as_secs())]
    RateLimited { name: String, retry_after: Duration },

    #[error("Could not resolve source {source_id}: {reason}")]
    EntityResolution { source_id: String, reason: String },

    #[error("Channel {name} fetch failed: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Outbox ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Outbox entry {outbox_id} not found")]
    NotFound { outbox_id: Uuid },

    #[error("Outbox entry {outbox_id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        outbox_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Dedupe key {dedupe_key} was already sent by entry {sent_by}")]
    DuplicateSend { dedupe_key: String, sent_by: Uuid },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller input that cannot be acted on. Recorded per item, never retried.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Email index {index} out of range ({len} candidates)")]
    EmailIndexOutOfRange { index: usize, len: usize },

    #[error("Template index {index} out of range for profile {profile_id} ({len} templates)")]
    TemplateIndexOutOfRange {
        profile_id: String,
        index: usize,
        len: usize,
    },

    #[error("Profile {profile_id} has no email templates")]
    NoTemplates { profile_id: String },

    #[error("Attachment not found: {}", path.display())]
    AttachmentMissing { path: PathBuf },

    #[error("Attachment {} is not a PDF document: {reason}", path.display())]
    AttachmentType { path: PathBuf, reason: String },

    #[error("Invalid keyword rule: {0}")]
    InvalidRule(String),
}

/// Send gates. Deliberately blocking; never retried by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    #[error("Sending is disabled (set APPLY_ENABLED=true to enable)")]
    SendingDisabled,

    #[error("Per-run send cap reached ({max})")]
    RateCapReached { max: u32 },
}

/// Batch-pass errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Source {source_id} not found in configuration")]
    UnknownSource { source_id: String },

    #[error("Source {source_id} rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited {
        source_id: String,
        retry_after: Duration,
    },

    #[error("Report write failed: {0}")]
    Report(String),

    #[error("Export failed: {0}")]
    Export(String),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
