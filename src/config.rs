//! Configuration types.
//!
//! Paths and send settings come from the environment; sources and applicant
//! profiles come from YAML files validated at load time.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default relevance threshold for a profile.
pub const DEFAULT_PROFILE_THRESHOLD: f64 = 0.7;

// ── Paths ───────────────────────────────────────────────────────────

/// File locations used by every pass.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub sources_path: PathBuf,
    pub applicants_path: PathBuf,
    pub outbox_dir: PathBuf,
    pub report_dir: PathBuf,
    pub export_dir: PathBuf,
    /// Optional directory for a rolling log file.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: env_path("JOBSCAN_DB_PATH", "./data/db/jobscan.db"),
            sources_path: env_path("JOBSCAN_SOURCES", "./config/sources.yaml"),
            applicants_path: env_path("JOBSCAN_APPLICANTS", "./config/applicants.yaml"),
            outbox_dir: env_path("JOBSCAN_OUTBOX_DIR", "./data/outbox"),
            report_dir: env_path("JOBSCAN_REPORT_DIR", "./data/reports"),
            export_dir: env_path("JOBSCAN_EXPORT_DIR", "./data/review"),
            log_dir: std::env::var("JOBSCAN_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(std::env::var(key).unwrap_or_else(|_| default.to_string()))
}

// ── Sending ─────────────────────────────────────────────────────────

/// Settings for the send gates.
#[derive(Debug, Clone)]
pub struct ApplyConfig {
    /// Global enablement signal. Absent means disabled.
    pub apply_enabled: bool,
    /// Maximum send attempts in a single run.
    pub max_per_run: u32,
    /// Fixed pause between real sends.
    pub send_delay: Duration,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            apply_enabled: false,
            max_per_run: 10,
            send_delay: Duration::from_secs(5),
        }
    }
}

impl ApplyConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let apply_enabled = parse_enabled(std::env::var("APPLY_ENABLED").ok().as_deref());

        let max_per_run: u32 = std::env::var("APPLY_MAX_PER_RUN")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_per_run);

        let send_delay = std::env::var("APPLY_SEND_DELAY_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.send_delay);

        Self {
            apply_enabled,
            max_per_run,
            send_delay,
        }
    }
}

/// Only an explicit "true" enables sending.
pub fn parse_enabled(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

// ── Sources ─────────────────────────────────────────────────────────

/// Kind of chat entity a source points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Channel,
    Group,
}

/// Last-known access status of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Pending,
    Joined,
    JoinFailed,
    Blocked,
    NotApplicable,
}

impl ValidationStatus {
    /// Whether an ingestion pass may read this source without `--force`.
    pub fn is_ingestible(self) -> bool {
        matches!(self, Self::Joined | Self::NotApplicable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Joined => "joined",
            Self::JoinFailed => "join_failed",
            Self::Blocked => "blocked",
            Self::NotApplicable => "not_applicable",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An external feed to ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_entity_id: Option<i64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub validation_status: ValidationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn default_true() -> bool {
    true
}

impl SourceConfig {
    /// Public handle without a leading `@`.
    pub fn handle(&self) -> Option<&str> {
        self.public_handle
            .as_deref()
            .map(|h| h.trim_start_matches('@'))
            .filter(|h| !h.is_empty())
    }

    fn has_access_descriptor(&self) -> bool {
        self.handle().is_some() || self.invite_link.is_some() || self.resolved_entity_id.is_some()
    }
}

/// Contents of `sources.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcesFile {
    pub sources: Vec<SourceConfig>,
}

impl SourcesFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::MissingRequired {
            key: path.display().to_string(),
            hint: format!("could not read sources file: {e}"),
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let file: Self =
            serde_yaml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (idx, source) in self.sources.iter().enumerate() {
            if source.source_id.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: format!("sources[{idx}].source_id"),
                    hint: "every source needs a stable id".into(),
                });
            }
            if source.display_name.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: format!("sources[{idx}].display_name"),
                    hint: format!("source {} has an empty display name", source.source_id),
                });
            }
            if !seen.insert(source.source_id.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: format!("sources[{idx}].source_id"),
                    message: format!("duplicate source id {}", source.source_id),
                });
            }
            if source.enabled && !source.has_access_descriptor() {
                return Err(ConfigError::MissingRequired {
                    key: format!("sources[{idx}]"),
                    hint: format!(
                        "source {} needs public_handle, invite_link or resolved_entity_id",
                        source.source_id
                    ),
                });
            }
        }
        Ok(())
    }

    /// Write the file back, used after a validation pass.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, raw)?;
        Ok(())
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Record the outcome of an access check. Returns false if the id is unknown.
    pub fn update_validation(
        &mut self,
        source_id: &str,
        status: ValidationStatus,
        resolved_entity_id: Option<i64>,
        last_error: Option<String>,
    ) -> bool {
        let Some(source) = self.sources.iter_mut().find(|s| s.source_id == source_id) else {
            return false;
        };
        source.validation_status = status;
        source.last_validated_at = Some(Utc::now());
        source.last_error = last_error;
        if resolved_entity_id.is_some() {
            source.resolved_entity_id = resolved_entity_id;
        }
        true
    }
}

// ── Applicant profiles ──────────────────────────────────────────────

/// One subject/body pair with `{{JOB_TITLE}}`-style placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub subject: String,
    pub body: String,
}

/// Applicant configuration used by routing and templating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicantProfile {
    /// Filled from the map key at load time.
    #[serde(skip)]
    pub profile_id: String,
    pub applicant_name: String,
    pub cv_path: PathBuf,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    pub keywords_positive: Vec<String>,
    #[serde(default)]
    pub keywords_negative: Vec<String>,
    pub email_templates: Vec<EmailTemplate>,
}

fn default_threshold() -> f64 {
    DEFAULT_PROFILE_THRESHOLD
}

#[derive(Debug, Deserialize)]
struct ApplicantsFile {
    applicants: BTreeMap<String, ApplicantProfile>,
}

/// Load and validate `applicants.yaml`. Profiles are keyed (and iterated) by id.
pub fn load_profiles(path: &Path) -> Result<BTreeMap<String, ApplicantProfile>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::MissingRequired {
        key: path.display().to_string(),
        hint: format!("could not read applicants file: {e}"),
    })?;
    parse_profiles(&raw)
}

pub fn parse_profiles(raw: &str) -> Result<BTreeMap<String, ApplicantProfile>, ConfigError> {
    let file: ApplicantsFile =
        serde_yaml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    let mut profiles = BTreeMap::new();
    for (id, mut profile) in file.applicants {
        profile.profile_id = id.clone();
        validate_profile(&profile)?;
        profiles.insert(id, profile);
    }
    if profiles.is_empty() {
        return Err(ConfigError::MissingRequired {
            key: "applicants".into(),
            hint: "define at least one applicant profile".into(),
        });
    }
    Ok(profiles)
}

fn validate_profile(profile: &ApplicantProfile) -> Result<(), ConfigError> {
    let id = &profile.profile_id;
    if profile.applicant_name.trim().is_empty() {
        return Err(ConfigError::MissingRequired {
            key: format!("applicants.{id}.applicant_name"),
            hint: "the name is used in email templates".into(),
        });
    }
    if profile.cv_path.as_os_str().is_empty() {
        return Err(ConfigError::MissingRequired {
            key: format!("applicants.{id}.cv_path"),
            hint: "a PDF document is attached to every application".into(),
        });
    }
    if !profile.keywords_positive.iter().any(|k| !k.trim().is_empty()) {
        return Err(ConfigError::MissingRequired {
            key: format!("applicants.{id}.keywords_positive"),
            hint: "routing needs at least one positive keyword".into(),
        });
    }
    if profile.email_templates.is_empty() {
        return Err(ConfigError::MissingRequired {
            key: format!("applicants.{id}.email_templates"),
            hint: "define at least one subject/body template".into(),
        });
    }
    if !profile.threshold.is_finite() {
        return Err(ConfigError::InvalidValue {
            key: format!("applicants.{id}.threshold"),
            message: "must be a finite number".into(),
        });
    }
    Ok(())
}
