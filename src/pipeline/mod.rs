//! Message pipeline: ingest, classify, route.
//!
//! Each stage is a batch pass over durable state:
//! 1. `ingest` pulls new chat messages into the store (redacting codes)
//! 2. `classify` scores stored messages against the keyword rules
//! 3. `routing` picks an applicant profile and a recipient for relevant ones
//!
//! Nothing here sends mail. Outbound email only leaves through `apply`.

pub mod classify;
pub mod ingest;
pub mod matcher;
pub mod routing;
pub mod rules;
pub mod sanitize;
pub mod templates;
pub mod validate;

pub use classify::{ClassifyOptions, ClassifyReport, Classifier, export_candidates};
pub use ingest::{IngestOptions, IngestReport, Ingestor, SourceIngestResult};
pub use routing::{EmailSelection, RoutingDecision, extract_emails, route, select_email};
pub use rules::{Classification, RuleTable, classify};
pub use validate::{ValidationReport, validate_sources};
