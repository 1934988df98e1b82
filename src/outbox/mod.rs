//! Durable record of every application decision and send attempt.

pub mod ledger;
pub mod model;

pub use ledger::{OutboxLedger, latest_version, latest_versions};
pub use model::{
    EntryUpdate, NewOutboxEntry, OutboxEntry, OutboxStats, OutboxStatus, SkipReason, dedupe_key,
};
