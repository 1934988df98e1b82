//! Persistence layer: libSQL-backed storage for cursors, messages and classifications.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ClassificationRecord, ClassificationStats, Cursor, Database, NewMessage, ProcessedStatus,
    RelevantMessage, RunStatus, SourceMessageStats, StoredMessage,
};
