//! Schema migrations for the message store.
//!
//! Versions are recorded in `_migrations`; only versions above the highest
//! recorded one are applied, in order.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "ingestion_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS ingestion_cursors (
                source_id TEXT PRIMARY KEY,
                chat_id INTEGER NOT NULL,
                last_message_id INTEGER NOT NULL DEFAULT 0,
                last_message_date TEXT,
                last_run_at TEXT NOT NULL,
                last_run_status TEXT NOT NULL,
                last_error TEXT
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                chat_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                date TEXT,
                sender_id INTEGER,
                text TEXT NOT NULL,
                permalink TEXT,
                raw_payload TEXT,
                ingested_at TEXT NOT NULL,
                processed_status TEXT NOT NULL DEFAULT 'pending',
                is_relevant INTEGER,
                relevance_score REAL,
                classified_at TEXT,
                UNIQUE (source_id, message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_source ON messages(source_id);
            CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(processed_status);
        "#,
    },
    Migration {
        version: 2,
        name: "classification_audit",
        sql: r#"
            CREATE TABLE IF NOT EXISTS message_classifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                chat_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                classifier_version TEXT NOT NULL,
                is_relevant INTEGER NOT NULL,
                score REAL NOT NULL,
                reasons TEXT NOT NULL,
                metadata TEXT NOT NULL,
                classified_at TEXT NOT NULL,
                UNIQUE (source_id, message_id, classifier_version)
            );
            CREATE INDEX IF NOT EXISTS idx_classifications_relevant
                ON message_classifications(is_relevant);
            CREATE INDEX IF NOT EXISTS idx_messages_relevant ON messages(is_relevant);
        "#,
    },
];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

fn migration_error(step: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Migration(format!("{step}: {e}"))
}

/// Bring the schema up to the latest version. Safe to call on every open.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(VERSION_TABLE, ())
        .await
        .map_err(|e| migration_error("create _migrations", e))?;

    let applied = current_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);

    for migration in pending {
        tracing::info!(version = migration.version, name = migration.name, "Applying migration");

        // Schema change and its version row land together or not at all.
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            migration.sql, migration.version, migration.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(migration_error(
                &format!("V{} {}", migration.version, migration.name),
                e,
            ));
        }
    }

    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| migration_error("read version", e))?;

    match rows.next().await.map_err(|e| migration_error("read version", e))? {
        Some(row) => row.get(0).map_err(|e| migration_error("parse version", e)),
        None => Ok(0),
    }
}
