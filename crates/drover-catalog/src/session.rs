use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, SqliteConnection};

/// Open a short-lived connection to the catalog database.
///
/// WAL journal mode so worker subprocesses can write while the
/// orchestrator reads; a busy timeout instead of immediate SQLITE_BUSY
/// failures when a writer holds the lock.
pub async fn open(db_path: &Path) -> Result<SqliteConnection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create catalog directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let conn = options
        .connect()
        .await
        .with_context(|| format!("failed to open catalog at {}", db_path.display()))?;

    Ok(conn)
}

/// Create the catalog schema if it does not exist yet.
///
/// The initializer worker normally seeds the catalog, but the schema must
/// be present before `has_any_features` can answer on a fresh project.
pub async fn ensure_schema(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS features ( \
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             name TEXT NOT NULL, \
             description TEXT NOT NULL DEFAULT '', \
             category TEXT NOT NULL DEFAULT 'core', \
             priority INTEGER NOT NULL DEFAULT 1, \
             dependencies TEXT NOT NULL DEFAULT '[]', \
             passes INTEGER NOT NULL DEFAULT 0, \
             in_progress INTEGER NOT NULL DEFAULT 0, \
             created_at TEXT NOT NULL \
         )",
    )
    .execute(conn)
    .await
    .context("failed to create features table")?;

    Ok(())
}
