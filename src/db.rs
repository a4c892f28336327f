//! SQLite connection pool shared by every store.
//!
//! WAL keeps readers unblocked while the stores run their short write
//! transactions; `synchronous = NORMAL` is the standard pairing for it.
//! The busy timeout covers the window where the startup expiry sweep
//! and a turn's commits overlap on the single writer.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::config::Config;

/// How long a writer queues before SQLITE_BUSY surfaces.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The engine loop is sequential, so concurrency comes only from tool
/// dispatch, the shortlist fetch workers, and the background sweep. A
/// small pool covers all of them.
const MAX_CONNECTIONS: u32 = 5;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = config.data.db_path();

    // First run: the data directory may not exist yet.
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    Ok(pool)
}
