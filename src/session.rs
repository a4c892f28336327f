//! Persistent sessions and message history.
//!
//! Sessions are resumable: names are auto-generated from the first
//! query via stopword-filtered slugging, with duplicates resolved by
//! numeric suffix probing (`name-2`, `name-3`, …). Deleting a session
//! cascades to its findings (vector entries first, rows second), its
//! uploaded-document links, and its messages.
//!
//! A best-effort sticky lock file marks which process currently owns a
//! session; losing the lock is recoverable and never fatal.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::cache::Clock;
use crate::error::Error;
use crate::memory::MemoryStore;
use crate::models::{Session, StoredMessage};

const SLUG_STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "of", "in", "on", "for", "to", "with", "about", "is", "are",
    "what", "how", "why", "please", "me", "my", "can", "you", "summarize", "explain", "tell",
];
const SLUG_MAX_WORDS: usize = 4;

pub struct SessionStore {
    pool: SqlitePool,
    memory: Arc<MemoryStore>,
    clock: Arc<dyn Clock>,
    locks_dir: PathBuf,
}

impl SessionStore {
    pub fn new(
        pool: SqlitePool,
        memory: Arc<MemoryStore>,
        clock: Arc<dyn Clock>,
        locks_dir: PathBuf,
    ) -> Self {
        Self {
            pool,
            memory,
            clock,
            locks_dir,
        }
    }

    /// Create a session named after the first query. Duplicate names get
    /// a numeric suffix instead of prompting.
    pub async fn create(
        &self,
        first_query: &str,
        research_mode: bool,
        research_source_mode: Option<&str>,
        local_corpus_paths: &[String],
    ) -> Result<Session, Error> {
        let base = slug_from_query(first_query);
        let name = self.probe_free_name(&base).await?;
        let now = self.clock.now_unix();

        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            name,
            created_at: now,
            last_used_at: now,
            compacted_summary: None,
            research_mode,
            research_source_mode: research_source_mode.map(|s| s.to_string()),
            local_corpus_paths: local_corpus_paths.to_vec(),
        };

        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, name, created_at, last_used_at, research_mode, research_source_mode, local_corpus_paths_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.name)
        .bind(session.created_at)
        .bind(session.last_used_at)
        .bind(session.research_mode)
        .bind(&session.research_source_mode)
        .bind(serde_json::to_string(&session.local_corpus_paths).unwrap_or_else(|_| "[]".into()))
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    async fn probe_free_name(&self, base: &str) -> Result<String, Error> {
        let mut candidate = base.to_string();
        let mut suffix = 2usize;
        loop {
            let taken: bool =
                sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sessions WHERE name = ?")
                    .bind(&candidate)
                    .fetch_one(&self.pool)
                    .await?;
            if !taken {
                return Ok(candidate);
            }
            candidate = format!("{}-{}", base, suffix);
            suffix += 1;
            if suffix > 1000 {
                return Err(Error::Conflict(format!(
                    "could not find a free session name for '{}'",
                    base
                )));
            }
        }
    }

    /// Resolve a selector: exact session id, exact name, or unique id
    /// prefix.
    pub async fn resolve(&self, selector: &str) -> Result<Session, Error> {
        if let Some(session) = self.by_id(selector).await? {
            return Ok(session);
        }
        if let Some(session) = self.by_name(selector).await? {
            return Ok(session);
        }

        let matches: Vec<String> =
            sqlx::query_scalar("SELECT session_id FROM sessions WHERE session_id LIKE ? || '%'")
                .bind(selector)
                .fetch_all(&self.pool)
                .await?;
        match matches.len() {
            0 => Err(Error::not_found("session", selector.to_string())),
            1 => self
                .by_id(&matches[0])
                .await?
                .ok_or_else(|| Error::not_found("session", selector.to_string())),
            _ => Err(Error::Conflict(format!(
                "selector '{}' matches {} sessions",
                selector,
                matches.len()
            ))),
        }
    }

    pub async fn by_id(&self, session_id: &str) -> Result<Option<Session>, Error> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_session))
    }

    pub async fn by_name(&self, name: &str) -> Result<Option<Session>, Error> {
        let row = sqlx::query("SELECT * FROM sessions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_session))
    }

    pub async fn list(&self) -> Result<Vec<Session>, Error> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY last_used_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_session).collect())
    }

    pub async fn touch(&self, session_id: &str) -> Result<(), Error> {
        sqlx::query("UPDATE sessions SET last_used_at = ? WHERE session_id = ?")
            .bind(self.clock.now_unix())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_compacted_summary(
        &self,
        session_id: &str,
        summary: &str,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE sessions SET compacted_summary = ? WHERE session_id = ?")
            .bind(summary)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record that a session ingested a local document.
    pub async fn link_document(&self, session_id: &str, cache_id: &str) -> Result<(), Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO session_documents (session_id, cache_id) VALUES (?, ?)",
        )
        .bind(session_id)
        .bind(cache_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a session and everything scoped to it. Vector deletes run
    /// before local writes so no write lock is held during
    /// vector-store calls.
    pub async fn delete(&self, session_id: &str) -> Result<(), Error> {
        if self.by_id(session_id).await?.is_none() {
            return Err(Error::not_found("session", session_id.to_string()));
        }

        // Findings first: vectors, then rows.
        self.memory
            .delete_findings_for_session(session_id)
            .await
            .map_err(Error::Other)?;

        sqlx::query("DELETE FROM session_documents WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        self.release_lock(session_id);
        Ok(())
    }

    // ============ Sticky locks ============

    /// Best-effort shell lock marking this process as the session owner.
    /// Failure to acquire only logs; sessions never refuse to load.
    pub fn acquire_lock(&self, session_id: &str) {
        let path = self.lock_path(session_id);
        if let Err(e) = std::fs::create_dir_all(&self.locks_dir) {
            warn!(error = %e, "could not create locks dir");
            return;
        }
        if let Err(e) = std::fs::write(&path, std::process::id().to_string()) {
            warn!(error = %e, session_id, "could not write session lock");
        }
    }

    pub fn release_lock(&self, session_id: &str) {
        let path = self.lock_path(session_id);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(error = %e, session_id, "could not remove session lock");
            }
        }
    }

    /// The pid currently holding the lock, if any.
    pub fn lock_holder(&self, session_id: &str) -> Option<u32> {
        std::fs::read_to_string(self.lock_path(session_id))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn lock_path(&self, session_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", session_id))
    }
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> Session {
    let paths_json: String = row.get("local_corpus_paths_json");
    Session {
        session_id: row.get("session_id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        last_used_at: row.get("last_used_at"),
        compacted_summary: row.get("compacted_summary"),
        research_mode: row.get("research_mode"),
        research_source_mode: row.get("research_source_mode"),
        local_corpus_paths: serde_json::from_str(&paths_json).unwrap_or_default(),
    }
}

/// Stopword-filtered slug from the first query.
pub fn slug_from_query(query: &str) -> String {
    let words: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2)
        .map(|w| w.to_lowercase())
        .filter(|w| !SLUG_STOPWORDS.contains(&w.as_str()))
        .take(SLUG_MAX_WORDS)
        .collect();
    if words.is_empty() {
        "session".to_string()
    } else {
        words.join("-")
    }
}

// ============ History ============

/// Message persistence over the unified `messages` table.
///
/// `session_id = NULL` rows are standalone history stored as paired
/// user+assistant messages; rows with a session id belong to that
/// session's thread in arrival order.
pub struct HistoryStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn append(
        &self,
        session_id: Option<&str>,
        role: &str,
        content: &str,
        summary: Option<&str>,
    ) -> Result<StoredMessage, Error> {
        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.map(|s| s.to_string()),
            role: role.to_string(),
            content: content.to_string(),
            summary: summary.map(|s| s.to_string()),
            token_count: crate::chunker::approx_tokens(content) as i64,
            timestamp: self.clock.now_unix(),
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, role, content, summary, token_count, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(&message.summary)
        .bind(message.token_count)
        .bind(message.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    /// Standalone exchange: paired user+assistant rows with no session.
    pub async fn record_standalone(&self, user: &str, assistant: &str) -> Result<(), Error> {
        self.append(None, "user", user, None).await?;
        self.append(None, "assistant", assistant, None).await?;
        Ok(())
    }

    /// A session's messages in arrival order.
    pub async fn for_session(&self, session_id: &str) -> Result<Vec<StoredMessage>, Error> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = ? ORDER BY timestamp ASC, rowid ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| StoredMessage {
                id: row.get("id"),
                session_id: row.get("session_id"),
                role: row.get("role"),
                content: row.get("content"),
                summary: row.get("summary"),
                token_count: row.get("token_count"),
                timestamp: row.get("timestamp"),
            })
            .collect())
    }
}
