//! Database schema migrations.
//!
//! Creates all required tables (cache_entries, chunks, chunks_fts,
//! chunk_vectors, link_vectors, sections, findings, user_memories,
//! sessions, messages) and ensures idempotent execution. Designed to be
//! run via `qry init`; also safe to call at every startup.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;

    // Sibling directories of the database live under the same data dir.
    std::fs::create_dir_all(config.data.vector_dir())?;
    std::fs::create_dir_all(config.data.reports_dir())?;
    std::fs::create_dir_all(config.data.locks_dir())?;

    pool.close().await;
    Ok(())
}

/// Apply the schema to an already-open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            cache_id TEXT PRIMARY KEY,
            canonical_url TEXT NOT NULL UNIQUE,
            content_text TEXT NOT NULL,
            links_json TEXT NOT NULL DEFAULT '[]',
            fetched_at INTEGER NOT NULL,
            ttl_seconds INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            links_hash TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            cache_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            section_id TEXT,
            embedding_model TEXT NOT NULL,
            source_hash TEXT NOT NULL DEFAULT '',
            UNIQUE(cache_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table over chunk text (not idempotent natively, check first)
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                cache_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            cache_id TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS link_vectors (
            link_id TEXT PRIMARY KEY,
            cache_id TEXT NOT NULL,
            anchor_text TEXT NOT NULL,
            url TEXT NOT NULL,
            embedding_model TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sections (
            cache_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            title TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            start_byte INTEGER NOT NULL,
            end_byte INTEGER NOT NULL,
            canonical INTEGER NOT NULL,
            aliases_json TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (cache_id, section_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS findings (
            finding_id TEXT PRIMARY KEY,
            session_id TEXT,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            embedding_model TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_memories (
            memory_id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            embedding BLOB NOT NULL,
            embedding_model TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL,
            last_used_at INTEGER NOT NULL,
            compacted_summary TEXT,
            research_mode INTEGER NOT NULL DEFAULT 0,
            research_source_mode TEXT,
            local_corpus_paths_json TEXT NOT NULL DEFAULT '[]',
            defaults_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            session_id TEXT,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            summary TEXT,
            token_count INTEGER NOT NULL,
            timestamp INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Uploaded-document links: which cache rows a session ingested.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_documents (
            session_id TEXT NOT NULL,
            cache_id TEXT NOT NULL,
            PRIMARY KEY (session_id, cache_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_cache_id ON chunks(cache_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_vectors_cache_id ON chunk_vectors(cache_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_link_vectors_cache_id ON link_vectors(cache_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_findings_session ON findings(session_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cache_entries_fetched_at ON cache_entries(fetched_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
