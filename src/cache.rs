//! Content/link cache with TTL-driven invalidation.
//!
//! One row per canonical source. A write that changes the content hash
//! invalidates dependent chunk vectors BEFORE the new hash commits; a
//! changed links hash invalidates link vectors the same way. A crash
//! between the two steps self-heals on next access: chunks carry the
//! content hash they were built from, and a mismatch drops them.
//!
//! Expiry is lazy on read plus a one-shot background sweep at startup.
//! Fetch errors never evict previous good content.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::warn;

use crate::index::{HybridIndex, InvalidationKind};
use crate::models::{CacheEntry, Link};
use crate::urlnorm;

/// Time source injected into the core.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

/// Wall-clock implementation.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Row/freshness counters for `qry cache stats`.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: i64,
    pub fresh: i64,
    pub expired: i64,
    pub chunks: i64,
    pub link_vectors: i64,
}

pub struct Cache {
    pool: SqlitePool,
    index: Arc<HybridIndex>,
    clock: Arc<dyn Clock>,
    default_ttl_seconds: i64,
}

impl Cache {
    pub fn new(
        pool: SqlitePool,
        index: Arc<HybridIndex>,
        clock: Arc<dyn Clock>,
        ttl_hours: i64,
    ) -> Self {
        Self {
            pool,
            index,
            clock,
            default_ttl_seconds: ttl_hours * 3600,
        }
    }

    pub fn default_ttl_seconds(&self) -> i64 {
        self.default_ttl_seconds
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Resolve a URL or corpus handle to its cache id.
    pub fn resolve_cache_id(target: &str) -> String {
        if let Some((id, _)) = urlnorm::parse_handle(target) {
            return id;
        }
        urlnorm::cache_id_for(&urlnorm::canonicalize(target))
    }

    /// Load a cache row by URL or corpus handle. Returns the row even
    /// when expired; use [`Cache::is_fresh`] to decide on refetching.
    pub async fn get(&self, target: &str) -> Result<Option<CacheEntry>> {
        let cache_id = Self::resolve_cache_id(target);
        self.get_by_id(&cache_id).await
    }

    pub async fn get_by_id(&self, cache_id: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT cache_id, canonical_url, content_text, links_json, fetched_at,
                   ttl_seconds, content_hash, links_hash
            FROM cache_entries WHERE cache_id = ?
            "#,
        )
        .bind(cache_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let links_json: String = row.get("links_json");
            let links: Vec<Link> = serde_json::from_str(&links_json).unwrap_or_default();
            CacheEntry {
                cache_id: row.get("cache_id"),
                canonical_url: row.get("canonical_url"),
                content_text: row.get("content_text"),
                links,
                fetched_at: row.get("fetched_at"),
                ttl_seconds: row.get("ttl_seconds"),
                content_hash: row.get("content_hash"),
                links_hash: row.get("links_hash"),
            }
        }))
    }

    /// TTL check against the injected clock; age past TTL is stale
    /// regardless of content changes.
    pub fn is_fresh(&self, entry: &CacheEntry) -> bool {
        self.clock.now_unix() - entry.fetched_at < entry.ttl_seconds
    }

    /// Insert or refresh a source row.
    ///
    /// Computes content and link hashes; when either differs from the
    /// stored value, the dependent vectors are invalidated before the
    /// new hashes are committed.
    pub async fn put(
        &self,
        url: &str,
        content: &str,
        links: &[Link],
        ttl_seconds: Option<i64>,
    ) -> Result<CacheEntry> {
        // Corpus handles already carry their id; URLs derive one from
        // the canonical form.
        let (canonical, cache_id) = match urlnorm::parse_handle(url) {
            Some((id, _)) => (urlnorm::corpus_handle(&id), id),
            None => {
                let canonical = urlnorm::canonicalize(url);
                let cache_id = urlnorm::cache_id_for(&canonical);
                (canonical, cache_id)
            }
        };

        let content_hash = hash_text(content);
        let links_json = serde_json::to_string(links)?;
        let links_hash = hash_text(&links_json);

        let existing = self.get_by_id(&cache_id).await?;
        if let Some(prev) = &existing {
            if prev.content_hash != content_hash {
                self.index
                    .invalidate(&cache_id, InvalidationKind::Content)
                    .await?;
            }
            if prev.links_hash != links_hash {
                self.index
                    .invalidate(&cache_id, InvalidationKind::Links)
                    .await?;
            }
        }

        let fetched_at = self.clock.now_unix();
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds);

        sqlx::query(
            r#"
            INSERT INTO cache_entries (cache_id, canonical_url, content_text, links_json, fetched_at, ttl_seconds, content_hash, links_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(cache_id) DO UPDATE SET
                content_text = excluded.content_text,
                links_json = excluded.links_json,
                fetched_at = excluded.fetched_at,
                ttl_seconds = excluded.ttl_seconds,
                content_hash = excluded.content_hash,
                links_hash = excluded.links_hash
            "#,
        )
        .bind(&cache_id)
        .bind(&canonical)
        .bind(content)
        .bind(&links_json)
        .bind(fetched_at)
        .bind(ttl)
        .bind(&content_hash)
        .bind(&links_hash)
        .execute(&self.pool)
        .await?;

        Ok(CacheEntry {
            cache_id,
            canonical_url: canonical,
            content_text: content.to_string(),
            links: links.to_vec(),
            fetched_at,
            ttl_seconds: ttl,
            content_hash,
            links_hash,
        })
    }

    /// Drop a row and all dependent vectors.
    pub async fn invalidate(&self, cache_id: &str) -> Result<()> {
        self.index
            .invalidate(cache_id, InvalidationKind::Content)
            .await?;
        self.index
            .invalidate(cache_id, InvalidationKind::Links)
            .await?;
        sqlx::query("DELETE FROM cache_entries WHERE cache_id = ?")
            .bind(cache_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Verify the indexed chunks were built from the row's current
    /// content; drop them when a previous write was interrupted between
    /// the row commit and the vector drop.
    pub async fn heal_if_stale(&self, entry: &CacheEntry) -> Result<bool> {
        let stale: Option<String> = sqlx::query_scalar(
            "SELECT source_hash FROM chunks WHERE cache_id = ? AND source_hash != ? LIMIT 1",
        )
        .bind(&entry.cache_id)
        .bind(&entry.content_hash)
        .fetch_optional(&self.pool)
        .await?;

        if stale.is_some() {
            warn!(cache_id = %entry.cache_id, "stale chunks detected, dropping");
            self.index
                .invalidate(&entry.cache_id, InvalidationKind::Content)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// One-shot sweep deleting rows past their TTL. Invoked as a
    /// background task at startup and by `qry cache expire`.
    pub async fn bulk_expire(&self, now: i64) -> Result<u64> {
        let rows = sqlx::query(
            "SELECT cache_id FROM cache_entries WHERE ? - fetched_at >= ttl_seconds",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut removed = 0u64;
        for row in rows {
            let cache_id: String = row.get("cache_id");
            if let Err(e) = self.invalidate(&cache_id).await {
                warn!(cache_id, error = %e, "cache expiry failed");
                continue;
            }
            removed += 1;
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let now = self.clock.now_unix();
        let entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        let expired: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM cache_entries WHERE ? - fetched_at >= ttl_seconds",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let link_vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM link_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(CacheStats {
            entries,
            fresh: entries - expired,
            expired,
            chunks,
            link_vectors,
        })
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::index::NewChunk;
    use crate::testutil::{self, ManualClock};

    async fn setup() -> (Cache, Arc<HybridIndex>, ManualClock) {
        let pool = testutil::memory_pool().await;
        let index = Arc::new(HybridIndex::new(
            pool.clone(),
            None,
            testutil::fake_embedder(),
            RetrievalConfig::default(),
        ));
        let clock = ManualClock::at(1_000_000);
        let cache = Cache::new(pool, Arc::clone(&index), Arc::new(clock.clone()), 24);
        (cache, index, clock)
    }

    #[tokio::test]
    async fn put_get_roundtrip_shares_canonical_row() {
        let (cache, _, _) = setup().await;
        let entry = cache
            .put("https://Example.org/a/?b=2&a=1", "content body", &[], None)
            .await
            .unwrap();
        assert_eq!(entry.canonical_url, "https://example.org/a?a=1&b=2");

        // A differently-written equivalent URL resolves to the same row.
        let fetched = cache
            .get("https://example.org/a?a=1&b=2#frag")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.cache_id, entry.cache_id);
        assert_eq!(fetched.content_text, "content body");
    }

    #[tokio::test]
    async fn ttl_freshness_uses_clock() {
        let (cache, _, clock) = setup().await;
        let entry = cache
            .put("https://example.org", "body", &[], Some(3600))
            .await
            .unwrap();
        assert!(cache.is_fresh(&entry));
        clock.advance(3601);
        assert!(!cache.is_fresh(&entry));
    }

    #[tokio::test]
    async fn content_change_invalidates_chunks() {
        let (cache, index, _) = setup().await;
        let entry = cache
            .put("https://example.org", "version one text", &[], None)
            .await
            .unwrap();
        index
            .store_chunks(
                &entry.cache_id,
                &[NewChunk {
                    text: "version one text".into(),
                    token_count: 4,
                    section_id: None,
                }],
                &entry.content_hash,
            )
            .await
            .unwrap();

        // Same content: chunks survive.
        cache
            .put("https://example.org", "version one text", &[], None)
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(index.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);

        // Changed content: chunks dropped before the new hash lands.
        cache
            .put("https://example.org", "version two text", &[], None)
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(index.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn links_change_invalidates_link_vectors_only() {
        let (cache, index, _) = setup().await;
        let links_a = vec![Link {
            url: "https://example.org/next".into(),
            anchor_text: "next page".into(),
        }];
        let entry = cache
            .put("https://example.org", "stable body", &links_a, None)
            .await
            .unwrap();
        index.store_links(&entry.cache_id, &links_a).await.unwrap();
        index
            .store_chunks(
                &entry.cache_id,
                &[NewChunk {
                    text: "stable body".into(),
                    token_count: 3,
                    section_id: None,
                }],
                &entry.content_hash,
            )
            .await
            .unwrap();

        let links_b = vec![Link {
            url: "https://example.org/other".into(),
            anchor_text: "other page".into(),
        }];
        cache
            .put("https://example.org", "stable body", &links_b, None)
            .await
            .unwrap();

        let link_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM link_vectors")
            .fetch_one(index.pool())
            .await
            .unwrap();
        let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(index.pool())
            .await
            .unwrap();
        assert_eq!(link_count, 0, "link vectors must drop");
        assert_eq!(chunk_count, 1, "chunks must survive");
    }

    #[tokio::test]
    async fn bulk_expire_removes_only_stale_rows() {
        let (cache, _, clock) = setup().await;
        cache
            .put("https://old.org", "old", &[], Some(100))
            .await
            .unwrap();
        clock.advance(200);
        cache
            .put("https://new.org", "new", &[], Some(3600))
            .await
            .unwrap();

        let removed = cache.bulk_expire(clock.now_unix()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get("https://old.org").await.unwrap().is_none());
        assert!(cache.get("https://new.org").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn heal_detects_interrupted_invalidation() {
        let (cache, index, _) = setup().await;
        let entry = cache
            .put("https://example.org", "original", &[], None)
            .await
            .unwrap();
        index
            .store_chunks(
                &entry.cache_id,
                &[NewChunk {
                    text: "original".into(),
                    token_count: 2,
                    section_id: None,
                }],
                &entry.content_hash,
            )
            .await
            .unwrap();

        assert!(!cache.heal_if_stale(&entry).await.unwrap());

        // Simulate a crash that rewrote the row but left old chunks.
        sqlx::query("UPDATE cache_entries SET content_hash = 'changed' WHERE cache_id = ?")
            .bind(&entry.cache_id)
            .execute(index.pool())
            .await
            .unwrap();
        let reloaded = cache.get_by_id(&entry.cache_id).await.unwrap().unwrap();
        assert!(cache.heal_if_stale(&reloaded).await.unwrap());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(index.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn stats_counts() {
        let (cache, _, clock) = setup().await;
        cache
            .put("https://a.org", "a", &[], Some(100))
            .await
            .unwrap();
        cache
            .put("https://b.org", "b", &[], Some(10_000))
            .await
            .unwrap();
        clock.advance(200);
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.fresh, 1);
    }
}
