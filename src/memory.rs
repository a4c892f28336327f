//! Research memory (session-scoped findings) and global user memories.
//!
//! Findings persist insights for the active session; user memories are
//! global, and a save whose embedding sits within the dedup threshold of
//! an existing row updates that row instead of inserting.
//!
//! Recall distinguishes *unavailable* from *empty*: the relational scan
//! runs only when the vector backend errors or holds nothing, never to
//! second-guess low-similarity results the backend did return.

use anyhow::Result;
use serde_json::json;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::cache::Clock;
use crate::config::MemoryConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingClient};
use crate::models::{Finding, UserMemory};
use crate::vector::{Collection, MetadataFilter, VectorBackend, VectorRecord};

pub struct MemoryStore {
    pool: SqlitePool,
    backend: Option<Arc<dyn VectorBackend>>,
    embedder: Arc<dyn EmbeddingClient>,
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
}

/// A recalled row with its similarity to the query.
#[derive(Debug, Clone)]
pub struct Recalled<T> {
    pub item: T,
    pub score: f32,
}

impl MemoryStore {
    pub fn new(
        pool: SqlitePool,
        backend: Option<Arc<dyn VectorBackend>>,
        embedder: Arc<dyn EmbeddingClient>,
        config: MemoryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            backend,
            embedder,
            config,
            clock,
        }
    }

    // ============ Findings ============

    /// Persist a research insight under the active session (global when
    /// no session is active).
    pub async fn save_finding(&self, session_id: Option<&str>, text: &str) -> Result<Finding> {
        let embedding = self.embedder.embed_one(text).await?;
        let finding = Finding {
            finding_id: Uuid::new_v4().to_string(),
            session_id: session_id.map(|s| s.to_string()),
            text: text.to_string(),
            created_at: self.clock.now_unix(),
        };

        sqlx::query(
            r#"
            INSERT INTO findings (finding_id, session_id, text, embedding, embedding_model, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&finding.finding_id)
        .bind(&finding.session_id)
        .bind(&finding.text)
        .bind(vec_to_blob(&embedding))
        .bind(self.embedder.model_id())
        .bind(finding.created_at)
        .execute(&self.pool)
        .await?;

        if let Some(backend) = &self.backend {
            let record = VectorRecord {
                id: finding.finding_id.clone(),
                embedding,
                metadata: json!({
                    "session_id": finding.session_id.clone().unwrap_or_default(),
                    "model_id": self.embedder.model_id(),
                }),
            };
            if let Err(e) = backend.upsert(Collection::Findings, vec![record]).await {
                warn!(error = %e, "vector backend finding upsert failed");
            }
        }

        Ok(finding)
    }

    /// Semantic recall over findings, scoped to the session when one is
    /// active (global findings are always visible).
    pub async fn query_findings(
        &self,
        query: &str,
        session_id: Option<&str>,
    ) -> Result<Vec<Recalled<Finding>>> {
        let query_vec = self.embedder.embed_one(query).await?;
        let top_k = self.config.recall_top_k;
        let min_similarity = self.config.recall_min_similarity as f32;

        if let Some(backend) = &self.backend {
            let filter = session_id
                .map(|sid| MetadataFilter::new().eq("session_id", sid));
            match backend
                .query(Collection::Findings, &query_vec, top_k, filter.as_ref())
                .await
            {
                Ok(matches) if !matches.is_empty() => {
                    let mut out = Vec::new();
                    for m in matches {
                        if m.score < min_similarity {
                            continue;
                        }
                        if let Some(finding) = self.finding_by_id(&m.id).await? {
                            out.push(Recalled {
                                item: finding,
                                score: m.score,
                            });
                        }
                    }
                    return Ok(out);
                }
                Ok(_) => {} // empty collection: fall through to the scan
                Err(e) => {
                    warn!(error = %e, "vector backend finding query failed, scanning");
                }
            }
        }

        self.scan_findings(&query_vec, session_id, top_k, min_similarity)
            .await
    }

    async fn finding_by_id(&self, finding_id: &str) -> Result<Option<Finding>> {
        let row = sqlx::query(
            "SELECT finding_id, session_id, text, created_at FROM findings WHERE finding_id = ?",
        )
        .bind(finding_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Finding {
            finding_id: r.get("finding_id"),
            session_id: r.get("session_id"),
            text: r.get("text"),
            created_at: r.get("created_at"),
        }))
    }

    async fn scan_findings(
        &self,
        query_vec: &[f32],
        session_id: Option<&str>,
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<Recalled<Finding>>> {
        let rows = sqlx::query(
            r#"
            SELECT finding_id, session_id, text, embedding, created_at
            FROM findings
            WHERE session_id IS NULL OR session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<Recalled<Finding>> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = cosine_similarity(query_vec, &blob_to_vec(&blob));
                if score < min_similarity {
                    return None;
                }
                Some(Recalled {
                    item: Finding {
                        finding_id: row.get("finding_id"),
                        session_id: row.get("session_id"),
                        text: row.get("text"),
                        created_at: row.get("created_at"),
                    },
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.item.finding_id.cmp(&b.item.finding_id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Remove a session's findings: vector entries first, rows second,
    /// so a failure never leaves dangling vectors.
    pub async fn delete_findings_for_session(&self, session_id: &str) -> Result<u64> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT finding_id FROM findings WHERE session_id = ?")
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?;

        if let Some(backend) = &self.backend {
            if let Err(e) = backend.delete_ids(Collection::Findings, &ids).await {
                warn!(session_id, error = %e, "vector backend finding delete failed");
            }
        }

        let result = sqlx::query("DELETE FROM findings WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ============ User memories ============

    /// Save a global user memory. A near-duplicate (cosine at or above
    /// the dedup threshold) updates the existing row in place.
    pub async fn save_memory(
        &self,
        text: &str,
        tags: &[String],
    ) -> Result<(UserMemory, bool)> {
        let embedding = self.embedder.embed_one(text).await?;
        let now = self.clock.now_unix();
        let tags_json = serde_json::to_string(tags)?;

        let nearest = self.nearest_memory(&embedding).await?;
        if let Some((memory_id, score)) = nearest {
            if f64::from(score) >= self.config.dedup_threshold {
                sqlx::query(
                    r#"
                    UPDATE user_memories
                    SET text = ?, tags_json = ?, embedding = ?, embedding_model = ?, updated_at = ?
                    WHERE memory_id = ?
                    "#,
                )
                .bind(text)
                .bind(&tags_json)
                .bind(vec_to_blob(&embedding))
                .bind(self.embedder.model_id())
                .bind(now)
                .bind(&memory_id)
                .execute(&self.pool)
                .await?;

                self.upsert_memory_vector(&memory_id, &embedding).await;
                return Ok((
                    UserMemory {
                        memory_id,
                        text: text.to_string(),
                        tags: tags.to_vec(),
                        updated_at: now,
                    },
                    true,
                ));
            }
        }

        let memory = UserMemory {
            memory_id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            tags: tags.to_vec(),
            updated_at: now,
        };
        sqlx::query(
            r#"
            INSERT INTO user_memories (memory_id, text, tags_json, embedding, embedding_model, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&memory.memory_id)
        .bind(text)
        .bind(&tags_json)
        .bind(vec_to_blob(&embedding))
        .bind(self.embedder.model_id())
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.upsert_memory_vector(&memory.memory_id, &embedding).await;
        Ok((memory, false))
    }

    async fn upsert_memory_vector(&self, memory_id: &str, embedding: &[f32]) {
        if let Some(backend) = &self.backend {
            let record = VectorRecord {
                id: memory_id.to_string(),
                embedding: embedding.to_vec(),
                metadata: json!({ "model_id": self.embedder.model_id() }),
            };
            if let Err(e) = backend.upsert(Collection::UserMemories, vec![record]).await {
                warn!(error = %e, "vector backend memory upsert failed");
            }
        }
    }

    async fn nearest_memory(&self, embedding: &[f32]) -> Result<Option<(String, f32)>> {
        if let Some(backend) = &self.backend {
            match backend
                .query(Collection::UserMemories, embedding, 1, None)
                .await
            {
                Ok(matches) if !matches.is_empty() => {
                    let m = &matches[0];
                    return Ok(Some((m.id.clone(), m.score)));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "vector backend memory query failed, scanning");
                }
            }
        }

        let rows = sqlx::query("SELECT memory_id, embedding FROM user_memories")
            .fetch_all(&self.pool)
            .await?;
        let mut best: Option<(String, f32)> = None;
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            let score = cosine_similarity(embedding, &blob_to_vec(&blob));
            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((row.get("memory_id"), score));
            }
        }
        Ok(best)
    }

    /// Recall user memories above the minimum similarity. The vector
    /// backend answers when it can; the relational scan runs only when
    /// the backend is absent, erroring, or holds nothing.
    pub async fn recall_memories(&self, query: &str) -> Result<Vec<Recalled<UserMemory>>> {
        let query_vec = self.embedder.embed_one(query).await?;
        let top_k = self.config.recall_top_k;
        let min_similarity = self.config.recall_min_similarity as f32;

        if let Some(backend) = &self.backend {
            match backend
                .query(Collection::UserMemories, &query_vec, top_k, None)
                .await
            {
                Ok(matches) if !matches.is_empty() => {
                    let mut out = Vec::new();
                    for m in matches {
                        if m.score < min_similarity {
                            continue;
                        }
                        if let Some(memory) = self.memory_by_id(&m.id).await? {
                            out.push(Recalled {
                                item: memory,
                                score: m.score,
                            });
                        }
                    }
                    return Ok(out);
                }
                Ok(_) => {} // empty collection: fall through to the scan
                Err(e) => {
                    warn!(error = %e, "vector backend memory query failed, scanning");
                }
            }
        }

        self.scan_memories(&query_vec, top_k, min_similarity).await
    }

    async fn memory_by_id(&self, memory_id: &str) -> Result<Option<UserMemory>> {
        let row = sqlx::query(
            "SELECT memory_id, text, tags_json, updated_at FROM user_memories WHERE memory_id = ?",
        )
        .bind(memory_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| {
            let tags_json: String = r.get("tags_json");
            UserMemory {
                memory_id: r.get("memory_id"),
                text: r.get("text"),
                tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                updated_at: r.get("updated_at"),
            }
        }))
    }

    async fn scan_memories(
        &self,
        query_vec: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<Recalled<UserMemory>>> {
        let rows = sqlx::query(
            "SELECT memory_id, text, tags_json, updated_at, embedding FROM user_memories",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<Recalled<UserMemory>> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = cosine_similarity(query_vec, &blob_to_vec(&blob));
                if score < min_similarity {
                    return None;
                }
                let tags_json: String = row.get("tags_json");
                Some(Recalled {
                    item: UserMemory {
                        memory_id: row.get("memory_id"),
                        text: row.get("text"),
                        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                        updated_at: row.get("updated_at"),
                    },
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.item.memory_id.cmp(&b.item.memory_id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, ManualClock};
    use crate::vector::VectorMatch;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend fake returning canned matches; `fail` simulates an
    /// unreachable backend.
    struct FakeBackend {
        matches: Vec<VectorMatch>,
        fail: bool,
        queries: AtomicUsize,
    }

    impl FakeBackend {
        fn healthy(matches: Vec<VectorMatch>) -> Arc<Self> {
            Arc::new(Self {
                matches,
                fail: false,
                queries: AtomicUsize::new(0),
            })
        }

        fn down() -> Arc<Self> {
            Arc::new(Self {
                matches: Vec::new(),
                fail: true,
                queries: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl VectorBackend for FakeBackend {
        async fn upsert(
            &self,
            _collection: Collection,
            _records: Vec<VectorRecord>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete_ids(&self, _collection: Collection, _ids: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete_where(
            &self,
            _collection: Collection,
            _filter: &crate::vector::MetadataFilter,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn query(
            &self,
            _collection: Collection,
            _embedding: &[f32],
            _k: usize,
            _filter: Option<&crate::vector::MetadataFilter>,
        ) -> anyhow::Result<Vec<VectorMatch>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("backend unreachable");
            }
            Ok(self.matches.clone())
        }
        async fn count(&self, _collection: Collection) -> anyhow::Result<u64> {
            Ok(self.matches.len() as u64)
        }
    }

    async fn insert_memory(pool: &sqlx::SqlitePool, memory_id: &str, text: &str) {
        sqlx::query(
            r#"
            INSERT INTO user_memories (memory_id, text, tags_json, embedding, embedding_model, updated_at)
            VALUES (?, ?, '[]', ?, 'fake-64', 100)
            "#,
        )
        .bind(memory_id)
        .bind(text)
        .bind(vec_to_blob(&testutil::bucket_vector(text)))
        .execute(pool)
        .await
        .unwrap();
    }

    async fn store() -> (MemoryStore, ManualClock) {
        let pool = testutil::memory_pool().await;
        let clock = ManualClock::at(5_000);
        let store = MemoryStore::new(
            pool,
            None,
            testutil::fake_embedder(),
            MemoryConfig::default(),
            Arc::new(clock.clone()),
        );
        (store, clock)
    }

    #[tokio::test]
    async fn findings_scope_to_session() {
        let (store, _) = store().await;
        store
            .save_finding(Some("s1"), "rust borrow checker insight")
            .await
            .unwrap();
        store
            .save_finding(Some("s2"), "rust borrow checker insight duplicate")
            .await
            .unwrap();
        store
            .save_finding(None, "rust borrow checker global note")
            .await
            .unwrap();

        let recalled = store
            .query_findings("rust borrow checker", Some("s1"))
            .await
            .unwrap();
        for r in &recalled {
            assert!(
                r.item.session_id.as_deref() == Some("s1") || r.item.session_id.is_none(),
                "leaked finding from another session: {:?}",
                r.item
            );
        }
        assert!(recalled.iter().any(|r| r.item.session_id.is_none()));
    }

    #[tokio::test]
    async fn save_memory_twice_updates_single_row() {
        let (store, clock) = store().await;
        let (first, updated) = store
            .save_memory("prefers dark roast coffee", &[])
            .await
            .unwrap();
        assert!(!updated);

        clock.advance(100);
        let (second, updated) = store
            .save_memory("prefers dark roast coffee", &[])
            .await
            .unwrap();
        assert!(updated, "identical text must dedup");
        assert_eq!(first.memory_id, second.memory_id);
        assert!(second.updated_at > first.updated_at);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_memories")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn distinct_memories_insert_separately() {
        let (store, _) = store().await;
        store
            .save_memory("enjoys hiking in the alps", &[])
            .await
            .unwrap();
        store
            .save_memory("works on database internals", &[])
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_memories")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn recall_filters_by_min_similarity() {
        let (store, _) = store().await;
        store
            .save_memory("compilers and type inference", &[])
            .await
            .unwrap();
        let hits = store
            .recall_memories("completely unrelated gardening topic")
            .await
            .unwrap();
        assert!(
            hits.is_empty(),
            "unrelated query should recall nothing: {:?}",
            hits.iter().map(|h| h.score).collect::<Vec<_>>()
        );
        let hits = store
            .recall_memories("compilers and type inference")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn cascade_delete_clears_session_findings() {
        let (store, _) = store().await;
        store.save_finding(Some("s1"), "first insight").await.unwrap();
        store.save_finding(Some("s1"), "second insight").await.unwrap();
        store.save_finding(Some("s2"), "other session").await.unwrap();

        let removed = store.delete_findings_for_session("s1").await.unwrap();
        assert_eq!(removed, 2);

        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM findings WHERE session_id = 's1'")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(remaining, 0);
        let other: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM findings")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(other, 1);
    }

    #[tokio::test]
    async fn recall_uses_backend_results_over_the_scan() {
        let pool = testutil::memory_pool().await;
        // Both rows would pass the relational scan for this query.
        insert_memory(&pool, "m-alpha", "compilers and type inference notes").await;
        insert_memory(&pool, "m-beta", "compilers and type inference digest").await;

        let backend = FakeBackend::healthy(vec![VectorMatch {
            id: "m-beta".into(),
            score: 0.9,
            metadata: Value::Null,
        }]);
        let store = MemoryStore::new(
            pool,
            Some(backend.clone() as Arc<dyn VectorBackend>),
            testutil::fake_embedder(),
            MemoryConfig::default(),
            Arc::new(ManualClock::at(5_000)),
        );

        let hits = store
            .recall_memories("compilers and type inference")
            .await
            .unwrap();
        assert_eq!(backend.queries.load(Ordering::SeqCst), 1);
        assert_eq!(hits.len(), 1, "backend answer must not be widened by a scan");
        assert_eq!(hits[0].item.memory_id, "m-beta");
        assert!((hits[0].score - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn recall_falls_back_when_backend_errors() {
        let pool = testutil::memory_pool().await;
        insert_memory(&pool, "m-alpha", "compilers and type inference notes").await;
        insert_memory(&pool, "m-beta", "compilers and type inference digest").await;

        let backend = FakeBackend::down();
        let store = MemoryStore::new(
            pool,
            Some(backend.clone() as Arc<dyn VectorBackend>),
            testutil::fake_embedder(),
            MemoryConfig::default(),
            Arc::new(ManualClock::at(5_000)),
        );

        let hits = store
            .recall_memories("compilers and type inference")
            .await
            .unwrap();
        assert_eq!(backend.queries.load(Ordering::SeqCst), 1);
        assert_eq!(hits.len(), 2, "scan fallback must cover the whole table");
    }
}
