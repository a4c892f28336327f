//! Hybrid dense + lexical chunk index.
//!
//! The relational store holds authoritative chunk and link rows plus an
//! FTS5 lexical index; the optional vector backend accelerates cosine
//! search. Hybrid queries min-max normalize each score list, fuse with a
//! configurable dense weight, and pass the ranking through a greedy
//! diversity filter that suppresses near-duplicates.
//!
//! # Hybrid Scoring
//!
//! 1. Embed the query.
//! 2. Dense candidates from the vector backend (or a relational cosine
//!    scan when the backend is absent or erroring — `degraded` is set).
//! 3. Lexical candidates from FTS5 BM25 (token-overlap fallback when the
//!    query has no indexable tokens).
//! 4. Normalize both lists to `[0, 1]`, merge with
//!    `final = dense_weight × dense + (1 − dense_weight) × lexical`.
//! 5. Greedy diversity selection, rejecting candidates whose cosine to
//!    any already-selected chunk exceeds the near-duplicate threshold.

use anyhow::Result;
use serde_json::json;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::RetrievalConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingClient};
use crate::models::{Link, ScoredChunk};
use crate::vector::{Collection, MetadataFilter, VectorBackend, VectorRecord};

/// Which dependent vectors a cache write invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationKind {
    Content,
    Links,
}

/// A chunk ready for indexing (ids are assigned here).
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub text: String,
    pub token_count: i64,
    pub section_id: Option<String>,
}

/// Results of a hybrid query plus the degradation marker.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub results: Vec<ScoredChunk>,
    /// True when the dense side came from the relational fallback scan.
    pub degraded: bool,
}

pub struct HybridIndex {
    pool: SqlitePool,
    backend: Option<Arc<dyn VectorBackend>>,
    embedder: Arc<dyn EmbeddingClient>,
    retrieval: RetrievalConfig,
}

impl HybridIndex {
    pub fn new(
        pool: SqlitePool,
        backend: Option<Arc<dyn VectorBackend>>,
        embedder: Arc<dyn EmbeddingClient>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            pool,
            backend,
            embedder,
            retrieval,
        }
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingClient> {
        &self.embedder
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Upsert ============

    /// Replace all chunks for a cache row with freshly embedded ones.
    ///
    /// Deletes existing rows, then inserts with deterministic ids
    /// `chunk:{cache_id}:{index}`. Idempotent for identical content and
    /// model. `source_hash` records the content hash the chunks were
    /// built from so an interrupted invalidation is detectable later.
    pub async fn store_chunks(
        &self,
        cache_id: &str,
        chunks: &[NewChunk],
        source_hash: &str,
    ) -> Result<()> {
        let model_id = self.embedder.model_id().to_string();
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE cache_id = ?")
            .bind(cache_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE cache_id = ?")
            .bind(cache_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE cache_id = ?")
            .bind(cache_id)
            .execute(&mut *tx)
            .await?;

        let mut records = Vec::with_capacity(chunks.len());
        for (i, (chunk, embedding)) in chunks.iter().zip(embeddings.iter()).enumerate() {
            let chunk_id = format!("chunk:{}:{}", cache_id, i);

            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_id, cache_id, chunk_index, text, token_count, section_id, embedding_model, source_hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk_id)
            .bind(cache_id)
            .bind(i as i64)
            .bind(&chunk.text)
            .bind(chunk.token_count)
            .bind(&chunk.section_id)
            .bind(&model_id)
            .bind(source_hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, cache_id, text) VALUES (?, ?, ?)")
                .bind(&chunk_id)
                .bind(cache_id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, cache_id, embedding) VALUES (?, ?, ?)",
            )
            .bind(&chunk_id)
            .bind(cache_id)
            .bind(vec_to_blob(embedding))
            .execute(&mut *tx)
            .await?;

            let mut metadata = json!({ "cache_id": cache_id, "model_id": model_id });
            if let Some(section) = &chunk.section_id {
                metadata["section_id"] = json!(section);
            }
            records.push(VectorRecord {
                id: chunk_id,
                embedding: embedding.clone(),
                metadata,
            });
        }

        tx.commit().await?;

        if let Some(backend) = &self.backend {
            let filter = MetadataFilter::new().eq("cache_id", cache_id);
            if let Err(e) = backend.delete_where(Collection::Chunks, &filter).await {
                warn!(cache_id, error = %e, "vector backend chunk delete failed");
            }
            if let Err(e) = backend.upsert(Collection::Chunks, records).await {
                warn!(cache_id, error = %e, "vector backend chunk upsert failed");
            }
        }

        Ok(())
    }

    /// Replace link vectors for a cache row.
    pub async fn store_links(&self, cache_id: &str, links: &[Link]) -> Result<()> {
        let model_id = self.embedder.model_id().to_string();
        let texts: Vec<String> = links.iter().map(|l| l.anchor_text.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM link_vectors WHERE cache_id = ?")
            .bind(cache_id)
            .execute(&mut *tx)
            .await?;

        let mut records = Vec::with_capacity(links.len());
        for (link, embedding) in links.iter().zip(embeddings.iter()) {
            let link_id = format!("link:{}:{}", cache_id, link.url);
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO link_vectors (link_id, cache_id, anchor_text, url, embedding_model, embedding)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&link_id)
            .bind(cache_id)
            .bind(&link.anchor_text)
            .bind(&link.url)
            .bind(&model_id)
            .bind(vec_to_blob(embedding))
            .execute(&mut *tx)
            .await?;

            records.push(VectorRecord {
                id: link_id,
                embedding: embedding.clone(),
                metadata: json!({ "cache_id": cache_id, "model_id": model_id }),
            });
        }
        tx.commit().await?;

        if let Some(backend) = &self.backend {
            let filter = MetadataFilter::new().eq("cache_id", cache_id);
            if let Err(e) = backend.delete_where(Collection::Links, &filter).await {
                warn!(cache_id, error = %e, "vector backend link delete failed");
            }
            if let Err(e) = backend.upsert(Collection::Links, records).await {
                warn!(cache_id, error = %e, "vector backend link upsert failed");
            }
        }

        Ok(())
    }

    /// Drop dependent vectors for a cache row. Called by the cache
    /// before it commits changed hashes.
    pub async fn invalidate(&self, cache_id: &str, kind: InvalidationKind) -> Result<()> {
        match kind {
            InvalidationKind::Content => {
                let mut tx = self.pool.begin().await?;
                sqlx::query("DELETE FROM chunk_vectors WHERE cache_id = ?")
                    .bind(cache_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM chunks_fts WHERE cache_id = ?")
                    .bind(cache_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM chunks WHERE cache_id = ?")
                    .bind(cache_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM sections WHERE cache_id = ?")
                    .bind(cache_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;

                if let Some(backend) = &self.backend {
                    let filter = MetadataFilter::new().eq("cache_id", cache_id);
                    if let Err(e) = backend.delete_where(Collection::Chunks, &filter).await {
                        warn!(cache_id, error = %e, "vector backend invalidate failed");
                    }
                }
            }
            InvalidationKind::Links => {
                sqlx::query("DELETE FROM link_vectors WHERE cache_id = ?")
                    .bind(cache_id)
                    .execute(&self.pool)
                    .await?;
                if let Some(backend) = &self.backend {
                    let filter = MetadataFilter::new().eq("cache_id", cache_id);
                    if let Err(e) = backend.delete_where(Collection::Links, &filter).await {
                        warn!(cache_id, error = %e, "vector backend link invalidate failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Freshness check callers run before serving: are there chunks for
    /// this cache row embedded with the current model?
    pub async fn has_chunks_for_model(&self, cache_id: &str, model_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE cache_id = ? AND embedding_model = ?",
        )
        .bind(cache_id)
        .bind(model_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // ============ Hybrid query ============

    /// Hybrid retrieval over the chunk corpus.
    ///
    /// `cache_ids` restricts the search; `section_id` further narrows to
    /// one section. `dense_weight` overrides the configured fusion
    /// weight when set.
    pub async fn search_chunks(
        &self,
        query: &str,
        cache_ids: Option<&[String]>,
        section_id: Option<&str>,
        k: usize,
        dense_weight: Option<f64>,
    ) -> Result<SearchOutcome> {
        let weight = dense_weight.unwrap_or(self.retrieval.dense_weight);
        let candidate_k = self.retrieval.candidate_k;
        let model_id = self.embedder.model_id().to_string();

        let query_vec = self.embedder.embed_one(query).await?;

        let (dense, degraded) = self
            .dense_candidates(&query_vec, cache_ids, section_id, &model_id, candidate_k)
            .await?;
        let lexical = self
            .lexical_candidates(query, cache_ids, section_id, candidate_k)
            .await?;

        if dense.is_empty() && lexical.is_empty() {
            return Ok(SearchOutcome {
                results: Vec::new(),
                degraded,
            });
        }

        let norm_dense = normalize_scores(&dense);
        let norm_lexical = normalize_scores(&lexical);

        let dense_map: HashMap<&str, f64> = norm_dense
            .iter()
            .map(|(c, s)| (c.chunk_id.as_str(), *s))
            .collect();
        let lexical_map: HashMap<&str, f64> = norm_lexical
            .iter()
            .map(|(c, s)| (c.chunk_id.as_str(), *s))
            .collect();

        let mut all: HashMap<&str, &Candidate> = HashMap::new();
        for c in dense.iter().chain(lexical.iter()) {
            all.entry(c.chunk_id.as_str()).or_insert(c);
        }

        let mut fused: Vec<(&Candidate, f64)> = all
            .values()
            .map(|c| {
                let d = dense_map.get(c.chunk_id.as_str()).copied().unwrap_or(0.0);
                let l = lexical_map.get(c.chunk_id.as_str()).copied().unwrap_or(0.0);
                (*c, weight * d + (1.0 - weight) * l)
            })
            .collect();

        // Deterministic ordering: score desc, then chunk id.
        fused.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.chunk_id.cmp(&b.0.chunk_id))
        });

        let selected = self.diversity_filter(&fused, k).await?;
        let results = self.hydrate(&selected).await?;

        Ok(SearchOutcome { results, degraded })
    }

    /// Greedy selection suppressing near-duplicates.
    async fn diversity_filter<'a>(
        &self,
        ranked: &[(&'a Candidate, f64)],
        k: usize,
    ) -> Result<Vec<(&'a Candidate, f64)>> {
        let threshold = self.retrieval.near_duplicate_threshold as f32;
        let mut selected: Vec<(&Candidate, f64)> = Vec::new();
        let mut selected_vecs: Vec<Vec<f32>> = Vec::new();

        for (candidate, score) in ranked {
            if selected.len() >= k {
                break;
            }
            let Some(vec) = self.chunk_embedding(&candidate.chunk_id).await? else {
                continue;
            };
            let near_dup = selected_vecs
                .iter()
                .any(|s| cosine_similarity(s, &vec) > threshold);
            if near_dup {
                continue;
            }
            selected.push((candidate, *score));
            selected_vecs.push(vec);
        }

        Ok(selected)
    }

    async fn chunk_embedding(&self, chunk_id: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT embedding FROM chunk_vectors WHERE chunk_id = ?")
                .bind(chunk_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    async fn hydrate(&self, selected: &[(&Candidate, f64)]) -> Result<Vec<ScoredChunk>> {
        let mut out = Vec::with_capacity(selected.len());
        for (candidate, score) in selected {
            let row = sqlx::query(
                r#"
                SELECT c.text, c.section_id, ce.canonical_url
                FROM chunks c
                LEFT JOIN cache_entries ce ON ce.cache_id = c.cache_id
                WHERE c.chunk_id = ?
                "#,
            )
            .bind(&candidate.chunk_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                out.push(ScoredChunk {
                    chunk_id: candidate.chunk_id.clone(),
                    text: row.get("text"),
                    score: *score,
                    source_url: row
                        .get::<Option<String>, _>("canonical_url")
                        .unwrap_or_default(),
                    section_id: row.get("section_id"),
                });
            }
        }
        Ok(out)
    }

    /// Dense candidates via the vector backend, degrading to a
    /// relational cosine scan when the backend is absent or failing.
    async fn dense_candidates(
        &self,
        query_vec: &[f32],
        cache_ids: Option<&[String]>,
        section_id: Option<&str>,
        model_id: &str,
        candidate_k: i64,
    ) -> Result<(Vec<Candidate>, bool)> {
        if let Some(backend) = &self.backend {
            let mut filter = MetadataFilter::new().eq("model_id", model_id);
            if let Some(ids) = cache_ids {
                filter = filter.is_in("cache_id", ids.iter().map(|i| json!(i)).collect());
            }
            if let Some(section) = section_id {
                filter = filter.eq("section_id", section);
            }

            match backend
                .query(
                    Collection::Chunks,
                    query_vec,
                    candidate_k as usize,
                    Some(&filter),
                )
                .await
            {
                Ok(matches) => {
                    let candidates = matches
                        .into_iter()
                        .map(|m| Candidate {
                            chunk_id: m.id,
                            raw_score: f64::from(m.score),
                        })
                        .collect();
                    return Ok((candidates, false));
                }
                Err(e) => {
                    warn!(error = %e, "vector backend query failed, using relational scan");
                }
            }
        }

        let candidates = self
            .relational_dense_scan(query_vec, cache_ids, section_id, model_id, candidate_k)
            .await?;
        Ok((candidates, true))
    }

    async fn relational_dense_scan(
        &self,
        query_vec: &[f32],
        cache_ids: Option<&[String]>,
        section_id: Option<&str>,
        model_id: &str,
        candidate_k: i64,
    ) -> Result<Vec<Candidate>> {
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.cache_id, cv.embedding, c.section_id
            FROM chunk_vectors cv
            JOIN chunks c ON c.chunk_id = cv.chunk_id
            WHERE c.embedding_model = ?
            "#,
        )
        .bind(model_id)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<Candidate> = rows
            .iter()
            .filter(|row| {
                if let Some(ids) = cache_ids {
                    let cache_id: String = row.get("cache_id");
                    if !ids.contains(&cache_id) {
                        return false;
                    }
                }
                if let Some(section) = section_id {
                    let row_section: Option<String> = row.get("section_id");
                    if row_section.as_deref() != Some(section) {
                        return false;
                    }
                }
                true
            })
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                Candidate {
                    chunk_id: row.get("chunk_id"),
                    raw_score: f64::from(cosine_similarity(query_vec, &vec)),
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(candidate_k as usize);
        Ok(candidates)
    }

    /// Lexical candidates via FTS5 BM25, falling back to token overlap
    /// when the query has no indexable tokens.
    async fn lexical_candidates(
        &self,
        query: &str,
        cache_ids: Option<&[String]>,
        section_id: Option<&str>,
        candidate_k: i64,
    ) -> Result<Vec<Candidate>> {
        let match_query = fts_match_query(query);
        if match_query.is_empty() {
            return self
                .token_overlap_candidates(query, cache_ids, section_id, candidate_k)
                .await;
        }

        let rows = sqlx::query(
            r#"
            SELECT chunks_fts.chunk_id, chunks_fts.cache_id, rank, c.section_id
            FROM chunks_fts
            JOIN chunks c ON c.chunk_id = chunks_fts.chunk_id
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&match_query)
        .bind(candidate_k * 4)
        .fetch_all(&self.pool)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "FTS query failed, using token overlap");
                return self
                    .token_overlap_candidates(query, cache_ids, section_id, candidate_k)
                    .await;
            }
        };

        let mut candidates: Vec<Candidate> = rows
            .iter()
            .filter(|row| {
                if let Some(ids) = cache_ids {
                    let cache_id: String = row.get("cache_id");
                    if !ids.contains(&cache_id) {
                        return false;
                    }
                }
                if let Some(section) = section_id {
                    let row_section: Option<String> = row.get("section_id");
                    if row_section.as_deref() != Some(section) {
                        return false;
                    }
                }
                true
            })
            .map(|row| {
                let rank: f64 = row.get("rank");
                Candidate {
                    chunk_id: row.get("chunk_id"),
                    // FTS5 rank is negative (lower = better).
                    raw_score: -rank,
                }
            })
            .collect();
        candidates.truncate(candidate_k as usize);
        Ok(candidates)
    }

    async fn token_overlap_candidates(
        &self,
        query: &str,
        cache_ids: Option<&[String]>,
        section_id: Option<&str>,
        candidate_k: i64,
    ) -> Result<Vec<Candidate>> {
        let query_tokens: Vec<String> = tokenize(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query("SELECT chunk_id, cache_id, text, section_id FROM chunks")
            .fetch_all(&self.pool)
            .await?;

        let mut candidates: Vec<Candidate> = rows
            .iter()
            .filter(|row| {
                if let Some(ids) = cache_ids {
                    let cache_id: String = row.get("cache_id");
                    if !ids.contains(&cache_id) {
                        return false;
                    }
                }
                if let Some(section) = section_id {
                    let row_section: Option<String> = row.get("section_id");
                    if row_section.as_deref() != Some(section) {
                        return false;
                    }
                }
                true
            })
            .filter_map(|row| {
                let text: String = row.get("text");
                let chunk_tokens = tokenize(&text);
                let overlap = query_tokens
                    .iter()
                    .filter(|t| chunk_tokens.contains(t))
                    .count();
                if overlap == 0 {
                    return None;
                }
                Some(Candidate {
                    chunk_id: row.get("chunk_id"),
                    raw_score: overlap as f64 / query_tokens.len() as f64,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(candidate_k as usize);
        Ok(candidates)
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    chunk_id: String,
    raw_score: f64,
}

/// Min-max normalize raw scores to `[0.0, 1.0]`. All-equal lists
/// normalize to `1.0`.
fn normalize_scores(candidates: &[Candidate]) -> Vec<(&Candidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Build a safe FTS5 MATCH expression: quoted tokens joined with OR.
fn fts_match_query(query: &str) -> String {
    tokenize(query)
        .into_iter()
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}
