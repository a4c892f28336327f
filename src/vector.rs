//! Vector backend abstraction.
//!
//! The relational store is authoritative; the vector backend is a
//! replaceable cosine nearest-neighbor accelerator with one collection
//! per record family. When the backend errors or a collection is empty,
//! the caller (`index`, `memory`) degrades to a relational BLOB scan.
//!
//! Metadata filters are emitted as `$and` of single-operator predicates
//! so strict metadata parsers accept them.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Record families stored in the vector backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Chunks,
    Links,
    Findings,
    UserMemories,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Chunks => "chunks",
            Collection::Links => "links",
            Collection::Findings => "findings",
            Collection::UserMemories => "user_memories",
        }
    }
}

/// A vector row with its metadata.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: Value,
}

/// A nearest-neighbor match. `score` is cosine similarity.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub metadata: Value,
}

/// Conjunction of single-operator predicates over record metadata.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone)]
enum Clause {
    Eq(String, Value),
    In(String, Vec<Value>),
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(key.to_string(), value.into()));
        self
    }

    pub fn is_in(mut self, key: &str, values: Vec<Value>) -> Self {
        self.clauses.push(Clause::In(key.to_string(), values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Render as a Chroma-style `where` document. Every clause carries
    /// exactly one operator; conjunctions wrap in `$and`.
    pub fn to_where(&self) -> Option<Value> {
        let rendered: Vec<Value> = self
            .clauses
            .iter()
            .map(|clause| match clause {
                Clause::Eq(k, v) => json!({ k: { "$eq": v } }),
                Clause::In(k, vs) => json!({ k: { "$in": vs } }),
            })
            .collect();

        match rendered.len() {
            0 => None,
            1 => Some(rendered.into_iter().next().unwrap()),
            _ => Some(json!({ "$and": rendered })),
        }
    }

    /// Evaluate the filter against a metadata document locally, used by
    /// the relational fallback path.
    pub fn matches(&self, metadata: &Value) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Eq(k, v) => metadata.get(k) == Some(v),
            Clause::In(k, vs) => metadata
                .get(k)
                .map(|m| vs.iter().any(|v| v == m))
                .unwrap_or(false),
        })
    }
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn upsert(&self, collection: Collection, records: Vec<VectorRecord>) -> Result<()>;
    async fn delete_ids(&self, collection: Collection, ids: &[String]) -> Result<()>;
    async fn delete_where(&self, collection: Collection, filter: &MetadataFilter) -> Result<()>;
    async fn query(
        &self,
        collection: Collection,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>>;
    async fn count(&self, collection: Collection) -> Result<u64>;
}

// ============ Chroma-style HTTP backend ============

/// Client for a Chroma-compatible vector server.
///
/// Collections are created on first use (`get_or_create`) and their ids
/// cached per client. One client instance is shared across collections.
pub struct ChromaBackend {
    base_url: String,
    client: reqwest::Client,
    collection_ids: Mutex<HashMap<Collection, String>>,
}

impl ChromaBackend {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            collection_ids: Mutex::new(HashMap::new()),
        })
    }

    async fn collection_id(&self, collection: Collection) -> Result<String> {
        if let Some(id) = self
            .collection_ids
            .lock()
            .expect("collection id lock")
            .get(&collection)
        {
            return Ok(id.clone());
        }

        let resp = self
            .client
            .post(format!("{}/api/v1/collections", self.base_url))
            .json(&json!({
                "name": collection.name(),
                "get_or_create": true,
                "metadata": { "hnsw:space": "cosine" },
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            bail!(
                "vector backend error {} creating collection {}",
                resp.status(),
                collection.name()
            );
        }

        let body: Value = resp.json().await?;
        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("vector backend returned no collection id"))?
            .to_string();

        self.collection_ids
            .lock()
            .expect("collection id lock")
            .insert(collection, id.clone());
        Ok(id)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("vector backend error {}: {}", status, text);
        }
        Ok(resp.json().await.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl VectorBackend for ChromaBackend {
    async fn upsert(&self, collection: Collection, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let id = self.collection_id(collection).await?;
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let embeddings: Vec<&Vec<f32>> = records.iter().map(|r| &r.embedding).collect();
        let metadatas: Vec<&Value> = records.iter().map(|r| &r.metadata).collect();
        self.post(
            &format!("/api/v1/collections/{}/upsert", id),
            json!({ "ids": ids, "embeddings": embeddings, "metadatas": metadatas }),
        )
        .await?;
        Ok(())
    }

    async fn delete_ids(&self, collection: Collection, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let id = self.collection_id(collection).await?;
        self.post(
            &format!("/api/v1/collections/{}/delete", id),
            json!({ "ids": ids }),
        )
        .await?;
        Ok(())
    }

    async fn delete_where(&self, collection: Collection, filter: &MetadataFilter) -> Result<()> {
        let Some(where_doc) = filter.to_where() else {
            return Ok(());
        };
        let id = self.collection_id(collection).await?;
        self.post(
            &format!("/api/v1/collections/{}/delete", id),
            json!({ "where": where_doc }),
        )
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: Collection,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>> {
        let id = self.collection_id(collection).await?;
        let mut body = json!({
            "query_embeddings": [embedding],
            "n_results": k,
            "include": ["distances", "metadatas"],
        });
        if let Some(where_doc) = filter.and_then(|f| f.to_where()) {
            body["where"] = where_doc;
        }

        let resp = self
            .post(&format!("/api/v1/collections/{}/query", id), body)
            .await?;

        let ids = resp
            .get("ids")
            .and_then(|v| v.get(0))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let distances = resp
            .get("distances")
            .and_then(|v| v.get(0))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let metadatas = resp
            .get("metadatas")
            .and_then(|v| v.get(0))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut matches = Vec::with_capacity(ids.len());
        for (i, id_val) in ids.iter().enumerate() {
            let Some(match_id) = id_val.as_str() else {
                continue;
            };
            let distance = distances.get(i).and_then(|d| d.as_f64()).unwrap_or(1.0);
            matches.push(VectorMatch {
                id: match_id.to_string(),
                // Cosine distance → similarity.
                score: (1.0 - distance) as f32,
                metadata: metadatas.get(i).cloned().unwrap_or(Value::Null),
            });
        }
        Ok(matches)
    }

    async fn count(&self, collection: Collection) -> Result<u64> {
        let id = self.collection_id(collection).await?;
        let resp = self
            .client
            .get(format!(
                "{}/api/v1/collections/{}/count",
                self.base_url, id
            ))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("vector backend error {} on count", resp.status());
        }
        Ok(resp.json::<u64>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_clause_has_no_and_wrapper() {
        let filter = MetadataFilter::new().eq("model_id", "m1");
        let doc = filter.to_where().unwrap();
        assert_eq!(doc, json!({ "model_id": { "$eq": "m1" } }));
    }

    #[test]
    fn conjunction_wraps_in_and() {
        let filter = MetadataFilter::new()
            .eq("model_id", "m1")
            .is_in("cache_id", vec![json!("a"), json!("b")]);
        let doc = filter.to_where().unwrap();
        let and = doc.get("$and").and_then(|v| v.as_array()).unwrap();
        assert_eq!(and.len(), 2);
        // Every clause carries exactly one operator.
        for clause in and {
            let obj = clause.as_object().unwrap();
            assert_eq!(obj.len(), 1);
            let inner = obj.values().next().unwrap().as_object().unwrap();
            assert_eq!(inner.len(), 1);
        }
    }

    #[test]
    fn empty_filter_renders_nothing() {
        assert!(MetadataFilter::new().to_where().is_none());
    }

    #[test]
    fn local_matches_mirror_where_semantics() {
        let filter = MetadataFilter::new()
            .eq("model_id", "m1")
            .is_in("cache_id", vec![json!("a"), json!("b")]);
        assert!(filter.matches(&json!({ "model_id": "m1", "cache_id": "b" })));
        assert!(!filter.matches(&json!({ "model_id": "m2", "cache_id": "b" })));
        assert!(!filter.matches(&json!({ "model_id": "m1", "cache_id": "c" })));
        assert!(!filter.matches(&json!({ "model_id": "m1" })));
    }

    #[test]
    fn collection_names_are_stable() {
        assert_eq!(Collection::Chunks.name(), "chunks");
        assert_eq!(Collection::UserMemories.name(), "user_memories");
    }
}
