//! Shared fakes and fixtures for unit tests.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::embedding::{l2_normalize, EmbeddingClient};
use crate::migrate;

/// Deterministic hash-bucket embedder: identical texts embed
/// identically, disjoint vocabularies are near-orthogonal.
pub struct FakeEmbedder;

pub fn bucket_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 64];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_lowercase())
    {
        let mut h: u64 = 1469598103934665603;
        for b in token.bytes() {
            h ^= u64::from(b);
            h = h.wrapping_mul(1099511628211);
        }
        v[(h % 64) as usize] += 1.0;
    }
    l2_normalize(v)
}

#[async_trait]
impl EmbeddingClient for FakeEmbedder {
    fn model_id(&self) -> &str {
        "fake-64"
    }
    fn dims(&self) -> usize {
        64
    }
    fn max_seq_length(&self) -> usize {
        512
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| bucket_vector(t)).collect())
    }
}

pub fn fake_embedder() -> Arc<dyn EmbeddingClient> {
    Arc::new(FakeEmbedder)
}

/// Fresh in-memory database with the full schema applied. A single
/// connection: pooled connections would each see their own `:memory:`
/// database.
pub async fn memory_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate::apply(&pool).await.unwrap();
    pool
}

/// A clock that tests can advance by hand.
#[derive(Clone)]
pub struct ManualClock(pub std::sync::Arc<std::sync::atomic::AtomicI64>);

impl ManualClock {
    pub fn at(start: i64) -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicI64::new(
            start,
        )))
    }

    pub fn advance(&self, seconds: i64) {
        self.0
            .fetch_add(seconds, std::sync::atomic::Ordering::SeqCst);
    }
}

impl crate::cache::Clock for ManualClock {
    fn now_unix(&self) -> i64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
