//! Embedding client abstraction and implementations.
//!
//! Defines the [`EmbeddingClient`] trait and concrete implementations:
//! - **[`OpenAiEmbedder`]** — calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaEmbedder`]** — calls a local Ollama instance's `/api/embed` endpoint.
//!
//! The process-wide client is created lazily behind a lock via
//! [`shared`]; tests inject fakes through the trait instead.
//!
//! Also provides vector utilities for BLOB-backed storage:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`] — decode a BLOB back into a `Vec<f32>`
//!
//! # Retry Strategy
//!
//! HTTP 429 and 5xx retry with exponential backoff from
//! `retry_backoff_seconds`; other 4xx fail immediately; network errors
//! retry.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Trait for embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Stable model identifier stored beside every vector row.
    fn model_id(&self) -> &str;
    /// Embedding dimensionality.
    fn dims(&self) -> usize;
    /// Maximum input sequence length in tokens.
    fn max_seq_length(&self) -> usize;
    /// Encode a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Encode a single query text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vecs = self.embed(&[text.to_string()]).await?;
        if vecs.is_empty() {
            bail!("Empty embedding response");
        }
        Ok(vecs.remove(0))
    }
}

static SHARED: OnceLock<Arc<dyn EmbeddingClient>> = OnceLock::new();

/// Process-wide shared client, created lazily on first use. Concurrent
/// callers race on initialization; `OnceLock` guarantees one winner.
pub fn shared(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingClient>> {
    if let Some(client) = SHARED.get() {
        return Ok(Arc::clone(client));
    }
    let created = create_client(config)?;
    let _ = SHARED.set(Arc::clone(&created));
    Ok(Arc::clone(SHARED.get().unwrap_or(&created)))
}

/// Create an [`EmbeddingClient`] from configuration.
pub fn create_client(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingClient>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// A no-op client used when embeddings are not configured. Any attempt
/// to embed fails with a descriptive error.
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingClient for DisabledEmbedder {
    fn model_id(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    fn max_seq_length(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled; set [embedding] provider in config")
    }
}

fn require_model(config: &EmbeddingConfig) -> Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required"))
}

fn require_dims(config: &EmbeddingConfig) -> Result<usize> {
    config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required"))
}

// ============ OpenAI ============

/// Embedding client using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    config: EmbeddingConfig,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = require_model(config)?;
        let dims = require_dims(config)?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            model,
            dims,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_seq_length(&self) -> usize {
        self.config.max_seq_length
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let base = self
            .config
            .url
            .as_deref()
            .unwrap_or("https://api.openai.com");

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()?;

        let mut out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let body = serde_json::json!({
                "model": self.model,
                "input": batch,
            });

            let mut last_err = None;
            let mut done = false;

            for attempt in 0..=self.config.retry_attempts {
                if attempt > 0 {
                    let delay =
                        self.config.retry_backoff_seconds * f64::from(1u32 << (attempt - 1).min(5));
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }

                let resp = client
                    .post(format!("{}/v1/embeddings", base))
                    .header("Authorization", format!("Bearer {}", api_key))
                    .header("Content-Type", "application/json")
                    .json(&body)
                    .send()
                    .await;

                match resp {
                    Ok(response) => {
                        let status = response.status();
                        if status.is_success() {
                            let json: serde_json::Value = response.json().await?;
                            out.extend(normalize_batch(
                                parse_openai_response(&json)?,
                                self.config.normalize,
                            ));
                            done = true;
                            break;
                        }
                        if status.as_u16() == 429 || status.is_server_error() {
                            let body_text = response.text().await.unwrap_or_default();
                            last_err =
                                Some(anyhow::anyhow!("OpenAI API error {}: {}", status, body_text));
                            continue;
                        }
                        let body_text = response.text().await.unwrap_or_default();
                        bail!("OpenAI API error {}: {}", status, body_text);
                    }
                    Err(e) => {
                        last_err = Some(e.into());
                        continue;
                    }
                }
            }

            if !done {
                return Err(
                    last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries"))
                );
            }
        }

        Ok(out)
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

// ============ Ollama ============

/// Embedding client using a local Ollama instance's `/api/embed`.
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    config: EmbeddingConfig,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = require_model(config)?;
        let dims = require_dims(config)?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model,
            dims,
            url,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingClient for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_seq_length(&self) -> usize {
        self.config.max_seq_length
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()?;

        let mut out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let body = serde_json::json!({
                "model": self.model,
                "input": batch,
            });

            let mut last_err = None;
            let mut done = false;

            for attempt in 0..=self.config.retry_attempts {
                if attempt > 0 {
                    let delay =
                        self.config.retry_backoff_seconds * f64::from(1u32 << (attempt - 1).min(5));
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }

                let resp = client
                    .post(format!("{}/api/embed", self.url))
                    .header("Content-Type", "application/json")
                    .json(&body)
                    .send()
                    .await;

                match resp {
                    Ok(response) => {
                        let status = response.status();
                        if status.is_success() {
                            let json: serde_json::Value = response.json().await?;
                            out.extend(normalize_batch(
                                parse_ollama_response(&json)?,
                                self.config.normalize,
                            ));
                            done = true;
                            break;
                        }
                        if status.as_u16() == 429 || status.is_server_error() {
                            let body_text = response.text().await.unwrap_or_default();
                            last_err =
                                Some(anyhow::anyhow!("Ollama API error {}: {}", status, body_text));
                            continue;
                        }
                        let body_text = response.text().await.unwrap_or_default();
                        bail!("Ollama API error {}: {}", status, body_text);
                    }
                    Err(e) => {
                        last_err = Some(anyhow::anyhow!(
                            "Ollama connection error (is Ollama running at {}?): {}",
                            self.url,
                            e
                        ));
                        continue;
                    }
                }
            }

            if !done {
                return Err(last_err
                    .unwrap_or_else(|| anyhow::anyhow!("Ollama embedding failed after retries")));
            }
        }

        Ok(out)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

fn normalize_batch(vecs: Vec<Vec<f32>>, normalize: bool) -> Vec<Vec<f32>> {
    if !normalize {
        return vecs;
    }
    vecs.into_iter().map(|v| l2_normalize(v)).collect()
}

/// Scale a vector to unit length. Zero vectors pass through unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn l2_normalize_unit_length() {
        let v = l2_normalize(vec![3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_zero_vector_unchanged() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn parse_openai_shape() {
        let json = serde_json::json!({
            "data": [
                {"embedding": [0.1, 0.2]},
                {"embedding": [0.3, 0.4]},
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs.len(), 2);
        assert!((vecs[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn parse_ollama_shape() {
        let json = serde_json::json!({"embeddings": [[1.0, 0.0], [0.0, 1.0]]});
        let vecs = parse_ollama_response(&json).unwrap();
        assert_eq!(vecs.len(), 2);
    }

    #[test]
    fn create_client_handles_disabled_and_unknown() {
        let cfg = EmbeddingConfig::default();
        let client = create_client(&cfg).unwrap();
        assert_eq!(client.model_id(), "disabled");

        let mut cfg = EmbeddingConfig::default();
        cfg.provider = "mystery".to_string();
        assert!(create_client(&cfg).is_err());
    }

    #[tokio::test]
    async fn disabled_embedder_errors_on_use() {
        let err = DisabledEmbedder.embed(&["x".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }
}
