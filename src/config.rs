//! Configuration parsing and validation.
//!
//! Quarry is configured via a TOML file (default: `config/quarry.toml`).
//! The config defines the data directory layout, engine limits, cache TTL,
//! embedding provider settings, chunking parameters, shortlist tuning,
//! and memory thresholds.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub data: DataConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub shortlist: ShortlistConfig,
    #[serde(default)]
    pub query_expansion: QueryExpansionConfig,
    #[serde(default)]
    pub evidence_extraction: EvidenceExtractionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub research: ResearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    /// Root directory holding the database, vector store, reports, and locks.
    pub dir: PathBuf,
}

impl DataConfig {
    pub fn db_path(&self) -> PathBuf {
        self.dir.join("quarry.sqlite")
    }
    pub fn vector_dir(&self) -> PathBuf {
        self.dir.join("vectors")
    }
    pub fn reports_dir(&self) -> PathBuf {
        self.dir.join("reports")
    }
    pub fn locks_dir(&self) -> PathBuf {
        self.dir.join("locks")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_secs: f64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: f64,
    /// Fraction of the model context that triggers proactive compaction.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f64,
    /// `summary_concat` or `llm_summary`.
    #[serde(default = "default_compaction_strategy")]
    pub compaction_strategy: String,
    /// Main model context window in tokens.
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    /// Summarizer model alias. Defaults to the main worker model when unset.
    #[serde(default)]
    pub analysis_model: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            backoff_initial_secs: default_backoff_initial(),
            backoff_max_secs: default_backoff_max(),
            compaction_threshold: default_compaction_threshold(),
            compaction_strategy: default_compaction_strategy(),
            context_limit: default_context_limit(),
            analysis_model: None,
        }
    }
}

fn default_max_turns() -> usize {
    12
}
fn default_request_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_initial() -> f64 {
    1.0
}
fn default_backoff_max() -> f64 {
    32.0
}
fn default_compaction_threshold() -> f64 {
    0.8
}
fn default_compaction_strategy() -> String {
    "summary_concat".to_string()
}
fn default_context_limit() -> usize {
    32_768
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_hours")]
    pub ttl_hours: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_cache_ttl_hours(),
        }
    }
}

fn default_cache_ttl_hours() -> i64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `openai`, `ollama`, or `disabled`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(default)]
    pub local_files_only: bool,
    #[serde(default = "default_embed_retries")]
    pub retry_attempts: u32,
    #[serde(default = "default_embed_backoff")]
    pub retry_backoff_seconds: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum input sequence length of the embedding model, in tokens.
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    /// Endpoint override (Ollama URL or OpenAI-compatible base).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            device: None,
            normalize: true,
            local_files_only: false,
            retry_attempts: default_embed_retries(),
            retry_backoff_seconds: default_embed_backoff(),
            timeout_secs: default_timeout_secs(),
            max_seq_length: default_max_seq_length(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_true() -> bool {
    true
}
fn default_embed_retries() -> u32 {
    5
}
fn default_embed_backoff() -> f64 {
    1.0
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_seq_length() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    400
}
fn default_chunk_overlap() -> usize {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Weight of the dense score in hybrid fusion; lexical gets `1 - w`.
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Pairwise cosine above this marks a candidate as a near-duplicate.
    #[serde(default = "default_near_duplicate")]
    pub near_duplicate_threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dense_weight: default_dense_weight(),
            candidate_k: default_candidate_k(),
            top_k: default_top_k(),
            near_duplicate_threshold: default_near_duplicate(),
        }
    }
}

fn default_dense_weight() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    80
}
fn default_top_k() -> usize {
    8
}
fn default_near_duplicate() -> f64 {
    0.95
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShortlistConfig {
    /// Shortlist in standard mode (research mode defaults to on).
    #[serde(default)]
    pub enabled_standard: bool,
    #[serde(default = "default_true")]
    pub enabled_research: bool,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_max_fetch_urls")]
    pub max_fetch_urls: usize,
    #[serde(default = "default_shortlist_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub search_with_seed_urls: bool,
    #[serde(default = "default_true")]
    pub seed_link_expansion_enabled: bool,
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,
}

impl Default for ShortlistConfig {
    fn default() -> Self {
        Self {
            enabled_standard: false,
            enabled_research: true,
            max_candidates: default_max_candidates(),
            max_fetch_urls: default_max_fetch_urls(),
            top_k: default_shortlist_top_k(),
            search_with_seed_urls: false,
            seed_link_expansion_enabled: true,
            fetch_workers: default_fetch_workers(),
        }
    }
}

fn default_max_candidates() -> usize {
    40
}
fn default_max_fetch_urls() -> usize {
    20
}
fn default_shortlist_top_k() -> usize {
    6
}
fn default_fetch_workers() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryExpansionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `deterministic` or `llm`.
    #[serde(default = "default_expansion_mode")]
    pub mode: String,
    #[serde(default = "default_max_sub_queries")]
    pub max_sub_queries: usize,
}

impl Default for QueryExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: default_expansion_mode(),
            max_sub_queries: default_max_sub_queries(),
        }
    }
}

fn default_expansion_mode() -> String {
    "deterministic".to_string()
}
fn default_max_sub_queries() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvidenceExtractionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_evidence_max_chunks")]
    pub max_chunks: usize,
    /// Skip the shortlist when this many preloaded chunks already match.
    #[serde(default = "default_evidence_skip_threshold")]
    pub evidence_skip_shortlist_threshold: usize,
}

impl Default for EvidenceExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_chunks: default_evidence_max_chunks(),
            evidence_skip_shortlist_threshold: default_evidence_skip_threshold(),
        }
    }
}

fn default_evidence_max_chunks() -> usize {
    6
}
fn default_evidence_skip_threshold() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_recall_top_k")]
    pub recall_top_k: usize,
    #[serde(default = "default_recall_min_similarity")]
    pub recall_min_similarity: f64,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            recall_top_k: default_recall_top_k(),
            recall_min_similarity: default_recall_min_similarity(),
            dedup_threshold: default_dedup_threshold(),
        }
    }
}

fn default_recall_top_k() -> usize {
    5
}
fn default_recall_min_similarity() -> f64 {
    0.35
}
fn default_dedup_threshold() -> f64 {
    0.90
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResearchConfig {
    /// Allowlist of directories local ingestion may read from. Required
    /// for any local ingestion; an empty list disables it.
    #[serde(default)]
    pub local_document_roots: Vec<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Build a config rooted at `data_dir` with every default, for running
/// without a config file (and for tests).
pub fn default_at(data_dir: &Path) -> Config {
    Config {
        data: DataConfig {
            dir: data_dir.to_path_buf(),
        },
        engine: EngineConfig::default(),
        cache: CacheConfig::default(),
        embedding: EmbeddingConfig::default(),
        chunking: ChunkingConfig::default(),
        retrieval: RetrievalConfig::default(),
        shortlist: ShortlistConfig::default(),
        query_expansion: QueryExpansionConfig::default(),
        evidence_extraction: EvidenceExtractionConfig::default(),
        memory: MemoryConfig::default(),
        research: ResearchConfig::default(),
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }
    if !(0.0..=1.0).contains(&config.retrieval.dense_weight) {
        anyhow::bail!("retrieval.dense_weight must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.engine.compaction_threshold) {
        anyhow::bail!("engine.compaction_threshold must be in [0.0, 1.0]");
    }
    match config.engine.compaction_strategy.as_str() {
        "summary_concat" | "llm_summary" => {}
        other => anyhow::bail!(
            "Unknown compaction strategy: '{}'. Must be summary_concat or llm_summary.",
            other
        ),
    }
    match config.query_expansion.mode.as_str() {
        "deterministic" | "llm" => {}
        other => anyhow::bail!(
            "Unknown query expansion mode: '{}'. Must be deterministic or llm.",
            other
        ),
    }
    if config.engine.max_turns == 0 {
        anyhow::bail!("engine.max_turns must be >= 1");
    }
    if config.cache.ttl_hours <= 0 {
        anyhow::bail!("cache.ttl_hours must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.memory.dedup_threshold) {
        anyhow::bail!("memory.dedup_threshold must be in [0.0, 1.0]");
    }

    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse("[data]\ndir = \"/tmp/quarry\"\n").unwrap();
        assert_eq!(cfg.cache.ttl_hours, 24);
        assert_eq!(cfg.memory.dedup_threshold, 0.90);
        assert_eq!(cfg.memory.recall_min_similarity, 0.35);
        assert_eq!(cfg.shortlist.max_candidates, 40);
        assert_eq!(cfg.shortlist.max_fetch_urls, 20);
        assert_eq!(cfg.engine.compaction_threshold, 0.8);
        assert!(cfg.engine.analysis_model.is_none());
    }

    #[test]
    fn data_dir_layout() {
        let cfg = default_at(Path::new("/tmp/q"));
        assert_eq!(cfg.data.db_path(), PathBuf::from("/tmp/q/quarry.sqlite"));
        assert_eq!(cfg.data.vector_dir(), PathBuf::from("/tmp/q/vectors"));
        assert_eq!(cfg.data.locks_dir(), PathBuf::from("/tmp/q/locks"));
    }

    #[test]
    fn rejects_bad_dense_weight() {
        let err = parse("[data]\ndir = \"/tmp/q\"\n[retrieval]\ndense_weight = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("dense_weight"));
    }

    #[test]
    fn rejects_overlap_ge_chunk_size() {
        let err = parse(
            "[data]\ndir = \"/tmp/q\"\n[chunking]\nchunk_size = 100\nchunk_overlap = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn rejects_unknown_compaction_strategy() {
        let err = parse("[data]\ndir = \"/tmp/q\"\n[engine]\ncompaction_strategy = \"drop\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("compaction strategy"));
    }

    #[test]
    fn embedding_requires_model_and_dims() {
        let err =
            parse("[data]\ndir = \"/tmp/q\"\n[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }
}
