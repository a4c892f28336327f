//! Deterministic pre-model context assembly.
//!
//! Before the first LLM call, the pipeline (1) ingests any local corpus,
//! (2) preloads explicit seed URLs under a token budget, (3) optionally
//! runs the shortlist, and (4) bootstraps one retrieval pass over the
//! preloaded corpus in research mode. Small models then reason over
//! grounded context instead of choosing whether to gather it.
//!
//! Seed blocks carry one of four labels: `full_content`,
//! `summarized_due_budget`, `summary_truncated_due_budget`, or
//! `fetch_error`. When every seed lands as `full_content`, the turn's
//! web retrieval tools are disabled and a strict direct-answer
//! instruction replaces the exploratory one.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::Cache;
use crate::chunker::{approx_tokens, summarize_extractive, ChunkParams};
use crate::config::Config;
use crate::error::Result;
use crate::fetch::HttpFetcher;
use crate::index::HybridIndex;
use crate::ingest;
use crate::loader::{self, FsLoader};
use crate::models::{PreloadProvenance, PreloadStatus};
use crate::session::SessionStore;
use crate::shortlist::Shortlist;
use crate::urlnorm;

/// Token budget for a summarized seed block.
const SEED_SUMMARY_TOKENS: usize = 500;
/// Fraction of the model context the preload may consume.
const PRELOAD_BUDGET_FRACTION: f64 = 0.8;

/// Web retrieval tools hidden when the preload is complete.
pub const WEB_TOOLS: &[&str] = &["web_search", "get_url_content", "get_url_details"];

/// User-requested shortlist override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShortlistOverride {
    #[default]
    Auto,
    On,
    Off,
}

impl std::str::FromStr for ShortlistOverride {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(ShortlistOverride::Auto),
            "on" => Ok(ShortlistOverride::On),
            "off" => Ok(ShortlistOverride::Off),
            other => Err(crate::error::Error::InvalidArgument(format!(
                "shortlist must be auto, on, or off (got '{}')",
                other
            ))),
        }
    }
}

/// Inputs to the shortlist policy gate, highest precedence first:
/// `lean > explicit request > session > model > global > mode-default`.
/// A `local_only` session disables the web shortlist even over an
/// explicit `on`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShortlistPolicy {
    pub lean: bool,
    pub local_only: bool,
    pub explicit: ShortlistOverride,
    pub session_default: Option<bool>,
    pub model_default: Option<bool>,
    pub global_default: Option<bool>,
    pub mode_default: bool,
}

impl ShortlistPolicy {
    pub fn resolve(&self) -> bool {
        if self.lean || self.local_only {
            return false;
        }
        match self.explicit {
            ShortlistOverride::On => return true,
            ShortlistOverride::Off => return false,
            ShortlistOverride::Auto => {}
        }
        self.session_default
            .or(self.model_default)
            .or(self.global_default)
            .unwrap_or(self.mode_default)
    }
}

/// What a preload run produced for the turn.
#[derive(Debug, Clone, Default)]
pub struct PreloadOutcome {
    /// Blocks inserted into the first user message, in order.
    pub context_blocks: Vec<String>,
    pub provenance: PreloadProvenance,
    /// Cache ids materialized this turn (local + seeds).
    pub corpus_ids: Vec<String>,
    /// Tools to hide for the rest of the turn.
    pub disabled_tools: Vec<String>,
    /// All seeds landed complete: answer directly, no web retrieval.
    pub seeds_complete: bool,
    pub shortlist_ran: bool,
}

pub struct PreloadRequest<'a> {
    pub prompt: &'a str,
    pub research_mode: bool,
    pub lean: bool,
    pub shortlist_override: ShortlistOverride,
    pub local_corpus_paths: Vec<PathBuf>,
    pub local_only: bool,
    pub session_id: Option<&'a str>,
    pub session_shortlist_default: Option<bool>,
}

pub struct PreloadPipeline {
    cache: Arc<Cache>,
    index: Arc<HybridIndex>,
    fetcher: Arc<dyn HttpFetcher>,
    shortlist: Arc<Shortlist>,
    sessions: Arc<SessionStore>,
    config: Config,
}

impl PreloadPipeline {
    pub fn new(
        cache: Arc<Cache>,
        index: Arc<HybridIndex>,
        fetcher: Arc<dyn HttpFetcher>,
        shortlist: Arc<Shortlist>,
        sessions: Arc<SessionStore>,
        config: Config,
    ) -> Self {
        Self {
            cache,
            index,
            fetcher,
            shortlist,
            sessions,
            config,
        }
    }

    fn chunking(&self) -> ChunkParams {
        ChunkParams {
            chunk_size: self.config.chunking.chunk_size,
            overlap: self.config.chunking.chunk_overlap,
            max_seq_length: self.config.embedding.max_seq_length,
        }
    }

    pub async fn run(&self, request: &PreloadRequest<'_>) -> Result<PreloadOutcome> {
        let mut outcome = PreloadOutcome::default();
        if request.lean {
            return Ok(outcome);
        }

        let budget_tokens =
            (self.config.engine.context_limit as f64 * PRELOAD_BUDGET_FRACTION) as usize;
        let mut remaining = budget_tokens;

        // Stage 1: local ingestion.
        let local_paths = self.resolve_local_paths(request);
        if !local_paths.is_empty() {
            let fs_loader = FsLoader::new(self.config.research.local_document_roots.clone());
            let files = fs_loader.expand_paths(&local_paths)?;
            for file in files {
                let entry = ingest::materialize_local(
                    &self.cache,
                    &self.index,
                    &fs_loader,
                    &self.chunking(),
                    &file,
                )
                .await?;
                if let Some(session_id) = request.session_id {
                    self.sessions.link_document(session_id, &entry.cache_id).await?;
                }
                outcome.context_blocks.push(format!(
                    "[local corpus: {} | handle {}]",
                    file.display(),
                    urlnorm::corpus_handle(&entry.cache_id),
                ));
                outcome.corpus_ids.push(entry.cache_id);
            }
        }

        // Stage 2: seed URL preload.
        let seeds = urlnorm::extract_seed_urls(request.prompt);
        if !seeds.is_empty() {
            for seed in &seeds {
                let (block, status, cache_id) = self.preload_seed(seed, &mut remaining).await;
                outcome.context_blocks.push(block);
                outcome.provenance.entries.push((seed.clone(), status));
                if let Some(id) = cache_id {
                    outcome.corpus_ids.push(id);
                }
            }
            outcome.seeds_complete = outcome.provenance.is_complete();
            if outcome.seeds_complete {
                outcome
                    .disabled_tools
                    .extend(WEB_TOOLS.iter().map(|t| t.to_string()));
            }
        }

        // Stage 5 gate decides stage 3.
        let policy = ShortlistPolicy {
            lean: request.lean,
            local_only: request.local_only,
            explicit: request.shortlist_override,
            session_default: request.session_shortlist_default,
            model_default: None,
            global_default: Some(if request.research_mode {
                self.config.shortlist.enabled_research
            } else {
                self.config.shortlist.enabled_standard
            }),
            mode_default: request.research_mode,
        };

        // Stage 3: shortlist.
        if policy.resolve() {
            match self.shortlist.run(request.prompt).await {
                Ok(output) => {
                    if !output.context_block.is_empty() {
                        outcome
                            .context_blocks
                            .push(format!("[ranked sources]\n{}", output.context_block));
                    }
                    outcome.shortlist_ran = true;
                }
                Err(e) => warn!(error = %e, "shortlist failed, continuing without it"),
            }
        }

        // Stage 4: bootstrap retrieval over the preloaded corpus.
        if request.research_mode
            && self.config.evidence_extraction.enabled
            && !outcome.corpus_ids.is_empty()
        {
            let query = urlnorm::strip_urls(request.prompt);
            let query = if query.is_empty() {
                request.prompt
            } else {
                &query
            };
            match self
                .index
                .search_chunks(
                    query,
                    Some(&outcome.corpus_ids),
                    None,
                    self.config.evidence_extraction.max_chunks,
                    None,
                )
                .await
            {
                Ok(search) if !search.results.is_empty() => {
                    let mut block = String::from("[evidence snippets]\n");
                    for chunk in &search.results {
                        block.push_str(&format!(
                            "- ({}) {}\n",
                            chunk
                                .section_id
                                .as_deref()
                                .unwrap_or("no-section"),
                            summarize_extractive(&chunk.text, 80),
                        ));
                    }
                    outcome.context_blocks.push(block.trim_end().to_string());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "bootstrap retrieval failed"),
            }
        }

        debug!(
            blocks = outcome.context_blocks.len(),
            seeds_complete = outcome.seeds_complete,
            "preload assembled"
        );
        Ok(outcome)
    }

    /// Paths from the request plus local-target tokens in the prompt.
    fn resolve_local_paths(&self, request: &PreloadRequest<'_>) -> Vec<PathBuf> {
        let mut paths = request.local_corpus_paths.clone();
        for token in request.prompt.split_whitespace() {
            let trimmed: &str = token
                .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ')' | '"' | '\''));
            if (trimmed.starts_with('/') || trimmed.starts_with("~/"))
                && loader::is_supported(std::path::Path::new(trimmed))
            {
                paths.push(PathBuf::from(trimmed));
            }
        }
        paths.dedup();
        paths
    }

    async fn preload_seed(
        &self,
        seed: &str,
        remaining: &mut usize,
    ) -> (String, PreloadStatus, Option<String>) {
        let had_row = matches!(self.cache.get(seed).await, Ok(Some(_)));
        let entry = match ingest::materialize_url(
            &self.cache,
            &self.index,
            self.fetcher.as_ref(),
            &self.chunking(),
            seed,
        )
        .await
        {
            Ok(entry) => entry,
            Err(e) => {
                return (
                    format!("[{} | fetch_error] {}", seed, e),
                    PreloadStatus::FetchError,
                    None,
                );
            }
        };

        // A stale row returned after a failed refetch is transient, not
        // complete.
        let fresh = self.cache.is_fresh(&entry);
        if had_row && !fresh {
            return (
                format!("[{} | fetch_error] stale cached copy only", seed),
                PreloadStatus::FetchError,
                Some(entry.cache_id.clone()),
            );
        }

        let tokens = approx_tokens(&entry.content_text);
        if tokens <= *remaining {
            *remaining -= tokens;
            return (
                format!(
                    "[{} | full_content]\n{}",
                    entry.canonical_url, entry.content_text
                ),
                PreloadStatus::FullContent,
                Some(entry.cache_id.clone()),
            );
        }

        let summary = summarize_extractive(&entry.content_text, SEED_SUMMARY_TOKENS);
        let summary_tokens = approx_tokens(&summary);
        if summary_tokens <= *remaining {
            *remaining -= summary_tokens;
            (
                format!(
                    "[{} | summarized_due_budget]\n{}",
                    entry.canonical_url, summary
                ),
                PreloadStatus::SummarizedDueBudget,
                Some(entry.cache_id.clone()),
            )
        } else {
            let truncated: String = summary.chars().take(*remaining * 4).collect();
            *remaining = 0;
            (
                format!(
                    "[{} | summary_truncated_due_budget]\n{}",
                    entry.canonical_url, truncated
                ),
                PreloadStatus::SummaryTruncatedDueBudget,
                Some(entry.cache_id.clone()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, MemoryConfig, RetrievalConfig};
    use crate::fetch::FetchedPage;
    use crate::memory::MemoryStore;
    use crate::testutil::{self, ManualClock};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MapFetcher(Mutex<HashMap<String, String>>);

    #[async_trait]
    impl HttpFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage> {
            let map = self.0.lock().unwrap();
            match map.get(url) {
                Some(body) => Ok(FetchedPage {
                    url: url.to_string(),
                    status: 200,
                    content_type: "text/html".to_string(),
                    body: body.clone(),
                }),
                None => Err(crate::error::Error::transport(
                    format!("HTTP 404 from {}", url),
                    false,
                )),
            }
        }
    }

    struct Fixture {
        pipeline: PreloadPipeline,
        _tmp: tempfile::TempDir,
    }

    async fn fixture(pages: &[(&str, &str)], cfg_mut: impl FnOnce(&mut Config)) -> Fixture {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = config::default_at(tmp.path());
        cfg_mut(&mut config);

        let pool = testutil::memory_pool().await;
        let embedder = testutil::fake_embedder();
        let index = Arc::new(HybridIndex::new(
            pool.clone(),
            None,
            Arc::clone(&embedder),
            RetrievalConfig::default(),
        ));
        let clock = Arc::new(ManualClock::at(1_000));
        let cache = Arc::new(Cache::new(
            pool.clone(),
            Arc::clone(&index),
            clock.clone(),
            config.cache.ttl_hours,
        ));
        let fetcher: Arc<dyn HttpFetcher> = Arc::new(MapFetcher(Mutex::new(
            pages
                .iter()
                .map(|(u, b)| (u.to_string(), b.to_string()))
                .collect(),
        )));
        let shortlist = Arc::new(Shortlist::new(
            Arc::clone(&cache),
            Arc::clone(&embedder),
            Arc::clone(&fetcher),
            None,
            config.shortlist.clone(),
            config.query_expansion.clone(),
        ));
        let memory = Arc::new(MemoryStore::new(
            pool.clone(),
            None,
            embedder,
            MemoryConfig::default(),
            clock.clone(),
        ));
        let sessions = Arc::new(SessionStore::new(
            pool,
            memory,
            clock,
            config.data.locks_dir(),
        ));
        Fixture {
            pipeline: PreloadPipeline::new(cache, index, fetcher, shortlist, sessions, config),
            _tmp: tmp,
        }
    }

    fn request(prompt: &str) -> PreloadRequest<'_> {
        PreloadRequest {
            prompt,
            research_mode: false,
            lean: false,
            shortlist_override: ShortlistOverride::Auto,
            local_corpus_paths: Vec::new(),
            local_only: false,
            session_id: None,
            session_shortlist_default: None,
        }
    }

    #[test]
    fn policy_precedence() {
        // lean beats everything
        assert!(!ShortlistPolicy {
            lean: true,
            explicit: ShortlistOverride::On,
            mode_default: true,
            ..Default::default()
        }
        .resolve());

        // local_only beats explicit on
        assert!(!ShortlistPolicy {
            local_only: true,
            explicit: ShortlistOverride::On,
            mode_default: true,
            ..Default::default()
        }
        .resolve());

        // explicit beats session/global
        assert!(ShortlistPolicy {
            explicit: ShortlistOverride::On,
            session_default: Some(false),
            global_default: Some(false),
            ..Default::default()
        }
        .resolve());

        // session beats model and global
        assert!(ShortlistPolicy {
            session_default: Some(true),
            model_default: Some(false),
            global_default: Some(false),
            ..Default::default()
        }
        .resolve());

        // mode default is the last resort
        assert!(ShortlistPolicy {
            mode_default: true,
            ..Default::default()
        }
        .resolve());
        assert!(!ShortlistPolicy {
            mode_default: false,
            ..Default::default()
        }
        .resolve());
    }

    #[tokio::test]
    async fn lean_skips_all_stages() {
        let f = fixture(&[("https://a.org", "<p>body</p>")], |_| {}).await;
        let mut req = request("summarize https://a.org");
        req.lean = true;
        let outcome = f.pipeline.run(&req).await.unwrap();
        assert!(outcome.context_blocks.is_empty());
        assert!(outcome.provenance.entries.is_empty());
    }

    #[tokio::test]
    async fn seed_preload_complete_disables_web_tools() {
        let f = fixture(
            &[
                (
                    "https://example.org/a",
                    "<html><title>Alpha Page</title><body><p>Alpha content here.</p></body></html>",
                ),
                (
                    "https://example.org/b",
                    "<html><title>Beta Page</title><body><p>Beta content here.</p></body></html>",
                ),
            ],
            |_| {},
        )
        .await;

        let outcome = f
            .pipeline
            .run(&request(
                "Summarize https://example.org/a and https://example.org/b",
            ))
            .await
            .unwrap();

        assert_eq!(outcome.provenance.entries.len(), 2);
        assert!(outcome.seeds_complete);
        for (_, status) in &outcome.provenance.entries {
            assert_eq!(*status, PreloadStatus::FullContent);
        }
        for tool in WEB_TOOLS {
            assert!(outcome.disabled_tools.contains(&tool.to_string()));
        }
        assert!(outcome
            .context_blocks
            .iter()
            .any(|b| b.contains("Alpha content")));
    }

    #[tokio::test]
    async fn fetch_error_block_keeps_other_seeds() {
        let f = fixture(
            &[(
                "https://ok.org",
                "<html><body><p>Fine content.</p></body></html>",
            )],
            |_| {},
        )
        .await;

        let outcome = f
            .pipeline
            .run(&request("compare https://ok.org and https://gone.org"))
            .await
            .unwrap();

        assert_eq!(outcome.provenance.entries.len(), 2);
        assert!(!outcome.seeds_complete);
        assert!(outcome.disabled_tools.is_empty());
        let statuses: Vec<PreloadStatus> =
            outcome.provenance.entries.iter().map(|(_, s)| *s).collect();
        assert!(statuses.contains(&PreloadStatus::FullContent));
        assert!(statuses.contains(&PreloadStatus::FetchError));
    }

    #[tokio::test]
    async fn oversize_seed_is_summarized() {
        let big_body = format!(
            "<html><body><p>{}</p></body></html>",
            "A very long sentence about the research corpus. ".repeat(500)
        );
        let f = fixture(&[("https://big.org", big_body.as_str())], |cfg| {
            cfg.engine.context_limit = 2_000; // budget = 1600 tokens
        })
        .await;

        let outcome = f
            .pipeline
            .run(&request("summarize https://big.org"))
            .await
            .unwrap();

        assert_eq!(outcome.provenance.entries.len(), 1);
        assert_eq!(
            outcome.provenance.entries[0].1,
            PreloadStatus::SummarizedDueBudget
        );
        assert!(!outcome.seeds_complete);
        assert!(outcome.context_blocks[0].contains("summarized_due_budget"));
    }

    #[tokio::test]
    async fn local_corpus_ingests_and_links() {
        let docs = tempfile::TempDir::new().unwrap();
        let paper = docs.path().join("paper.md");
        std::fs::write(
            &paper,
            format!(
                "INTRODUCTION\n\n{}\nMETHODS\n\n{}\n",
                "Intro sentence about aims. ".repeat(10),
                "Methods sentence about protocol. ".repeat(10)
            ),
        )
        .unwrap();

        let docs_root = docs.path().to_path_buf();
        let f = fixture(&[], move |cfg| {
            cfg.research.local_document_roots = vec![docs_root];
        })
        .await;

        let mut req = request("Summarize the paper");
        req.research_mode = true;
        req.local_only = true;
        req.local_corpus_paths = vec![paper.clone()];
        let outcome = f.pipeline.run(&req).await.unwrap();

        assert_eq!(outcome.corpus_ids.len(), 1);
        assert!(outcome.context_blocks[0].contains("corpus://cache/"));
        // Bootstrap retrieval appended evidence from the corpus.
        assert!(outcome
            .context_blocks
            .iter()
            .any(|b| b.starts_with("[evidence snippets]")));
        assert!(!outcome.shortlist_ran, "local_only disables the shortlist");
    }

    #[tokio::test]
    async fn local_only_beats_explicit_shortlist_on() {
        let docs = tempfile::TempDir::new().unwrap();
        std::fs::write(docs.path().join("doc.txt"), "Some local text. ".repeat(30)).unwrap();
        let docs_root = docs.path().to_path_buf();
        let doc_path = docs.path().join("doc.txt");

        let f = fixture(&[], move |cfg| {
            cfg.research.local_document_roots = vec![docs_root];
        })
        .await;

        let mut req = request("analyze the document");
        req.research_mode = true;
        req.local_only = true;
        req.shortlist_override = ShortlistOverride::On;
        req.local_corpus_paths = vec![doc_path];
        let outcome = f.pipeline.run(&req).await.unwrap();
        assert!(!outcome.shortlist_ran);
    }

    #[tokio::test]
    async fn paths_outside_roots_are_rejected() {
        let outside = tempfile::TempDir::new().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, "secret").unwrap();

        let f = fixture(&[], |cfg| {
            cfg.research.local_document_roots = vec![PathBuf::from("/nonexistent-root")];
        })
        .await;

        let mut req = request("read the file");
        req.local_corpus_paths = vec![secret];
        let err = f.pipeline.run(&req).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Guardrail { .. }));
    }
}
