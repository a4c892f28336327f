//! Programmatic entry point: one turn in, one result out.
//!
//! [`Client`] owns the wired core (cache, index, memory, sessions,
//! preload, engine) and consumes the external collaborators through
//! trait objects, so tests and embedders substitute fakes. `run_turn`
//! is the whole surface: deterministic preload, prompt assembly, the
//! tool-calling loop, and persistence.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{Cache, Clock};
use crate::chunker::{summarize_extractive, ChunkParams};
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::engine::ConversationEngine;
use crate::error::{Error, Result};
use crate::fetch::{HttpFetcher, SearchProvider};
use crate::index::HybridIndex;
use crate::llm::{ChatMessage, LlmClient, UsageCounters, UsageRole, UsageTracker};
use crate::memory::MemoryStore;
use crate::migrate;
use crate::models::PreloadProvenance;
use crate::preload::{PreloadPipeline, PreloadRequest, ShortlistOverride};
use crate::session::{HistoryStore, SessionStore};
use crate::shortlist::Shortlist;
use crate::tools::{ToolContext, ToolRegistry};
use crate::vector::VectorBackend;

const STANDARD_SYSTEM_PROMPT: &str = "You are a precise research assistant. Ground every claim in \
     the provided context or in tool results. Cite source URLs when you use them.";

const RESEARCH_SYSTEM_PROMPT: &str = "You are a research assistant working over a curated corpus. \
     Prefer retrieval over refetching: for local documents use list_sections and \
     summarize_section before requesting full content. Save important findings as you go.";

const DIRECT_ANSWER_PROMPT: &str = "All requested sources are already included above in full. \
     Answer directly from them in a single reply. Do not search the web or fetch any URL.";

/// Progress events surfaced to the embedding UI.
pub type EventSink = Arc<dyn Fn(&str) + Send + Sync>;

/// External collaborators injected into the core.
pub struct Collaborators {
    pub llm: Arc<dyn LlmClient>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub search: Option<Arc<dyn SearchProvider>>,
    pub vector_backend: Option<Arc<dyn VectorBackend>>,
    pub clock: Arc<dyn Clock>,
}

/// One turn's input.
#[derive(Clone, Default)]
pub struct TurnRequest {
    pub query: String,
    pub model: Option<String>,
    /// Session selector: id, name, or unique id prefix.
    pub session: Option<String>,
    pub research: bool,
    pub local_corpus_paths: Vec<PathBuf>,
    pub disabled_tools: Vec<String>,
    pub shortlist: ShortlistOverride,
    pub system_prompt_override: Option<String>,
    pub lean: bool,
    pub verbose: u8,
    pub params: Option<Value>,
    pub on_event: Option<EventSink>,
}

/// One turn's output.
#[derive(Debug)]
pub struct TurnResult {
    pub answer: String,
    pub session_id: Option<String>,
    pub usage: Vec<(String, UsageRole, UsageCounters)>,
    pub preload_provenance: PreloadProvenance,
}

pub struct Client {
    config: Config,
    llm: Arc<dyn LlmClient>,
    fetcher: Arc<dyn HttpFetcher>,
    search: Option<Arc<dyn SearchProvider>>,
    cache: Arc<Cache>,
    index: Arc<HybridIndex>,
    memory: Arc<MemoryStore>,
    sessions: Arc<SessionStore>,
    history: Arc<HistoryStore>,
    preload: PreloadPipeline,
    usage: Arc<UsageTracker>,
}

impl Client {
    /// Wire the core against an initialized database. Runs migrations
    /// and spawns the one-shot cache expiry sweep.
    pub async fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        let pool = crate::db::connect(&config).await.map_err(Error::Other)?;
        migrate::apply(&pool).await.map_err(Error::Other)?;

        let Collaborators {
            llm,
            embedder,
            fetcher,
            search,
            vector_backend,
            clock,
        } = collaborators;

        let index = Arc::new(HybridIndex::new(
            pool.clone(),
            vector_backend.clone(),
            Arc::clone(&embedder),
            config.retrieval.clone(),
        ));
        let cache = Arc::new(Cache::new(
            pool.clone(),
            Arc::clone(&index),
            Arc::clone(&clock),
            config.cache.ttl_hours,
        ));
        let memory = Arc::new(MemoryStore::new(
            pool.clone(),
            vector_backend,
            Arc::clone(&embedder),
            config.memory.clone(),
            Arc::clone(&clock),
        ));
        let sessions = Arc::new(SessionStore::new(
            pool.clone(),
            Arc::clone(&memory),
            Arc::clone(&clock),
            config.data.locks_dir(),
        ));
        let history = Arc::new(HistoryStore::new(pool, Arc::clone(&clock)));
        let shortlist = Arc::new(Shortlist::new(
            Arc::clone(&cache),
            Arc::clone(&embedder),
            Arc::clone(&fetcher),
            search.clone(),
            config.shortlist.clone(),
            config.query_expansion.clone(),
        ));
        let preload = PreloadPipeline::new(
            Arc::clone(&cache),
            Arc::clone(&index),
            Arc::clone(&fetcher),
            shortlist,
            Arc::clone(&sessions),
            config.clone(),
        );

        // One-shot background expiry sweep; failures only log.
        {
            let cache = Arc::clone(&cache);
            let now = clock.now_unix();
            tokio::spawn(async move {
                match cache.bulk_expire(now).await {
                    Ok(removed) if removed > 0 => debug!(removed, "expired cache rows swept"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "startup cache sweep failed"),
                }
            });
        }

        Ok(Self {
            config,
            llm,
            fetcher,
            search,
            cache,
            index,
            memory,
            sessions,
            history,
            preload,
            usage: Arc::new(UsageTracker::new()),
        })
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn index(&self) -> &Arc<HybridIndex> {
        &self.index
    }

    fn emit(request: &TurnRequest, event: &str) {
        if let Some(sink) = &request.on_event {
            sink(event);
        }
    }

    fn chunking(&self) -> ChunkParams {
        ChunkParams {
            chunk_size: self.config.chunking.chunk_size,
            overlap: self.config.chunking.chunk_overlap,
            max_seq_length: self.config.embedding.max_seq_length,
        }
    }

    /// Execute one full turn.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnResult> {
        if request.query.trim().is_empty() {
            return Err(Error::InvalidArgument("query must not be empty".into()));
        }

        // Session resolution. Research mode always has a session so
        // memory scoping is effective.
        let session = match &request.session {
            Some(selector) => Some(self.sessions.resolve(selector).await?),
            None if request.research => Some(
                self.sessions
                    .create(&request.query, true, Some("web"), &[])
                    .await?,
            ),
            None => None,
        };
        if let Some(s) = &session {
            self.sessions.touch(&s.session_id).await?;
            self.sessions.acquire_lock(&s.session_id);
        }
        let session_id = session.as_ref().map(|s| s.session_id.clone());
        let local_only = session
            .as_ref()
            .and_then(|s| s.research_source_mode.as_deref())
            .map(|m| m == "local_only")
            .unwrap_or(false)
            || (!request.local_corpus_paths.is_empty() && !has_web_intent(&request.query));

        // Preload.
        Self::emit(&request, "preload:start");
        let mut corpus_paths = request.local_corpus_paths.clone();
        if let Some(s) = &session {
            corpus_paths.extend(s.local_corpus_paths.iter().map(PathBuf::from));
        }
        let preload_outcome = self
            .preload
            .run(&PreloadRequest {
                prompt: &request.query,
                research_mode: request.research,
                lean: request.lean,
                shortlist_override: request.shortlist,
                local_corpus_paths: corpus_paths,
                local_only,
                session_id: session_id.as_deref(),
                session_shortlist_default: None,
            })
            .await?;
        Self::emit(&request, "preload:done");

        // Tool registry for the turn.
        let mut registry = ToolRegistry::with_builtins();
        if request.lean {
            let all: Vec<String> = registry.enabled_names();
            registry.disable(all);
        } else {
            registry.disable(request.disabled_tools.iter().cloned());
            registry.disable(preload_outcome.disabled_tools.iter().cloned());
        }

        // System prompt assembly.
        let mut system_prompt = request
            .system_prompt_override
            .clone()
            .unwrap_or_else(|| {
                if request.research {
                    RESEARCH_SYSTEM_PROMPT.to_string()
                } else {
                    STANDARD_SYSTEM_PROMPT.to_string()
                }
            });
        if preload_outcome.seeds_complete {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(DIRECT_ANSWER_PROMPT);
        }
        let guidelines = registry.guidelines();
        if !guidelines.is_empty() && !request.lean {
            system_prompt.push_str("\n\nTool guidance:\n");
            system_prompt.push_str(&guidelines);
        }
        if !request.lean {
            match self.memory.recall_memories(&request.query).await {
                Ok(recalled) if !recalled.is_empty() => {
                    system_prompt.push_str("\n\nKnown about the user:\n");
                    for r in recalled {
                        system_prompt.push_str(&format!("- {}\n", r.item.text));
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "memory recall failed"),
            }
        }

        // Message assembly: system, compacted session summary, prior
        // thread, preloaded context, then the query.
        let mut messages = vec![ChatMessage::system(system_prompt)];
        if let Some(s) = &session {
            if let Some(summary) = &s.compacted_summary {
                messages.push(ChatMessage::system(format!(
                    "Summary of earlier conversation:\n{}",
                    summary
                )));
            }
            for stored in self.history.for_session(&s.session_id).await? {
                let message = match stored.role.as_str() {
                    "user" => ChatMessage::user(stored.content),
                    "assistant" => ChatMessage::assistant(stored.content),
                    _ => continue,
                };
                messages.push(message);
            }
        }

        let mut user_content = String::new();
        if !preload_outcome.context_blocks.is_empty() {
            user_content.push_str(&preload_outcome.context_blocks.join("\n\n"));
            user_content.push_str("\n\n");
        }
        user_content.push_str(&request.query);
        messages.push(ChatMessage::user(user_content));

        // Engine run.
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| "worker".to_string());
        let engine = ConversationEngine::new(
            Arc::clone(&self.llm),
            Arc::clone(&self.usage),
            self.config.engine.clone(),
            model,
        );
        let ctx = ToolContext {
            cache: Arc::clone(&self.cache),
            index: Arc::clone(&self.index),
            memory: Arc::clone(&self.memory),
            fetcher: Arc::clone(&self.fetcher),
            search: self.search.clone(),
            chunking: self.chunking(),
            session_id: session_id.clone(),
            top_k: self.config.retrieval.top_k,
        };

        Self::emit(&request, "engine:start");
        let answer = engine.run(messages, &registry, &ctx).await?;
        Self::emit(&request, "engine:done");

        // Persistence. A cancelled or failed turn above leaves no
        // message rows behind; cache writes are idempotent.
        match &session_id {
            Some(sid) => {
                self.history
                    .append(Some(sid), "user", &request.query, None)
                    .await?;
                let summary = summarize_extractive(&answer, 60);
                self.history
                    .append(Some(sid), "assistant", &answer, Some(&summary))
                    .await?;
                self.sessions
                    .set_compacted_summary(sid, &summarize_extractive(&answer, 120))
                    .await?;
            }
            None => {
                self.history.record_standalone(&request.query, &answer).await?;
            }
        }

        Ok(TurnResult {
            answer,
            session_id,
            usage: self.usage.snapshot(),
            preload_provenance: preload_outcome.provenance,
        })
    }
}

/// A corpus-only prompt with no URLs keeps research local.
fn has_web_intent(query: &str) -> bool {
    !crate::urlnorm::extract_seed_urls(query).is_empty()
}
