//! Tool registry and the built-in retrieval/memory tools.
//!
//! The registry maps tool names to `(schema, executor, guideline)`.
//! [`ToolRegistry::schemas`] emits API-safe function schemas for the
//! model; enabled-tool guidelines concatenate into the system prompt;
//! [`ToolRegistry::dispatch`] validates arguments, executes, and returns
//! a structured `{ok, value|error, elapsed_ms}` result the model can
//! read. Executor errors never propagate as exceptions.
//!
//! # Guardrails
//!
//! URL tools reject local filesystem targets outright. The local corpus
//! is reachable only through `corpus://cache/<id>` handles, and
//! `list_sections`/`summarize_section` operate on the local corpus only.
//! `summarize_section` refuses non-canonical and tiny sections.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::cache::Cache;
use crate::chunker::{summarize_extractive, ChunkParams};
use crate::error::{Error, Result};
use crate::fetch::{HttpFetcher, SearchProvider};
use crate::index::HybridIndex;
use crate::ingest;
use crate::llm::{ToolCall, ToolSchema};
use crate::memory::MemoryStore;
use crate::models::Section;
use crate::sections;
use crate::urlnorm;

/// Cap on content returned per URL from a single tool call.
const MAX_TOOL_CONTENT_CHARS: usize = 24_000;
/// Per-URL summary budget in tokens.
const LINK_SUMMARY_TOKENS: usize = 120;
/// Sections below this byte length refuse summarization.
const SUMMARY_MIN_SECTION_BYTES: usize = sections::TINY_SECTION_BYTES;

/// Everything an executor may touch. Built fresh per turn so the active
/// session scopes memory tools.
pub struct ToolContext {
    pub cache: Arc<Cache>,
    pub index: Arc<HybridIndex>,
    pub memory: Arc<MemoryStore>,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub search: Option<Arc<dyn SearchProvider>>,
    pub chunking: ChunkParams,
    pub session_id: Option<String>,
    pub top_k: usize,
}

/// Structured dispatch outcome fed back to the model.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ToolOutcome {
    pub fn render(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"ok\":false}".to_string())
    }
}

/// A built-in or custom tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    /// Usage guidance appended to the system prompt when the tool is
    /// enabled.
    fn guideline(&self) -> Option<&str> {
        None
    }
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    disabled: HashSet<String>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            disabled: HashSet::new(),
        }
    }

    /// Registry preloaded with the twelve built-in tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WebSearchTool));
        registry.register(Arc::new(GetUrlContentTool));
        registry.register(Arc::new(GetUrlDetailsTool));
        registry.register(Arc::new(ExtractLinksTool));
        registry.register(Arc::new(GetLinkSummariesTool));
        registry.register(Arc::new(GetRelevantContentTool));
        registry.register(Arc::new(GetFullContentTool));
        registry.register(Arc::new(ListSectionsTool));
        registry.register(Arc::new(SummarizeSectionTool));
        registry.register(Arc::new(SaveFindingTool));
        registry.register(Arc::new(QueryResearchMemoryTool));
        registry.register(Arc::new(SaveMemoryTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    /// Disable tools for the current turn (user request or preload
    /// completion gate).
    pub fn disable<I: IntoIterator<Item = String>>(&mut self, names: I) {
        self.disabled.extend(names);
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled.contains(name) && self.tools.iter().any(|t| t.name() == name)
    }

    pub fn enabled_names(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|t| !self.disabled.contains(t.name()))
            .map(|t| t.name().to_string())
            .collect()
    }

    /// API-safe schemas for every enabled tool.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .filter(|t| !self.disabled.contains(t.name()))
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Concatenated guidelines of the enabled tools for the system
    /// prompt.
    pub fn guidelines(&self) -> String {
        self.tools
            .iter()
            .filter(|t| !self.disabled.contains(t.name()))
            .filter_map(|t| t.guideline())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Validate and execute one call, timing it and converting every
    /// failure into a structured result.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutcome {
        let start = Instant::now();

        let Some(tool) = self
            .tools
            .iter()
            .find(|t| t.name() == call.name && !self.disabled.contains(t.name()))
        else {
            return ToolOutcome {
                ok: false,
                value: None,
                error: Some(format!("unknown or disabled tool: {}", call.name)),
                elapsed_ms: start.elapsed().as_millis() as u64,
            };
        };

        if let Err(e) = validate_args(&tool.parameters_schema(), &call.arguments) {
            return ToolOutcome {
                ok: false,
                value: None,
                error: Some(e.to_string()),
                elapsed_ms: start.elapsed().as_millis() as u64,
            };
        }

        let result = tool.execute(call.arguments.clone(), ctx).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!(tool = call.name.as_str(), elapsed_ms, ok = result.is_ok(), "tool dispatched");

        match result {
            Ok(value) => ToolOutcome {
                ok: true,
                value: Some(value),
                error: None,
                elapsed_ms,
            },
            Err(e) => ToolOutcome {
                ok: false,
                value: None,
                error: Some(e.to_string()),
                elapsed_ms,
            },
        }
    }
}

/// Check required fields and primitive types against a JSON schema.
fn validate_args(schema: &Value, args: &Value) -> Result<()> {
    let Some(obj) = args.as_object() else {
        return Err(Error::InvalidArgument(
            "tool arguments must be an object".to_string(),
        ));
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !obj.contains_key(field) {
                return Err(Error::InvalidArgument(format!(
                    "missing required argument: {}",
                    field
                )));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in obj {
            let Some(prop) = props.get(key) else {
                return Err(Error::InvalidArgument(format!(
                    "unexpected argument: {}",
                    key
                )));
            };
            let Some(expected) = prop.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "array" => value.is_array(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(Error::InvalidArgument(format!(
                    "argument {} must be a {}",
                    key, expected
                )));
            }
        }
    }

    Ok(())
}

// ============ Shared argument helpers ============

fn string_arg(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::InvalidArgument(format!("missing required argument: {}", key)))
}

fn url_list_arg(params: &Value, key: &str) -> Result<Vec<String>> {
    let urls: Vec<String> = params
        .get(key)
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .ok_or_else(|| Error::InvalidArgument(format!("missing required argument: {}", key)))?;
    if urls.is_empty() {
        return Err(Error::InvalidArgument(format!("{} must not be empty", key)));
    }
    Ok(urls)
}

/// Reject any URL argument that points at the local filesystem.
fn reject_local_targets(urls: &[String]) -> Result<()> {
    for url in urls {
        if urlnorm::is_corpus_handle(url) {
            continue;
        }
        if urlnorm::is_local_target(url) {
            return Err(Error::guardrail(url, "local filesystem target rejected"));
        }
    }
    Ok(())
}

fn truncate_content(text: &str) -> (String, bool) {
    if text.chars().count() <= MAX_TOOL_CONTENT_CHARS {
        (text.to_string(), false)
    } else {
        (text.chars().take(MAX_TOOL_CONTENT_CHARS).collect(), true)
    }
}

/// Resolve a corpus handle argument to its cached row and sections,
/// enforcing local-corpus-only access.
async fn local_corpus_sections(
    ctx: &ToolContext,
    handle: &str,
) -> Result<(String, Vec<Section>)> {
    let Some((cache_id, _)) = urlnorm::parse_handle(handle) else {
        return Err(Error::guardrail(
            handle,
            "expected a corpus://cache/<id> handle",
        ));
    };
    let entry = ctx
        .cache
        .get_by_id(&cache_id)
        .await?
        .ok_or_else(|| Error::not_found("corpus entry", cache_id.clone()))?;
    if !urlnorm::is_corpus_handle(&entry.canonical_url) {
        return Err(Error::guardrail(handle, "sections are local-corpus only"));
    }
    let section_list = sections::load_sections(ctx.index.pool(), &cache_id).await?;
    Ok((cache_id, section_list))
}

// ============ Built-in tools ============

struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }
    fn description(&self) -> &str {
        "Search the web and return result URLs with titles and snippets"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = string_arg(&params, "query")?;
        let provider = ctx.search.as_ref().ok_or_else(|| {
            Error::InvalidArgument("no web search provider configured".to_string())
        })?;
        let hits = provider.search(&query, ctx.top_k).await?;
        Ok(json!(hits
            .iter()
            .map(|h| json!({ "url": h.url, "title": h.title, "snippet": h.snippet }))
            .collect::<Vec<_>>()))
    }
}

struct GetUrlContentTool;

#[async_trait]
impl Tool for GetUrlContentTool {
    fn name(&self) -> &str {
        "get_url_content"
    }
    fn description(&self) -> &str {
        "Fetch one or more URLs and return their readable text"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "urls": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["urls"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let urls = url_list_arg(&params, "urls")?;
        reject_local_targets(&urls)?;

        let mut out = Vec::with_capacity(urls.len());
        for url in &urls {
            let entry = ingest::materialize_url(
                &ctx.cache,
                &ctx.index,
                ctx.fetcher.as_ref(),
                &ctx.chunking,
                url,
            )
            .await?;
            let (content, truncated) = truncate_content(&entry.content_text);
            out.push(json!({
                "url": entry.canonical_url,
                "content": content,
                "truncated": truncated,
            }));
        }
        Ok(json!(out))
    }
}

struct GetUrlDetailsTool;

#[async_trait]
impl Tool for GetUrlDetailsTool {
    fn name(&self) -> &str {
        "get_url_details"
    }
    fn description(&self) -> &str {
        "Fetch URLs and return readable text plus discovered links"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "urls": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["urls"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let urls = url_list_arg(&params, "urls")?;
        reject_local_targets(&urls)?;

        let mut out = Vec::with_capacity(urls.len());
        for url in &urls {
            let entry = ingest::materialize_url(
                &ctx.cache,
                &ctx.index,
                ctx.fetcher.as_ref(),
                &ctx.chunking,
                url,
            )
            .await?;
            let (content, truncated) = truncate_content(&entry.content_text);
            out.push(json!({
                "url": entry.canonical_url,
                "content": content,
                "truncated": truncated,
                "links": entry.links,
            }));
        }
        Ok(json!(out))
    }
}

struct ExtractLinksTool;

#[async_trait]
impl Tool for ExtractLinksTool {
    fn name(&self) -> &str {
        "extract_links"
    }
    fn description(&self) -> &str {
        "Return the links discovered on cached pages, optionally ranked against a query"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "urls": { "type": "array", "items": { "type": "string" } },
                "query": { "type": "string" }
            },
            "required": ["urls"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let urls = url_list_arg(&params, "urls")?;
        reject_local_targets(&urls)?;
        let query = params.get("query").and_then(|q| q.as_str());

        let query_vec = match query {
            Some(q) => Some(ctx.index.embedder().embed_one(q).await.map_err(Error::Other)?),
            None => None,
        };

        let mut out = Vec::with_capacity(urls.len());
        for url in &urls {
            let entry = ingest::fetch_into_cache(&ctx.cache, ctx.fetcher.as_ref(), url).await?;
            ctx.index.store_links(&entry.cache_id, &entry.links).await?;

            let mut links: Vec<Value> = Vec::with_capacity(entry.links.len());
            if let Some(qv) = &query_vec {
                let anchors: Vec<String> =
                    entry.links.iter().map(|l| l.anchor_text.clone()).collect();
                let vectors = ctx
                    .index
                    .embedder()
                    .embed(&anchors)
                    .await
                    .map_err(Error::Other)?;
                let mut scored: Vec<(f32, &crate::models::Link)> = entry
                    .links
                    .iter()
                    .zip(vectors.iter())
                    .map(|(link, v)| (crate::embedding::cosine_similarity(qv, v), link))
                    .collect();
                scored.sort_by(|a, b| {
                    b.0.partial_cmp(&a.0)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.1.url.cmp(&b.1.url))
                });
                for (score, link) in scored {
                    links.push(json!({
                        "url": link.url,
                        "anchor_text": link.anchor_text,
                        "score": score,
                    }));
                }
            } else {
                for link in &entry.links {
                    links.push(json!({ "url": link.url, "anchor_text": link.anchor_text }));
                }
            }

            out.push(json!({ "url": entry.canonical_url, "links": links }));
        }
        Ok(json!(out))
    }
}

struct GetLinkSummariesTool;

#[async_trait]
impl Tool for GetLinkSummariesTool {
    fn name(&self) -> &str {
        "get_link_summaries"
    }
    fn description(&self) -> &str {
        "Return a short summary for each URL, generating on demand"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "urls": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["urls"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let urls = url_list_arg(&params, "urls")?;
        reject_local_targets(&urls)?;

        let mut out = Vec::with_capacity(urls.len());
        for url in &urls {
            match ingest::fetch_into_cache(&ctx.cache, ctx.fetcher.as_ref(), url).await {
                Ok(entry) => {
                    let summary =
                        summarize_extractive(&entry.content_text, LINK_SUMMARY_TOKENS);
                    out.push(json!({ "url": entry.canonical_url, "summary": summary }));
                }
                Err(e) => {
                    out.push(json!({ "url": url, "error": e.to_string() }));
                }
            }
        }
        Ok(json!(out))
    }
}

struct GetRelevantContentTool;

#[async_trait]
impl Tool for GetRelevantContentTool {
    fn name(&self) -> &str {
        "get_relevant_content"
    }
    fn description(&self) -> &str {
        "Hybrid semantic + keyword retrieval over cached sources, optionally scoped to a section"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "urls": { "type": "array", "items": { "type": "string" } },
                "section_ref": { "type": "string" },
                "section_id": { "type": "string" },
                "query": { "type": "string" },
                "k": { "type": "integer" }
            },
            "required": ["query"]
        })
    }
    fn guideline(&self) -> Option<&str> {
        Some("Use get_relevant_content for targeted evidence instead of refetching whole pages.")
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = string_arg(&params, "query")?;
        let k = params
            .get("k")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(ctx.top_k);

        // `section_ref` wins over `section_id`; legacy path refs accepted.
        let mut cache_ids: Option<Vec<String>> = None;
        let mut section_filter: Option<String> = None;

        if let Some(section_ref) = params.get("section_ref").and_then(|v| v.as_str()) {
            let (cache_id, section) = urlnorm::parse_handle(section_ref)
                .ok_or_else(|| Error::guardrail(section_ref, "malformed section ref"))?;
            cache_ids = Some(vec![cache_id]);
            section_filter = section;
        } else if let Some(section_id) = params.get("section_id").and_then(|v| v.as_str()) {
            section_filter = Some(section_id.to_string());
        }

        if cache_ids.is_none() {
            if let Some(urls) = params.get("urls").and_then(|v| v.as_array()) {
                let urls: Vec<String> = urls
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect();
                reject_local_targets(&urls)?;
                let mut ids = Vec::with_capacity(urls.len());
                for url in &urls {
                    if urlnorm::is_corpus_handle(url) {
                        ids.push(Cache::resolve_cache_id(url));
                        continue;
                    }
                    let entry = ingest::materialize_url(
                        &ctx.cache,
                        &ctx.index,
                        ctx.fetcher.as_ref(),
                        &ctx.chunking,
                        url,
                    )
                    .await?;
                    ids.push(entry.cache_id);
                }
                cache_ids = Some(ids);
            }
        }

        let outcome = ctx
            .index
            .search_chunks(
                &query,
                cache_ids.as_deref(),
                section_filter.as_deref(),
                k,
                None,
            )
            .await?;

        Ok(json!({
            "degraded": outcome.degraded,
            "chunks": outcome.results,
        }))
    }
}

struct GetFullContentTool;

#[async_trait]
impl Tool for GetFullContentTool {
    fn name(&self) -> &str {
        "get_full_content"
    }
    fn description(&self) -> &str {
        "Return the full cached text of URLs or corpus handles"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "urls": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["urls"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let urls = url_list_arg(&params, "urls")?;
        reject_local_targets(&urls)?;

        let mut out = Vec::with_capacity(urls.len());
        for url in &urls {
            let entry = if urlnorm::is_corpus_handle(url) {
                ctx.cache
                    .get(url)
                    .await?
                    .ok_or_else(|| Error::not_found("corpus entry", url.clone()))?
            } else {
                ingest::fetch_into_cache(&ctx.cache, ctx.fetcher.as_ref(), url).await?
            };
            let (content, truncated) = truncate_content(&entry.content_text);
            out.push(json!({
                "url": entry.canonical_url,
                "content": content,
                "truncated": truncated,
            }));
        }
        Ok(json!(out))
    }
}

struct ListSectionsTool;

#[async_trait]
impl Tool for ListSectionsTool {
    fn name(&self) -> &str {
        "list_sections"
    }
    fn description(&self) -> &str {
        "List the canonical sections of a local corpus document"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "handle": { "type": "string", "description": "corpus://cache/<id> handle" }
            },
            "required": ["handle"]
        })
    }
    fn guideline(&self) -> Option<&str> {
        Some(
            "For local documents, prefer list_sections then summarize_section over fetching \
             full content when a section is identifiable.",
        )
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let handle = string_arg(&params, "handle")?;
        let (cache_id, section_list) = local_corpus_sections(ctx, &handle).await?;

        let rows: Vec<Value> = section_list
            .iter()
            .filter(|s| s.canonical)
            .map(|s| {
                json!({
                    "section_ref": urlnorm::section_ref(&cache_id, &s.section_id),
                    "section_id": s.section_id,
                    "title": s.title,
                })
            })
            .collect();
        Ok(json!(rows))
    }
}

struct SummarizeSectionTool;

#[async_trait]
impl Tool for SummarizeSectionTool {
    fn name(&self) -> &str {
        "summarize_section"
    }
    fn description(&self) -> &str {
        "Summarize one canonical section of a local corpus document"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "section_ref": { "type": "string" },
                "section_id": { "type": "string" }
            },
            "required": []
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        // `section_ref` wins over `section_id`.
        let (cache_id, section_id) =
            if let Some(section_ref) = params.get("section_ref").and_then(|v| v.as_str()) {
                let (cache_id, section) = urlnorm::parse_handle(section_ref)
                    .ok_or_else(|| Error::guardrail(section_ref, "malformed section ref"))?;
                let section = section.ok_or_else(|| {
                    Error::InvalidArgument("section_ref carries no section".to_string())
                })?;
                (cache_id, section)
            } else if let Some(section_id) = params.get("section_id").and_then(|v| v.as_str()) {
                // A bare id must be unambiguous across the local corpus.
                let owners: Vec<String> = sqlx::query_scalar(
                    "SELECT cache_id FROM sections WHERE section_id = ?",
                )
                .bind(section_id)
                .fetch_all(ctx.index.pool())
                .await
                .map_err(|e| Error::Db(e))?;
                match owners.len() {
                    0 => return Err(Error::not_found("section", section_id.to_string())),
                    1 => (owners[0].clone(), section_id.to_string()),
                    _ => {
                        return Err(Error::InvalidArgument(format!(
                            "section_id {} is ambiguous; pass a section_ref",
                            section_id
                        )))
                    }
                }
            } else {
                return Err(Error::InvalidArgument(
                    "section_ref or section_id required".to_string(),
                ));
            };

        let handle = urlnorm::corpus_handle(&cache_id);
        let (_, section_list) = local_corpus_sections(ctx, &handle).await?;
        let section = sections::resolve(&section_list, &section_id)
            .ok_or_else(|| Error::not_found("section", section_id.clone()))?;

        if !section.canonical {
            return Err(Error::guardrail(
                section.section_id.clone(),
                "section is non-canonical and cannot be summarized",
            ));
        }
        let entry = ctx
            .cache
            .get_by_id(&cache_id)
            .await?
            .ok_or_else(|| Error::not_found("corpus entry", cache_id.clone()))?;
        let end = section.end_byte.min(entry.content_text.len());
        let body = &entry.content_text[section.start_byte..end];
        if body.len() < SUMMARY_MIN_SECTION_BYTES {
            return Err(Error::guardrail(
                section.section_id.clone(),
                "section is too small to summarize",
            ));
        }

        Ok(json!({
            "section_ref": urlnorm::section_ref(&cache_id, &section.section_id),
            "title": section.title,
            "summary": format!(
                "{}: {}",
                section.title,
                summarize_extractive(body, 200)
            ),
        }))
    }
}

struct SaveFindingTool;

#[async_trait]
impl Tool for SaveFindingTool {
    fn name(&self) -> &str {
        "save_finding"
    }
    fn description(&self) -> &str {
        "Persist a research finding to session memory"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" }
            },
            "required": ["text"]
        })
    }
    fn guideline(&self) -> Option<&str> {
        Some("Save important findings with save_finding so later turns can recall them.")
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let text = string_arg(&params, "text")?;
        let finding = ctx
            .memory
            .save_finding(ctx.session_id.as_deref(), &text)
            .await
            .map_err(Error::Other)?;
        Ok(json!({ "finding_id": finding.finding_id }))
    }
}

struct QueryResearchMemoryTool;

#[async_trait]
impl Tool for QueryResearchMemoryTool {
    fn name(&self) -> &str {
        "query_research_memory"
    }
    fn description(&self) -> &str {
        "Semantic search over saved research findings"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = string_arg(&params, "query")?;
        let recalled = ctx
            .memory
            .query_findings(&query, ctx.session_id.as_deref())
            .await
            .map_err(Error::Other)?;
        Ok(json!(recalled
            .iter()
            .map(|r| json!({ "text": r.item.text, "score": r.score }))
            .collect::<Vec<_>>()))
    }
}

struct SaveMemoryTool;

#[async_trait]
impl Tool for SaveMemoryTool {
    fn name(&self) -> &str {
        "save_memory"
    }
    fn description(&self) -> &str {
        "Save a durable user memory (deduplicated)"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "tags": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let text = string_arg(&params, "text")?;
        let tags: Vec<String> = params
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        let (memory, updated) = ctx
            .memory
            .save_memory(&text, &tags)
            .await
            .map_err(Error::Other)?;
        Ok(json!({ "memory_id": memory.memory_id, "updated": updated }))
    }
}
