//! Multi-turn tool-calling conversation loop.
//!
//! One turn is a sequential state machine: compact if needed, call the
//! model, parse, dispatch tool calls, repeat. The loop never forks
//! concurrent LLM calls. On exhausting `max_turns` a tool-free graceful
//! exit produces the user-visible answer; two consecutive empty model
//! replies produce a graceful apology, never an exception.
//!
//! # Compaction
//!
//! Proactive, before every model call once the estimate passes the
//! configured fraction of the context limit:
//! 1. Smart pass — large tool outputs are replaced by their summaries.
//! 2. Destructive pass — oldest non-system messages drop, preserving
//!    system messages and the last user message.
//! 3. Still over — [`Error::ContextOverflow`] with the minimal set.
//!
//! Reactive: an HTTP 400 from the model surfaces `ContextOverflow`
//! carrying the compacted messages so the caller can retry elsewhere.
//! The engine never prompts the user.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::chunker::summarize_extractive;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::llm::{
    estimate_tokens, parse_tool_calls, ChatMessage, LlmClient, LlmReply, LlmRequest, Role,
    UsageRole, UsageTracker,
};
use crate::tools::{ToolContext, ToolRegistry};

/// Tool outputs above this token count are summarized by the smart
/// compaction pass.
const SMART_COMPACT_TOOL_TOKENS: usize = 200;
/// Token budget for a compacted tool output.
const COMPACTED_SUMMARY_TOKENS: usize = 100;

const CORRECTIVE_PROMPT: &str = "Your last reply was empty. Answer the user's question directly, \
     or call one of the available tools.";

const GRACEFUL_EXIT_PROMPT: &str = "You have used all available research steps. Using only the \
     information gathered above, give the user your best complete answer now. Do not call any \
     tools.";

const APOLOGY: &str = "I'm sorry — I wasn't able to produce an answer for this request. \
     Please try rephrasing or asking again.";

pub struct ConversationEngine {
    llm: Arc<dyn LlmClient>,
    usage: Arc<UsageTracker>,
    config: EngineConfig,
    model: String,
}

impl ConversationEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        usage: Arc<UsageTracker>,
        config: EngineConfig,
        model: String,
    ) -> Self {
        Self {
            llm,
            usage,
            config,
            model,
        }
    }

    /// Run the loop to a final answer.
    pub async fn run(
        &self,
        mut messages: Vec<ChatMessage>,
        registry: &ToolRegistry,
        ctx: &ToolContext,
    ) -> Result<String> {
        let mut consecutive_empty = 0u32;

        for turn in 0..self.config.max_turns {
            self.compact(&mut messages).await?;

            let reply = self.call_model(&messages, registry, false).await?;

            match reply {
                LlmReply::Content(text) => {
                    // Small models sometimes emit tool calls as text.
                    let inline_calls = parse_tool_calls(&text);
                    if !inline_calls.is_empty() {
                        consecutive_empty = 0;
                        messages.push(ChatMessage::assistant(text));
                        self.dispatch_calls(&inline_calls, registry, ctx, &mut messages)
                            .await;
                        continue;
                    }
                    if text.trim().is_empty() {
                        if self.handle_empty(&mut consecutive_empty, &mut messages) {
                            return Ok(APOLOGY.to_string());
                        }
                        continue;
                    }
                    debug!(turn, "final answer produced");
                    return Ok(text);
                }
                LlmReply::ToolCalls(calls) => {
                    consecutive_empty = 0;
                    messages.push(ChatMessage::assistant(render_call_request(&calls)));
                    self.dispatch_calls(&calls, registry, ctx, &mut messages).await;
                }
                LlmReply::Empty => {
                    if self.handle_empty(&mut consecutive_empty, &mut messages) {
                        return Ok(APOLOGY.to_string());
                    }
                }
            }
        }

        // Max turns exhausted: one tool-free call for the closing answer.
        debug!("max turns reached, running graceful exit");
        messages.push(ChatMessage::system(GRACEFUL_EXIT_PROMPT));
        self.compact(&mut messages).await?;
        match self.call_model(&messages, registry, true).await? {
            LlmReply::Content(text) if !text.trim().is_empty() => Ok(text),
            _ => Ok(APOLOGY.to_string()),
        }
    }

    /// True when the apology should be returned.
    fn handle_empty(&self, consecutive_empty: &mut u32, messages: &mut Vec<ChatMessage>) -> bool {
        *consecutive_empty += 1;
        if *consecutive_empty >= 2 {
            warn!("two consecutive empty model replies");
            return true;
        }
        messages.push(ChatMessage::system(CORRECTIVE_PROMPT));
        false
    }

    async fn dispatch_calls(
        &self,
        calls: &[crate::llm::ToolCall],
        registry: &ToolRegistry,
        ctx: &ToolContext,
        messages: &mut Vec<ChatMessage>,
    ) {
        for call in calls {
            let outcome = registry.dispatch(call, ctx).await;
            let rendered = outcome.render();
            let mut message = ChatMessage::tool_result(call.id.clone(), rendered);
            // Cache a short form now so compaction has it later.
            message.summary = Some(summarize_extractive(
                &message.content,
                COMPACTED_SUMMARY_TOKENS,
            ));
            messages.push(message);
        }
    }

    async fn call_model(
        &self,
        messages: &[ChatMessage],
        registry: &ToolRegistry,
        tool_free: bool,
    ) -> Result<LlmReply> {
        let request = LlmRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            tools: if tool_free {
                Vec::new()
            } else {
                registry.schemas()
            },
            params: serde_json::Value::Null,
        };

        self.usage
            .record_messages(&self.model, UsageRole::Main, messages);

        match self.llm.send(&request).await {
            Ok(reply) => {
                if let LlmReply::Content(text) = &reply {
                    self.usage.record(
                        &self.model,
                        UsageRole::Main,
                        0,
                        crate::chunker::approx_tokens(text),
                    );
                }
                Ok(reply)
            }
            // Reactive overflow: the provider rejected the context size.
            Err(Error::Transport { message, .. }) if message.contains("400") => {
                let mut compacted = messages.to_vec();
                let _ = self.compact_hard(&mut compacted);
                Err(Error::ContextOverflow(compacted))
            }
            Err(e) => Err(e),
        }
    }

    /// Proactive compaction ahead of a model call.
    async fn compact(&self, messages: &mut Vec<ChatMessage>) -> Result<()> {
        let limit = (self.config.context_limit as f64 * self.config.compaction_threshold) as usize;
        if estimate_tokens(messages) <= limit {
            return Ok(());
        }

        debug!(
            tokens = estimate_tokens(messages),
            limit, "compaction threshold tripped"
        );

        // Pass 1: summarize large tool outputs.
        let use_llm_summary = self.config.compaction_strategy == "llm_summary";
        for index in 0..messages.len() {
            if messages[index].role != Role::Tool
                || messages[index].token_count() <= SMART_COMPACT_TOOL_TOKENS
            {
                continue;
            }
            let summary = if use_llm_summary {
                self.llm_summary(&messages[index].content).await
            } else {
                None
            };
            let summary = summary
                .or_else(|| messages[index].summary.clone())
                .unwrap_or_else(|| {
                    summarize_extractive(&messages[index].content, COMPACTED_SUMMARY_TOKENS)
                });
            messages[index].content = format!("[compacted tool output] {}", summary);
        }
        if estimate_tokens(messages) <= limit {
            return Ok(());
        }

        self.compact_hard(messages)?;

        if estimate_tokens(messages) > self.config.context_limit {
            return Err(Error::ContextOverflow(messages.clone()));
        }
        Ok(())
    }

    /// Ask the summarizer model for a compact form of a tool output.
    /// The summarizer alias defaults to the main worker model when no
    /// `analysis_model` is configured. Failures fall back to the cached
    /// extractive summary.
    async fn llm_summary(&self, content: &str) -> Option<String> {
        let model = self
            .config
            .analysis_model
            .clone()
            .unwrap_or_else(|| self.model.clone());
        let request = LlmRequest {
            model: model.clone(),
            messages: vec![
                ChatMessage::system(
                    "Summarize the following tool output in at most two sentences. \
                     Keep every concrete fact a later answer could cite.",
                ),
                ChatMessage::user(content.to_string()),
            ],
            tools: Vec::new(),
            params: serde_json::Value::Null,
        };

        self.usage.record(
            &model,
            UsageRole::Summarizer,
            crate::chunker::approx_tokens(content),
            0,
        );

        match self.llm.send(&request).await {
            Ok(LlmReply::Content(text)) if !text.trim().is_empty() => {
                self.usage.record(
                    &model,
                    UsageRole::Summarizer,
                    0,
                    crate::chunker::approx_tokens(&text),
                );
                Some(text)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "summarizer call failed, using extractive fallback");
                None
            }
        }
    }

    /// Pass 2: drop oldest non-system messages, preserving system
    /// messages and the last user message.
    fn compact_hard(&self, messages: &mut Vec<ChatMessage>) -> Result<()> {
        let limit = (self.config.context_limit as f64 * self.config.compaction_threshold) as usize;

        while estimate_tokens(messages) > limit {
            let last_user_index = messages.iter().rposition(|m| m.role == Role::User);
            let drop_index = messages
                .iter()
                .enumerate()
                .position(|(i, m)| m.role != Role::System && Some(i) != last_user_index);
            match drop_index {
                Some(i) => {
                    messages.remove(i);
                }
                None => break,
            }
        }
        Ok(())
    }
}

fn render_call_request(calls: &[crate::llm::ToolCall]) -> String {
    let rendered: Vec<serde_json::Value> = calls
        .iter()
        .map(|c| serde_json::json!({ "tool": c.name, "arguments": c.arguments }))
        .collect();
    serde_json::to_string(&rendered).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::chunker::ChunkParams;
    use crate::config::{MemoryConfig, RetrievalConfig};
    use crate::fetch::{FetchedPage, HttpFetcher};
    use crate::index::HybridIndex;
    use crate::llm::ToolCall;
    use crate::memory::MemoryStore;
    use crate::testutil::{self, ManualClock};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedLlm {
        replies: Mutex<VecDeque<Result<LlmReply>>>,
        requests: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<Result<LlmReply>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn last_request(&self) -> LlmRequest {
            self.requests.lock().unwrap().last().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn send(&self, request: &LlmRequest) -> Result<LlmReply> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(LlmReply::Empty))
        }
    }

    struct NoFetcher;

    #[async_trait]
    impl HttpFetcher for NoFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage> {
            Err(Error::transport(format!("HTTP 404 from {}", url), false))
        }
    }

    async fn tool_ctx() -> ToolContext {
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
            24,
        ));
        let memory = Arc::new(MemoryStore::new(
            pool,
            None,
            embedder,
            MemoryConfig::default(),
            clock,
        ));
        ToolContext {
            cache,
            index,
            memory,
            fetcher: Arc::new(NoFetcher),
            search: None,
            chunking: ChunkParams {
                chunk_size: 200,
                overlap: 20,
                max_seq_length: 512,
            },
            session_id: Some("s1".to_string()),
            top_k: 5,
        }
    }

    fn engine(llm: Arc<ScriptedLlm>, config: EngineConfig) -> ConversationEngine {
        ConversationEngine::new(llm, Arc::new(UsageTracker::new()), config, "worker".into())
    }

    fn base_messages() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("You are a research assistant."),
            ChatMessage::user("What is BM25?"),
        ]
    }

    #[tokio::test]
    async fn direct_answer_finishes_in_one_call() {
        let llm = ScriptedLlm::new(vec![Ok(LlmReply::Content(
            "BM25 is a lexical ranking function.".into(),
        ))]);
        let eng = engine(Arc::clone(&llm), EngineConfig::default());
        let ctx = tool_ctx().await;
        let registry = ToolRegistry::with_builtins();

        let answer = eng.run(base_messages(), &registry, &ctx).await.unwrap();
        assert_eq!(answer, "BM25 is a lexical ranking function.");
        assert_eq!(llm.request_count(), 1);
    }

    #[tokio::test]
    async fn tool_call_roundtrip_then_answer() {
        let llm = ScriptedLlm::new(vec![
            Ok(LlmReply::ToolCalls(vec![ToolCall {
                id: "call-0".into(),
                name: "save_finding".into(),
                arguments: json!({ "text": "BM25 uses term frequency saturation" }),
            }])),
            Ok(LlmReply::Content("Saved and summarized.".into())),
        ]);
        let eng = engine(Arc::clone(&llm), EngineConfig::default());
        let ctx = tool_ctx().await;
        let registry = ToolRegistry::with_builtins();

        let answer = eng.run(base_messages(), &registry, &ctx).await.unwrap();
        assert_eq!(answer, "Saved and summarized.");
        assert_eq!(llm.request_count(), 2);

        // Second request carries the structured tool result.
        let second = llm.last_request();
        let tool_message = second
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .expect("tool result appended");
        assert!(tool_message.content.contains("\"ok\":true"));
    }

    #[tokio::test]
    async fn inline_json_tool_call_is_dispatched() {
        let llm = ScriptedLlm::new(vec![
            Ok(LlmReply::Content(
                r#"{"tool": "save_finding", "arguments": {"text": "inline call"}}"#.into(),
            )),
            Ok(LlmReply::Content("Done.".into())),
        ]);
        let eng = engine(Arc::clone(&llm), EngineConfig::default());
        let ctx = tool_ctx().await;
        let registry = ToolRegistry::with_builtins();

        let answer = eng.run(base_messages(), &registry, &ctx).await.unwrap();
        assert_eq!(answer, "Done.");
        assert_eq!(llm.request_count(), 2);
    }

    #[tokio::test]
    async fn one_empty_reply_gets_corrective_retry() {
        let llm = ScriptedLlm::new(vec![
            Ok(LlmReply::Empty),
            Ok(LlmReply::Content("Recovered answer.".into())),
        ]);
        let eng = engine(Arc::clone(&llm), EngineConfig::default());
        let ctx = tool_ctx().await;
        let registry = ToolRegistry::with_builtins();

        let answer = eng.run(base_messages(), &registry, &ctx).await.unwrap();
        assert_eq!(answer, "Recovered answer.");

        let second = llm.last_request();
        assert!(second
            .messages
            .iter()
            .any(|m| m.content.contains("Your last reply was empty")));
    }

    #[tokio::test]
    async fn two_empty_replies_yield_apology() {
        let llm = ScriptedLlm::new(vec![Ok(LlmReply::Empty), Ok(LlmReply::Empty)]);
        let eng = engine(Arc::clone(&llm), EngineConfig::default());
        let ctx = tool_ctx().await;
        let registry = ToolRegistry::with_builtins();

        let answer = eng.run(base_messages(), &registry, &ctx).await.unwrap();
        assert!(answer.contains("sorry"));
    }

    #[tokio::test]
    async fn max_turns_triggers_tool_free_graceful_exit() {
        let looping_call = || {
            Ok(LlmReply::ToolCalls(vec![ToolCall {
                id: "call-0".into(),
                name: "save_finding".into(),
                arguments: json!({ "text": "still researching" }),
            }]))
        };
        let mut replies: Vec<Result<LlmReply>> = (0..3).map(|_| looping_call()).collect();
        replies.push(Ok(LlmReply::Content("Closing summary.".into())));

        let config = EngineConfig {
            max_turns: 3,
            ..Default::default()
        };
        let llm = ScriptedLlm::new(replies);
        let eng = engine(Arc::clone(&llm), config);
        let ctx = tool_ctx().await;
        let registry = ToolRegistry::with_builtins();

        let answer = eng.run(base_messages(), &registry, &ctx).await.unwrap();
        assert_eq!(answer, "Closing summary.");

        let last = llm.last_request();
        assert!(last.tools.is_empty(), "graceful exit must be tool-free");
        assert!(last
            .messages
            .iter()
            .any(|m| m.content.contains("all available research steps")));
    }

    #[tokio::test]
    async fn proactive_compaction_summarizes_tool_outputs() {
        let config = EngineConfig {
            context_limit: 600,
            compaction_threshold: 0.5, // trip at 300 tokens
            ..Default::default()
        };
        let llm = ScriptedLlm::new(vec![Ok(LlmReply::Content("ok".into()))]);
        let eng = engine(Arc::clone(&llm), config);
        let ctx = tool_ctx().await;
        let registry = ToolRegistry::with_builtins();

        let mut messages = base_messages();
        let mut tool_msg =
            ChatMessage::tool_result("call-0", "long tool output sentence. ".repeat(60));
        tool_msg.summary = Some("short cached summary".into());
        messages.push(tool_msg);
        messages.push(ChatMessage::user("and now?"));

        let answer = eng.run(messages, &registry, &ctx).await.unwrap();
        assert_eq!(answer, "ok");

        let sent = llm.last_request();
        let tool_sent = sent
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_sent.content.contains("[compacted tool output]"));
        assert!(tool_sent.content.contains("short cached summary"));
    }

    #[tokio::test]
    async fn destructive_compaction_preserves_system_and_last_user() {
        let config = EngineConfig {
            context_limit: 400,
            compaction_threshold: 0.5, // 200 tokens
            ..Default::default()
        };
        let llm = ScriptedLlm::new(vec![Ok(LlmReply::Content("ok".into()))]);
        let eng = engine(Arc::clone(&llm), config);
        let ctx = tool_ctx().await;
        let registry = ToolRegistry::with_builtins();

        let mut messages = vec![ChatMessage::system("system prompt")];
        for i in 0..10 {
            messages.push(ChatMessage::user(format!(
                "old message {} {}",
                i,
                "padding ".repeat(30)
            )));
            messages.push(ChatMessage::assistant(format!(
                "old reply {} {}",
                i,
                "padding ".repeat(30)
            )));
        }
        messages.push(ChatMessage::user("the final question"));

        let answer = eng.run(messages, &registry, &ctx).await.unwrap();
        assert_eq!(answer, "ok");

        let sent = llm.last_request();
        assert!(sent.messages.iter().any(|m| m.role == Role::System));
        assert_eq!(
            sent.messages.last().unwrap().content,
            "the final question"
        );
        assert!(estimate_tokens(&sent.messages) <= 200);
    }

    #[tokio::test]
    async fn unshrinkable_context_raises_overflow() {
        let config = EngineConfig {
            context_limit: 50,
            compaction_threshold: 0.8,
            ..Default::default()
        };
        let llm = ScriptedLlm::new(vec![]);
        let eng = engine(llm, config);
        let ctx = tool_ctx().await;
        let registry = ToolRegistry::with_builtins();

        let messages = vec![
            ChatMessage::system("system prompt padding ".repeat(20)),
            ChatMessage::user("a giant question ".repeat(40)),
        ];
        let err = eng.run(messages, &registry, &ctx).await.unwrap_err();
        match err {
            Error::ContextOverflow(minimal) => {
                assert!(minimal.iter().any(|m| m.role == Role::System));
                assert!(minimal.iter().any(|m| m.role == Role::User));
            }
            other => panic!("expected ContextOverflow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reactive_400_surfaces_overflow() {
        let llm = ScriptedLlm::new(vec![Err(Error::transport(
            "HTTP 400 from provider: context length exceeded",
            false,
        ))]);
        let eng = engine(llm, EngineConfig::default());
        let ctx = tool_ctx().await;
        let registry = ToolRegistry::with_builtins();

        let err = eng.run(base_messages(), &registry, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::ContextOverflow(_)));
    }

    #[tokio::test]
    async fn llm_summary_strategy_uses_summarizer_model() {
        let config = EngineConfig {
            context_limit: 600,
            compaction_threshold: 0.5,
            compaction_strategy: "llm_summary".into(),
            analysis_model: Some("summarizer".into()),
            ..Default::default()
        };
        let llm = ScriptedLlm::new(vec![
            Ok(LlmReply::Content("two sentence summary from the model".into())),
            Ok(LlmReply::Content("final".into())),
        ]);
        let eng = engine(Arc::clone(&llm), config);
        let ctx = tool_ctx().await;
        let registry = ToolRegistry::with_builtins();

        let mut messages = base_messages();
        messages.push(ChatMessage::tool_result(
            "call-0",
            "long tool output sentence. ".repeat(60),
        ));
        messages.push(ChatMessage::user("and now?"));

        let answer = eng.run(messages, &registry, &ctx).await.unwrap();
        assert_eq!(answer, "final");

        // First request was the summarizer call against its own alias.
        let first = llm.requests.lock().unwrap()[0].clone();
        assert_eq!(first.model, "summarizer");
        let sent = llm.last_request();
        let tool_sent = sent
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_sent
            .content
            .contains("two sentence summary from the model"));
    }
}
