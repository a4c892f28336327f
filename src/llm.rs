//! LLM client seam, chat messages, tool-call parsing, and usage
//! accounting.
//!
//! Small models emit tool calls in more than one surface form: native
//! structured calls, inline JSON objects, or XML-ish tags. All of them
//! normalize through [`parse_tool_calls`] into [`ToolCall`] values
//! before dispatch, so the engine sees exactly one shape.
//!
//! Token accounting uses the 4-chars-per-token approximation; the
//! [`UsageTracker`] accumulates input/output tokens per model alias and
//! per role (main worker vs summarizer) and is read-only to callers.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::chunker::approx_tokens;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Set on tool-result messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Cached short form used by compaction in place of the content.
    #[serde(skip)]
    pub summary: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
            summary: None,
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            summary: None,
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            summary: None,
        }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            summary: None,
        }
    }

    pub fn token_count(&self) -> usize {
        approx_tokens(&self.content)
    }
}

/// A normalized tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// API-safe function schema advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// What one model call produced.
#[derive(Debug, Clone)]
pub enum LlmReply {
    Content(String),
    ToolCalls(Vec<ToolCall>),
    /// Neither content nor tool calls; the engine retries once.
    Empty,
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    /// Provider-specific parameter overrides (temperature, etc.).
    pub params: Value,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn send(&self, request: &LlmRequest) -> Result<LlmReply, crate::error::Error>;
}

// ============ Tool-call parsing ============

/// A tool call as it appeared in model output, before normalization.
#[derive(Debug, Clone)]
pub enum RawToolCall {
    Json(Value),
    Xml { name: String, body: String },
}

impl RawToolCall {
    fn normalize(self, ordinal: usize) -> Option<ToolCall> {
        match self {
            RawToolCall::Json(value) => {
                let name = value
                    .get("tool")
                    .or_else(|| value.get("name"))
                    .and_then(|v| v.as_str())?
                    .to_string();
                let arguments = value
                    .get("arguments")
                    .or_else(|| value.get("args"))
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                Some(ToolCall {
                    id: format!("call-{}", ordinal),
                    name,
                    arguments,
                })
            }
            RawToolCall::Xml { name, body } => {
                let arguments = serde_json::from_str(body.trim())
                    .unwrap_or_else(|_| Value::Object(Default::default()));
                Some(ToolCall {
                    id: format!("call-{}", ordinal),
                    name,
                    arguments,
                })
            }
        }
    }
}

/// Parse inline tool calls out of assistant text.
///
/// Accepts JSON objects (optionally in a code fence) with
/// `tool`/`name` + `arguments`, and XML-style
/// `<tool_call name="...">{...}</tool_call>` tags. Returns calls in
/// appearance order.
pub fn parse_tool_calls(content: &str) -> Vec<ToolCall> {
    let mut raw: Vec<RawToolCall> = Vec::new();

    let stripped = strip_code_fence(content);

    if let Ok(value) = serde_json::from_str::<Value>(stripped.trim()) {
        match value {
            Value::Array(items) => {
                raw.extend(items.into_iter().map(RawToolCall::Json));
            }
            Value::Object(_) => raw.push(RawToolCall::Json(value)),
            _ => {}
        }
    }

    if raw.is_empty() {
        raw.extend(parse_xml_calls(content));
    }

    raw.into_iter()
        .enumerate()
        .filter_map(|(i, r)| r.normalize(i))
        .collect()
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches('\n');
    rest.strip_suffix("```").map(|s| s.trim()).unwrap_or(rest)
}

fn parse_xml_calls(content: &str) -> Vec<RawToolCall> {
    let mut out = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(content.as_bytes());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut body = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"tool_call" {
                    let name = e
                        .attributes()
                        .filter_map(|a| a.ok())
                        .find(|a| a.key.as_ref() == b"name")
                        .and_then(|a| String::from_utf8(a.value.to_vec()).ok());
                    current = name;
                    body.clear();
                }
            }
            Ok(quick_xml::events::Event::Text(t)) => {
                if current.is_some() {
                    body.push_str(t.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"tool_call" {
                    if let Some(name) = current.take() {
                        out.push(RawToolCall::Xml {
                            name,
                            body: std::mem::take(&mut body),
                        });
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => break, // free text around tags is expected
            _ => {}
        }
        buf.clear();
    }
    out
}

// ============ OpenAI-compatible chat client ============

/// Chat client for any OpenAI-compatible completions endpoint.
///
/// Requires `OPENAI_API_KEY` unless the endpoint is local. Retries
/// 429/5xx with exponential backoff; other 4xx surface as fatal
/// transport errors carrying the status code so the engine can detect
/// context overflows.
pub struct OpenAiChatClient {
    base_url: String,
    timeout_secs: u64,
    max_retries: u32,
    backoff_initial_secs: f64,
}

impl OpenAiChatClient {
    pub fn new(
        base_url: Option<&str>,
        timeout_secs: u64,
        max_retries: u32,
        backoff_initial_secs: f64,
    ) -> Self {
        Self {
            base_url: base_url.unwrap_or("https://api.openai.com").trim_end_matches('/').to_string(),
            timeout_secs,
            max_retries,
            backoff_initial_secs,
        }
    }

    fn render_body(request: &LlmRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| match m.role {
                Role::Tool => serde_json::json!({
                    "role": "tool",
                    "tool_call_id": m.tool_call_id,
                    "content": m.content,
                }),
                _ => serde_json::json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        _ => "assistant",
                    },
                    "content": m.content,
                }),
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Value::Object(params) = &request.params {
            if let Value::Object(obj) = &mut body {
                for (k, v) in params {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
        body
    }

    fn parse_reply(json: &Value) -> LlmReply {
        let message = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"));
        let Some(message) = message else {
            return LlmReply::Empty;
        };

        if let Some(calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
            let parsed: Vec<ToolCall> = calls
                .iter()
                .filter_map(|c| {
                    let function = c.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let arguments = function
                        .get("arguments")
                        .and_then(|a| a.as_str())
                        .and_then(|a| serde_json::from_str(a).ok())
                        .unwrap_or_else(|| Value::Object(Default::default()));
                    Some(ToolCall {
                        id: c
                            .get("id")
                            .and_then(|i| i.as_str())
                            .unwrap_or("call-0")
                            .to_string(),
                        name,
                        arguments,
                    })
                })
                .collect();
            if !parsed.is_empty() {
                return LlmReply::ToolCalls(parsed);
            }
        }

        match message.get("content").and_then(|c| c.as_str()) {
            Some(content) if !content.trim().is_empty() => LlmReply::Content(content.to_string()),
            _ => LlmReply::Empty,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn send(&self, request: &LlmRequest) -> Result<LlmReply, crate::error::Error> {
        use crate::error::Error;

        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| Error::transport(e.to_string(), false))?;
        let body = Self::render_body(request);

        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_initial_secs * f64::from(1u32 << (attempt - 1).min(5));
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
            }

            let resp = client
                .post(format!("{}/v1/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: Value = response
                            .json()
                            .await
                            .map_err(|e| Error::transport(e.to_string(), true))?;
                        return Ok(Self::parse_reply(&json));
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(Error::transport(format!("HTTP {}: {}", status, text), true));
                        continue;
                    }
                    let text = response.text().await.unwrap_or_default();
                    return Err(Error::transport(
                        format!("HTTP {}: {}", status.as_u16(), text),
                        false,
                    ));
                }
                Err(e) => {
                    last_err = Some(Error::transport(e.to_string(), true));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::transport("LLM call failed after retries", true)))
    }
}

// ============ Usage accounting ============

/// Which model role consumed the tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageRole {
    Main,
    Summarizer,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageCounters {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub calls: usize,
}

/// Accumulates approximate token usage per `(model alias, role)`.
#[derive(Default)]
pub struct UsageTracker {
    counters: Mutex<HashMap<(String, UsageRole), UsageCounters>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model: &str, role: UsageRole, input_tokens: usize, output_tokens: usize) {
        let mut counters = self.counters.lock().expect("usage lock");
        let entry = counters
            .entry((model.to_string(), role))
            .or_default();
        entry.input_tokens += input_tokens;
        entry.output_tokens += output_tokens;
        entry.calls += 1;
    }

    pub fn record_messages(&self, model: &str, role: UsageRole, messages: &[ChatMessage]) {
        let input: usize = messages.iter().map(|m| m.token_count()).sum();
        self.record(model, role, input, 0);
    }

    /// Read-only snapshot for the UI collaborator, sorted by model alias.
    pub fn snapshot(&self) -> Vec<(String, UsageRole, UsageCounters)> {
        let counters = self.counters.lock().expect("usage lock");
        let mut rows: Vec<(String, UsageRole, UsageCounters)> = counters
            .iter()
            .map(|((model, role), c)| (model.clone(), *role, *c))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    pub fn total_output_tokens(&self) -> usize {
        self.counters
            .lock()
            .expect("usage lock")
            .values()
            .map(|c| c.output_tokens)
            .sum()
    }
}

/// Estimated token footprint of a message list.
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| m.token_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_json_call() {
        let calls = parse_tool_calls(r#"{"tool": "web_search", "arguments": {"query": "rust"}}"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].arguments, json!({"query": "rust"}));
    }

    #[test]
    fn parses_fenced_json_call_with_name_key() {
        let content = "```json\n{\"name\": \"save_finding\", \"arguments\": {\"text\": \"x\"}}\n```";
        let calls = parse_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "save_finding");
    }

    #[test]
    fn parses_json_array_of_calls() {
        let content = r#"[
            {"tool": "web_search", "arguments": {"query": "a"}},
            {"tool": "get_url_content", "arguments": {"urls": ["https://x.org"]}}
        ]"#;
        let calls = parse_tool_calls(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].name, "get_url_content");
        assert_eq!(calls[0].id, "call-0");
        assert_eq!(calls[1].id, "call-1");
    }

    #[test]
    fn parses_xml_call() {
        let content = r#"Let me search. <tool_call name="web_search">{"query": "rust async"}</tool_call>"#;
        let calls = parse_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].arguments, json!({"query": "rust async"}));
    }

    #[test]
    fn plain_prose_is_not_a_call() {
        assert!(parse_tool_calls("The answer is 42.").is_empty());
        assert!(parse_tool_calls(r#"{"no_tool_key": true}"#).is_empty());
    }

    #[test]
    fn xml_call_with_bad_json_gets_empty_args() {
        let content = r#"<tool_call name="web_search">not json</tool_call>"#;
        let calls = parse_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({}));
    }

    #[test]
    fn usage_tracker_accumulates_per_role() {
        let tracker = UsageTracker::new();
        tracker.record("worker", UsageRole::Main, 100, 20);
        tracker.record("worker", UsageRole::Main, 50, 10);
        tracker.record("worker", UsageRole::Summarizer, 30, 5);

        let rows = tracker.snapshot();
        let main = rows
            .iter()
            .find(|(_, role, _)| *role == UsageRole::Main)
            .unwrap();
        assert_eq!(main.2.input_tokens, 150);
        assert_eq!(main.2.output_tokens, 30);
        assert_eq!(main.2.calls, 2);
        assert_eq!(tracker.total_output_tokens(), 35);
    }

    #[test]
    fn token_estimate_uses_char_approximation() {
        let msg = ChatMessage::user("x".repeat(400));
        assert_eq!(msg.token_count(), 100);
        assert_eq!(estimate_tokens(&[msg.clone(), msg]), 200);
    }

    #[test]
    fn chat_reply_parses_content_and_tool_calls() {
        let json = serde_json::json!({
            "choices": [{
                "message": { "content": "plain answer" }
            }]
        });
        assert!(matches!(
            OpenAiChatClient::parse_reply(&json),
            LlmReply::Content(c) if c == "plain answer"
        ));

        let json = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "abc",
                        "function": { "name": "web_search", "arguments": "{\"query\": \"x\"}" }
                    }]
                }
            }]
        });
        match OpenAiChatClient::parse_reply(&json) {
            LlmReply::ToolCalls(calls) => {
                assert_eq!(calls[0].name, "web_search");
                assert_eq!(calls[0].arguments, json!({"query": "x"}));
            }
            other => panic!("expected tool calls, got {other:?}"),
        }

        let json = serde_json::json!({ "choices": [{ "message": { "content": "  " } }] });
        assert!(matches!(OpenAiChatClient::parse_reply(&json), LlmReply::Empty));
    }

    #[test]
    fn chat_body_carries_tools_and_params() {
        let request = LlmRequest {
            model: "worker".into(),
            messages: vec![ChatMessage::user("hi")],
            tools: vec![ToolSchema {
                name: "web_search".into(),
                description: "search".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }],
            params: json!({"temperature": 0.2}),
        };
        let body = OpenAiChatClient::render_body(&request);
        assert_eq!(body["tools"][0]["function"]["name"], json!("web_search"));
        assert_eq!(body["temperature"], json!(0.2));
        assert_eq!(body["messages"][0]["role"], json!("user"));
    }
}
