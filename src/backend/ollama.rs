//! HTTP client for a local Ollama-compatible model runner.
//!
//! Talks the backend's *native* JSON protocol (not the OpenAI-compatible
//! shim some runners also expose): `POST /api/chat` for tool-calling
//! conversation turns, `POST /api/generate` for one-shot prompts, and
//! `GET /api/tags` for model discovery.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

use crate::error::{BackendError, Result as VResult, VecaiError};

use super::types::{CallOptions, ChatResponse, Message, Role, StopReason, StreamChunk, TokenUsage, ToolCall, ToolDefinition};

/// Result alias matching the rest of the crate's error taxonomy.
pub type Result<T> = VResult<T>;

pub type BoxStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Abstraction over the model backend so the agent loop can be tested
/// against a mock implementation without a running Ollama instance.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system: Option<&str>,
        options: CallOptions,
    ) -> Result<ChatResponse>;

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system: Option<&str>,
        options: CallOptions,
    ) -> Result<BoxStream>;

    /// One-shot, tool-free generation — used for the compactor and planner.
    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String>;

    async fn list_models(&self) -> Result<Vec<String>>;

    /// Select the active model for subsequent calls.
    fn set_model(&self, model: &str);

    fn model(&self) -> String;
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    stream: bool,
    options: WireOptions,
    keep_alive: &'a str,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireToolCall {
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize, Clone)]
struct WireFunctionCall {
    name: String,
    arguments: Value,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef,
}

#[derive(Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Serialize, Default)]
struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatWireResponse {
    message: WireMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct GenerateWireResponse {
    response: String,
    #[serde(default)]
    done: bool,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagsModel>,
}

#[derive(Deserialize)]
struct TagsModel {
    name: String,
}

// ─── Translation helpers ──────────────────────────────────────────────────────

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn to_wire_messages(system: Option<&str>, messages: &[Message]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if let Some(s) = system {
        wire.push(WireMessage { role: "system".into(), content: s.to_owned(), tool_calls: None });
    }
    for m in messages {
        let tool_calls = m.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .filter(|c| c.parse_error.is_none())
                .map(|c| WireToolCall {
                    function: WireFunctionCall { name: c.name.clone(), arguments: c.arguments.clone() },
                })
                .collect()
        });
        wire.push(WireMessage { role: role_str(m.role).to_owned(), content: m.content.clone(), tool_calls });
    }
    wire
}

fn to_wire_tools(tools: &[ToolDefinition]) -> Vec<WireTool> {
    tools
        .iter()
        .map(|t| WireTool {
            kind: "function",
            function: WireFunctionDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

/// Converts native Ollama tool calls, surfacing a malformed `arguments`
/// payload as a `ToolCall` with `parse_error` set rather than dropping it.
fn from_wire_tool_calls(calls: Vec<WireToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let id = format!("call_{i}");
            if c.function.arguments.is_object() || c.function.arguments.is_null() {
                ToolCall { id, name: c.function.name, arguments: c.function.arguments, parse_error: None }
            } else {
                ToolCall::parse_failure(id, c.function.name, "tool arguments were not a JSON object")
            }
        })
        .collect()
}

fn stop_reason(done_reason: Option<&str>, has_tool_calls: bool) -> StopReason {
    if has_tool_calls {
        return StopReason::ToolUse;
    }
    match done_reason {
        Some("length") => StopReason::Length,
        Some("stop") | None => StopReason::EndTurn,
        Some(_) => StopReason::EndTurn,
    }
}

// ─── OllamaClient ──────────────────────────────────────────────────────────────

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: Mutex<String>,
    keep_alive: String,
    max_retries: u32,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout_secs: u64, max_retries: u32, keep_alive: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            model: Mutex::new(model.into()),
            keep_alive: keep_alive.into(),
            max_retries,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Retries transient (connection/5xx) failures with exponential backoff:
    /// `base_delay * 2^(attempt-1)`.
    async fn with_retry<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        const BASE_DELAY_MS: u64 = 250;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.retryable() && attempt <= self.max_retries => {
                    let delay = BASE_DELAY_MS * (1u64 << (attempt - 1));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ModelBackend for OllamaClient {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system: Option<&str>,
        options: CallOptions,
    ) -> Result<ChatResponse> {
        let model = self.model();
        self.with_retry(|| async {
            let body = ChatRequest {
                model: &model,
                messages: to_wire_messages(system, messages),
                tools: to_wire_tools(tools),
                stream: false,
                options: WireOptions { temperature: options.temperature },
                keep_alive: &self.keep_alive,
            };

            let resp = self
                .http
                .post(self.url("/api/chat"))
                .json(&body)
                .send()
                .await
                .map_err(|e| VecaiError::Backend(BackendError::Unavailable(e.to_string())))?;

            if !resp.status().is_success() {
                return Err(VecaiError::Backend(BackendError::Unavailable(format!(
                    "backend returned status {}",
                    resp.status()
                ))));
            }

            let parsed: ChatWireResponse = resp
                .json()
                .await
                .map_err(|e| VecaiError::Backend(BackendError::BadResponse(e.to_string())))?;

            let tool_calls = from_wire_tool_calls(parsed.message.tool_calls.unwrap_or_default());
            let stop = stop_reason(parsed.done_reason.as_deref(), !tool_calls.is_empty());
            let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
                (Some(p), Some(c)) => Some(TokenUsage { prompt_tokens: p, completion_tokens: c }),
                _ => None,
            };

            Ok(ChatResponse {
                content: parsed.message.content,
                tool_calls,
                stop_reason: if parsed.done { stop } else { StopReason::EndTurn },
                usage,
            })
        })
        .await
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system: Option<&str>,
        options: CallOptions,
    ) -> Result<BoxStream> {
        let model = self.model();
        let body = ChatRequest {
            model: &model,
            messages: to_wire_messages(system, messages),
            tools: to_wire_tools(tools),
            stream: true,
            options: WireOptions { temperature: options.temperature },
            keep_alive: &self.keep_alive,
        };

        let resp = self
            .http
            .post(self.url("/api/chat"))
            .json(&body)
            .send()
            .await
            .map_err(|e| VecaiError::Backend(BackendError::Unavailable(e.to_string())))?;

        if !resp.status().is_success() {
            return Err(VecaiError::Backend(BackendError::Unavailable(format!(
                "backend returned status {}",
                resp.status()
            ))));
        }

        // Ollama streams newline-delimited JSON objects, not SSE.
        let byte_stream = resp.bytes_stream();
        let chunked = byte_stream.scan(Vec::<u8>::new(), move |buf, chunk| {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => return futures::future::ready(Some(vec![Err(VecaiError::Backend(BackendError::Unavailable(e.to_string())))])),
            };
            buf.extend_from_slice(&chunk);
            let mut out = Vec::new();
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = &line[..line.len().saturating_sub(1)];
                if line.is_empty() {
                    continue;
                }
                out.push(parse_stream_line(line));
            }
            futures::future::ready(Some(out))
        });

        let flattened = chunked.flat_map(futures::stream::iter);
        Ok(Box::pin(flattened))
    }

    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let model = self.model();
        self.with_retry(|| async {
            let body = GenerateRequest { model: &model, prompt, system, stream: false };
            let resp = self
                .http
                .post(self.url("/api/generate"))
                .json(&body)
                .send()
                .await
                .map_err(|e| VecaiError::Backend(BackendError::Unavailable(e.to_string())))?;

            if !resp.status().is_success() {
                return Err(VecaiError::Backend(BackendError::Unavailable(format!(
                    "backend returned status {}",
                    resp.status()
                ))));
            }

            let parsed: GenerateWireResponse = resp
                .json()
                .await
                .map_err(|e| VecaiError::Backend(BackendError::BadResponse(e.to_string())))?;
            Ok(parsed.response)
        })
        .await
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| VecaiError::Backend(BackendError::Unavailable(e.to_string())))?;

        if !resp.status().is_success() {
            return Err(VecaiError::Backend(BackendError::Unavailable(format!(
                "backend returned status {}",
                resp.status()
            ))));
        }

        let parsed: TagsResponse = resp
            .json()
            .await
            .map_err(|e| VecaiError::Backend(BackendError::BadResponse(e.to_string())))?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    fn set_model(&self, model: &str) {
        *self.model.lock().expect("model lock poisoned") = model.to_owned();
    }

    fn model(&self) -> String {
        self.model.lock().expect("model lock poisoned").clone()
    }
}

#[derive(Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct PullWireResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaClient {
    /// Downloads `model` to the local runner via `/api/pull` (CLI `models
    /// pull` admin subcommand, §6). Not part of [`ModelBackend`] — it's a
    /// one-off administrative operation, not something the agent loop calls.
    pub async fn pull_model(&self, model: &str) -> Result<String> {
        let body = PullRequest { model, stream: false };
        let resp = self
            .http
            .post(self.url("/api/pull"))
            .json(&body)
            .send()
            .await
            .map_err(|e| VecaiError::Backend(BackendError::Unavailable(e.to_string())))?;

        if !resp.status().is_success() {
            return Err(VecaiError::Backend(BackendError::Unavailable(format!(
                "backend returned status {}",
                resp.status()
            ))));
        }

        let parsed: PullWireResponse = resp
            .json()
            .await
            .map_err(|e| VecaiError::Backend(BackendError::BadResponse(e.to_string())))?;

        if let Some(err) = parsed.error {
            return Err(VecaiError::Backend(BackendError::BadResponse(err)));
        }
        Ok(parsed.status)
    }
}

fn parse_stream_line(line: &[u8]) -> Result<StreamChunk> {
    let v: Value = serde_json::from_slice(line)
        .map_err(|e| VecaiError::Backend(BackendError::BadResponse(format!("malformed stream chunk: {e}"))))?;

    if let Some(err) = v.get("error").and_then(Value::as_str) {
        return Ok(StreamChunk::Error(err.to_owned()));
    }

    let done = v.get("done").and_then(Value::as_bool).unwrap_or(false);
    if done {
        let usage = match (
            v.get("prompt_eval_count").and_then(Value::as_u64),
            v.get("eval_count").and_then(Value::as_u64),
        ) {
            (Some(p), Some(c)) => Some(TokenUsage { prompt_tokens: p, completion_tokens: c }),
            _ => None,
        };
        return Ok(StreamChunk::Done(usage));
    }

    if let Some(message) = v.get("message") {
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            if let Some(first) = calls.first() {
                if let Some(func) = first.get("function") {
                    let name = func.get("name").and_then(Value::as_str).unwrap_or_default().to_owned();
                    let args = func.get("arguments").cloned().unwrap_or(Value::Object(Default::default()));
                    return Ok(StreamChunk::ToolCall(ToolCall { id: "call_0".into(), name, arguments: args, parse_error: None }));
                }
            }
        }
        if let Some(content) = message.get("content").and_then(Value::as_str) {
            if !content.is_empty() {
                return Ok(StreamChunk::Text(content.to_owned()));
            }
        }
        if let Some(thinking) = message.get("thinking").and_then(Value::as_str) {
            if !thinking.is_empty() {
                return Ok(StreamChunk::Thinking(thinking.to_owned()));
            }
        }
    }

    Ok(StreamChunk::Text(String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_chunk() {
        let line = br#"{"message":{"role":"assistant","content":"hi"},"done":false}"#;
        match parse_stream_line(line).unwrap() {
            StreamChunk::Text(t) => assert_eq!(t, "hi"),
            other => panic!("expected text chunk, got {other:?}"),
        }
    }

    #[test]
    fn parses_done_chunk_with_usage() {
        let line = br#"{"done":true,"prompt_eval_count":10,"eval_count":5}"#;
        match parse_stream_line(line).unwrap() {
            StreamChunk::Done(Some(usage)) => {
                assert_eq!(usage.prompt_tokens, 10);
                assert_eq!(usage.completion_tokens, 5);
            }
            other => panic!("expected done chunk, got {other:?}"),
        }
    }

    #[test]
    fn parses_error_chunk() {
        let line = br#"{"error":"model not found"}"#;
        match parse_stream_line(line).unwrap() {
            StreamChunk::Error(e) => assert_eq!(e, "model not found"),
            other => panic!("expected error chunk, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_bad_response() {
        let line = b"not json";
        assert!(parse_stream_line(line).is_err());
    }

    #[test]
    fn tool_call_with_non_object_arguments_sets_parse_error() {
        let calls = vec![WireToolCall {
            function: WireFunctionCall { name: "read_file".into(), arguments: Value::String("oops".into()) },
        }];
        let parsed = from_wire_tool_calls(calls);
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].parse_error.is_some());
        assert_eq!(parsed[0].name, "read_file");
    }

    #[test]
    fn tool_call_with_object_arguments_parses_cleanly() {
        let calls = vec![WireToolCall {
            function: WireFunctionCall {
                name: "read_file".into(),
                arguments: serde_json::json!({"path": "a.go"}),
            },
        }];
        let parsed = from_wire_tool_calls(calls);
        assert!(parsed[0].parse_error.is_none());
        assert_eq!(parsed[0].arguments["path"], "a.go");
    }

    #[test]
    fn stop_reason_prefers_tool_use() {
        assert_eq!(stop_reason(Some("stop"), true), StopReason::ToolUse);
        assert_eq!(stop_reason(Some("stop"), false), StopReason::EndTurn);
        assert_eq!(stop_reason(Some("length"), false), StopReason::Length);
    }

    #[test]
    fn set_and_get_model() {
        let client = OllamaClient::new("http://localhost:11434", "llama3.1", 30, 3, "5m");
        assert_eq!(client.model(), "llama3.1");
        client.set_model("qwen2.5-coder:7b");
        assert_eq!(client.model(), "qwen2.5-coder:7b");
    }
}
