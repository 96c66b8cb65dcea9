//! The agent execution loop: the observe → decide → act state machine
//! described in §4.7/§4.8. Owns one session's [`ContextManager`]
//! exclusively; every other collaborator (backend, registry, policy,
//! cache, memory) is shared and independently locked.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::backend::ModelBackend;
use crate::backend::types::{CallOptions, Capability, Message, ToolCall, ToolDefinition};
use crate::cache::ToolResultCache;
use crate::compactor::Compactor;
use crate::config::AgentConfig;
use crate::context::ContextManager;
use crate::error::{AgentError, Result, VecaiError};
use crate::memory::MemoryLayer;
use crate::security::{ApprovalChoice, PolicyDecision, SecurityPolicy};
use crate::tools::ToolRegistry;

/// A single cooperative cancellation source, shared between the loop, its
/// in-flight model call, and any in-flight tool executions (§5).
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)), notify: Arc::new(tokio::sync::Notify::new()) }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled, otherwise waits for the
    /// next [`cancel`](Self::cancel) call.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoked synchronously, outside all internal locks, when the permission
/// policy returns [`PolicyDecision::NeedsApproval`]. Returns `None` when no
/// interactive handler is wired up (e.g. a non-interactive run) — treated
/// as a denial.
pub type ApprovalCallback = Arc<dyn Fn(&str, Capability) -> Option<ApprovalChoice> + Send + Sync>;

const DEFAULT_SYSTEM_PREAMBLE: &str = "You are a local coding assistant with access to tools for \
reading and writing files, running shell commands, and searching the web. Use tools when you need \
information you don't already have, and explain your reasoning briefly before acting.";

pub struct AgentLoop {
    backend: Arc<dyn ModelBackend>,
    registry: Arc<ToolRegistry>,
    policy: Arc<SecurityPolicy>,
    cache: Arc<ToolResultCache>,
    context: ContextManager,
    compactor: Compactor,
    memory: Arc<MemoryLayer>,
    max_iterations: usize,
    approval: Option<ApprovalCallback>,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        registry: Arc<ToolRegistry>,
        policy: Arc<SecurityPolicy>,
        cache: Arc<ToolResultCache>,
        memory: Arc<MemoryLayer>,
        agent_config: &AgentConfig,
    ) -> Self {
        let system_prompt = DEFAULT_SYSTEM_PREAMBLE.to_owned();
        Self {
            compactor: Compactor::new(backend.clone()),
            context: ContextManager::new(system_prompt, agent_config),
            max_iterations: agent_config.max_iterations,
            backend,
            registry,
            policy,
            cache,
            memory,
            approval: None,
        }
    }

    pub fn with_approval_callback(mut self, callback: ApprovalCallback) -> Self {
        self.approval = Some(callback);
        self
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.registry
            .list()
            .into_iter()
            .map(|info| ToolDefinition {
                name: info.name,
                description: info.description,
                parameters: info.schema,
                capability: info.capability,
            })
            .collect()
    }

    /// Runs one full turn: the user's message plus however many model/tool
    /// iterations it takes to reach a terminal (tool-call-free) response.
    /// Returns the final assistant text.
    pub async fn handle_user_message(&mut self, user_input: &str, cancel: &CancellationToken) -> Result<String> {
        let enriched = match self.memory.enrich(user_input) {
            Some(context_block) => format!("{context_block}\n\n{user_input}"),
            None => user_input.to_owned(),
        };
        self.context.push(Message::user(enriched));

        for iteration in 0..self.max_iterations {
            if cancel.is_cancelled() {
                return Err(VecaiError::Agent(AgentError::Cancelled));
            }

            self.maybe_compact().await?;

            let system_prompt = self.context.system_prompt();
            let messages = self.context.messages();
            let tools = self.tool_definitions();

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(VecaiError::Agent(AgentError::Cancelled)),
                result = self.backend.chat(&messages, &tools, Some(&system_prompt), CallOptions::default()) => result?,
            };

            if response.tool_calls.is_empty() {
                self.context.push(Message::assistant(response.content.clone()));
                return Ok(response.content);
            }

            self.context
                .push(Message::assistant_with_calls(response.content.clone(), response.tool_calls.clone()));

            for call in &response.tool_calls {
                if cancel.is_cancelled() {
                    return Err(VecaiError::Agent(AgentError::Cancelled));
                }
                let result_text = self.dispatch_tool_call(call, cancel).await?;
                self.context.push(Message::tool_result(call.id.clone(), result_text));
            }

            if iteration + 1 >= self.max_iterations {
                return Err(VecaiError::Agent(AgentError::IterationCapExceeded(self.max_iterations)));
            }
        }

        Err(VecaiError::Agent(AgentError::IterationCapExceeded(self.max_iterations)))
    }

    /// Resolves one assistant-issued tool call to the content of its
    /// tool-result message (§4.7 step 5). Never returns `Err` for
    /// tool-level failures — those are reified as content; only
    /// cancellation propagates.
    async fn dispatch_tool_call(&self, call: &ToolCall, cancel: &CancellationToken) -> Result<String> {
        if let Some(parse_error) = &call.parse_error {
            return Ok(format!("tool call could not be parsed: {parse_error}"));
        }

        let Some(tool) = self.registry.get(&call.name) else {
            return Ok(format!("no tool registered with name '{}'", call.name));
        };

        // The loop is the sole mode-driven permission gate (§4.2/§4.7):
        // tools only re-check mode-independent restrictions (path/command
        // validation) inside their own `execute`, so an `AllowOnce` grant
        // here is honored exactly once rather than re-prompted-and-failed
        // inside the tool.
        match self.policy.evaluate(&call.name, tool.capability()) {
            PolicyDecision::Allowed => {}
            PolicyDecision::Denied(reason) => {
                return Ok(format!("permission_denied: {reason}"));
            }
            PolicyDecision::NeedsApproval => match self.request_approval(&call.name, tool.capability()) {
                Some(ApprovalChoice::AllowOnce) => {}
                Some(ApprovalChoice::AllowSession) => {
                    self.policy.remember_session_allow(&call.name, tool.capability());
                }
                Some(ApprovalChoice::Deny) | None => {
                    return Ok(format!("permission_denied: user declined to approve '{}'", call.name));
                }
            },
        }

        let execution = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VecaiError::Agent(AgentError::Cancelled)),
            result = tool.execute(call.arguments.clone()) => result,
        };

        match execution {
            Ok(result) => Ok(self.render_tool_output(&call.name, &call.arguments, &result.output)),
            Err(message) => Ok(format!("tool_error: {message}")),
        }
    }

    /// Stores the full output in the cache when it's large enough to
    /// warrant summarization, and returns the content that should go into
    /// the tool-result message (either the raw output, or a bounded
    /// summary plus the cache key for `retrieve_cached`).
    fn render_tool_output(&self, tool_name: &str, input: &Value, output: &str) -> String {
        if !self.cache.should_cache(output) {
            return output.to_owned();
        }
        let (summary, key) = self.cache.store(tool_name, input, output);
        format!("{summary}\n\n(full output cached; call retrieve_cached with key \"{key}\" to see it in full)")
    }

    fn request_approval(&self, tool_name: &str, capability: Capability) -> Option<ApprovalChoice> {
        self.approval.as_ref().and_then(|callback| callback(tool_name, capability))
    }

    async fn maybe_compact(&mut self) -> Result<()> {
        let stats = self.context.stats();
        if !stats.needs_compaction {
            return Ok(());
        }

        let messages = self.context.messages();
        match self.compactor.compact(&messages, self.context.preserve_tail).await {
            Ok(result) => {
                self.context.replace_with_summary(&result.summary, result.preserved_tail);
                Ok(())
            }
            Err(e) => {
                if stats.usage_fraction() >= 1.0 {
                    Err(VecaiError::Agent(AgentError::FatalInternal(format!(
                        "compaction failed and context is over its hard cap: {e}"
                    ))))
                } else {
                    tracing::warn!(error = %e, "compaction failed; continuing with uncompacted context");
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ollama::BoxStream;
    use crate::backend::types::{ChatResponse, Role, StopReason};
    use crate::config::{CacheConfig, MemoryConfig, PermissionMode};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    struct ScriptedBackend {
        responses: StdMutex<Vec<ChatResponse>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<ChatResponse>) -> Self {
            Self { responses: StdMutex::new(responses) }
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _system: Option<&str>,
            _options: CallOptions,
        ) -> Result<ChatResponse> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                panic!("scripted backend ran out of responses");
            }
            Ok(responses.remove(0))
        }

        async fn chat_stream(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _system: Option<&str>,
            _options: CallOptions,
        ) -> Result<BoxStream> {
            unimplemented!("not exercised by agent loop tests")
        }

        async fn generate(&self, _prompt: &str, _system: Option<&str>) -> Result<String> {
            Ok("summary".into())
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }

        fn set_model(&self, _model: &str) {}

        fn model(&self) -> String {
            "mock".into()
        }
    }

    fn final_response(text: &str) -> ChatResponse {
        ChatResponse { content: text.to_owned(), tool_calls: vec![], stop_reason: StopReason::EndTurn, usage: None }
    }

    fn tool_call_response(name: &str, args: Value) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall { id: "call_0".into(), name: name.to_owned(), arguments: args, parse_error: None }],
            stop_reason: StopReason::ToolUse,
            usage: None,
        }
    }

    async fn build_loop(dir: &TempDir, backend: Arc<dyn ModelBackend>, mode: PermissionMode) -> AgentLoop {
        let policy = Arc::new(SecurityPolicy::new(mode, None, vec![], 3600, 600));
        let cache = Arc::new(ToolResultCache::new(CacheConfig::default()));
        let memory = Arc::new(MemoryLayer::open(dir.path(), &MemoryConfig::default()).unwrap());

        let mut registry = ToolRegistry::new();
        crate::tools::register_builtin_tools(&mut registry, policy.clone(), cache.clone());
        let registry = Arc::new(registry);

        AgentLoop::new(backend, registry, policy, cache, memory, &AgentConfig::default())
    }

    #[tokio::test]
    async fn terminal_response_with_no_tool_calls() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![final_response("all done")]));
        let mut agent = build_loop(&dir, backend, PermissionMode::Auto).await;
        let cancel = CancellationToken::new();

        let reply = agent.handle_user_message("say hi", &cancel).await.unwrap();
        assert_eq!(reply, "all done");
        assert_eq!(agent.context().len(), 2); // user + assistant
    }

    #[tokio::test]
    async fn unknown_tool_call_synthesizes_result_and_continues() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![
            tool_call_response("not_a_real_tool", serde_json::json!({})),
            final_response("recovered"),
        ]));
        let mut agent = build_loop(&dir, backend, PermissionMode::Auto).await;
        let cancel = CancellationToken::new();

        let reply = agent.handle_user_message("do something", &cancel).await.unwrap();
        assert_eq!(reply, "recovered");

        let messages = agent.context().messages();
        let tool_result = messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_result.content.contains("no tool registered"));
    }

    #[tokio::test]
    async fn analysis_mode_denies_write_without_dispatch() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("should_not_exist.txt");
        let backend = Arc::new(ScriptedBackend::new(vec![
            tool_call_response("file_write", serde_json::json!({"path": target.display().to_string(), "content": "x"})),
            final_response("understood"),
        ]));
        let mut agent = build_loop(&dir, backend, PermissionMode::Analysis).await;
        let cancel = CancellationToken::new();

        agent.handle_user_message("write a file", &cancel).await.unwrap();

        assert!(!target.exists());
        let messages = agent.context().messages();
        let tool_result = messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_result.content.contains("permission_denied"));
    }

    #[tokio::test]
    async fn allow_once_actually_executes_the_tool() {
        // Regression: the loop used to record nothing for `AllowOnce`, and
        // each tool separately re-ran the mode-driven permission check
        // inside its own `execute`, so the second check always found
        // `NeedsApproval` again and failed the call the user just approved.
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("approved_once.txt");
        let backend = Arc::new(ScriptedBackend::new(vec![
            tool_call_response("file_write", serde_json::json!({"path": target.display().to_string(), "content": "hi"})),
            final_response("wrote it"),
        ]));

        let policy = Arc::new(SecurityPolicy::new(PermissionMode::Ask, None, vec![], 3600, 600));
        let cache = Arc::new(ToolResultCache::new(CacheConfig::default()));
        let memory = Arc::new(MemoryLayer::open(dir.path(), &MemoryConfig::default()).unwrap());
        let mut registry = ToolRegistry::new();
        crate::tools::register_builtin_tools(&mut registry, policy.clone(), cache.clone());
        let mut agent = AgentLoop::new(backend, Arc::new(registry), policy, cache, memory, &AgentConfig::default())
            .with_approval_callback(Arc::new(|_tool, _cap| Some(ApprovalChoice::AllowOnce)));

        let cancel = CancellationToken::new();
        agent.handle_user_message("write the file", &cancel).await.unwrap();

        assert!(target.exists(), "AllowOnce must let the write through, not fail it a second time");
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hi");

        let messages = agent.context().messages();
        let tool_result = messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(!tool_result.content.contains("permission_denied"));
        assert!(!tool_result.content.contains("tool_error"));
    }

    #[tokio::test]
    async fn strict_mode_allow_once_executes_even_for_reads() {
        // In strict mode every call — including reads — needs approval;
        // `AllowOnce` must still let the read through rather than double-
        // gating on the tool's own (now-removed) mode check.
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("readable.txt");
        std::fs::write(&file, "contents").unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![
            tool_call_response("file_read", serde_json::json!({"path": file.display().to_string()})),
            final_response("read it"),
        ]));

        let policy = Arc::new(SecurityPolicy::new(PermissionMode::Strict, None, vec![], 3600, 600));
        let cache = Arc::new(ToolResultCache::new(CacheConfig::default()));
        let memory = Arc::new(MemoryLayer::open(dir.path(), &MemoryConfig::default()).unwrap());
        let mut registry = ToolRegistry::new();
        crate::tools::register_builtin_tools(&mut registry, policy.clone(), cache.clone());
        let mut agent = AgentLoop::new(backend, Arc::new(registry), policy, cache, memory, &AgentConfig::default())
            .with_approval_callback(Arc::new(|_tool, _cap| Some(ApprovalChoice::AllowOnce)));

        let cancel = CancellationToken::new();
        agent.handle_user_message("read the file", &cancel).await.unwrap();

        let messages = agent.context().messages();
        let tool_result = messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool_result.content.trim(), "contents");
    }

    #[tokio::test]
    async fn iteration_cap_exceeded_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut responses = Vec::new();
        for _ in 0..30 {
            responses.push(tool_call_response("file_list", serde_json::json!({"path": dir.path().display().to_string()})));
        }
        let backend = Arc::new(ScriptedBackend::new(responses));
        let mut agent_config = AgentConfig::default();
        agent_config.max_iterations = 3;

        let policy = Arc::new(SecurityPolicy::new(PermissionMode::Auto, None, vec![], 3600, 600));
        let cache = Arc::new(ToolResultCache::new(CacheConfig::default()));
        let memory = Arc::new(MemoryLayer::open(dir.path(), &MemoryConfig::default()).unwrap());
        let mut registry = ToolRegistry::new();
        crate::tools::register_builtin_tools(&mut registry, policy.clone(), cache.clone());
        let mut agent = AgentLoop::new(backend, Arc::new(registry), policy, cache, memory, &agent_config);

        let cancel = CancellationToken::new();
        let result = agent.handle_user_message("loop forever", &cancel).await;
        assert!(matches!(result, Err(VecaiError::Agent(AgentError::IterationCapExceeded(3)))));
    }

    #[tokio::test]
    async fn cancellation_before_model_call_aborts_turn() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![final_response("should not be reached")]));
        let mut agent = build_loop(&dir, backend, PermissionMode::Auto).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = agent.handle_user_message("hello", &cancel).await;
        assert!(matches!(result, Err(VecaiError::Agent(AgentError::Cancelled))));
    }

    #[tokio::test]
    async fn tool_result_order_matches_call_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "A").unwrap();
        std::fs::write(&b, "B").unwrap();

        let backend = Arc::new(ScriptedBackend::new(vec![
            ChatResponse {
                content: String::new(),
                tool_calls: vec![
                    ToolCall { id: "1".into(), name: "file_read".into(), arguments: serde_json::json!({"path": a.display().to_string()}), parse_error: None },
                    ToolCall { id: "2".into(), name: "file_read".into(), arguments: serde_json::json!({"path": b.display().to_string()}), parse_error: None },
                ],
                stop_reason: StopReason::ToolUse,
                usage: None,
            },
            final_response("read both"),
        ]));
        let mut agent = build_loop(&dir, backend, PermissionMode::Auto).await;
        let cancel = CancellationToken::new();
        agent.handle_user_message("read a then b", &cancel).await.unwrap();

        let messages = agent.context().messages();
        let tool_results: Vec<&Message> = messages.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(tool_results[0].tool_call_id.as_deref(), Some("1"));
        assert_eq!(tool_results[0].content.trim(), "A");
        assert_eq!(tool_results[1].tool_call_id.as_deref(), Some("2"));
        assert_eq!(tool_results[1].content.trim(), "B");
    }
}
