//! LLM-driven summarization of a conversation prefix, plus optional
//! best-effort background "learnings" extraction.

use std::sync::Arc;

use serde_json::Value;

use crate::backend::ModelBackend;
use crate::backend::types::Message;
use crate::context::estimate_tokens;
use crate::error::{ContextError, Result, VecaiError};

const MAX_MESSAGE_CHARS: usize = 5000;

const SUMMARIZATION_SYSTEM_PROMPT: &str = "You are summarizing a coding assistant's conversation \
history so it can continue with less context. Produce a concise but complete summary covering: \
what the user asked for, what has been done so far, any unresolved questions, and any file paths \
or identifiers that matter going forward. Write plain prose, no preamble.";

const LEARNINGS_SYSTEM_PROMPT: &str = "Extract any durable, reusable lessons from this \
conversation that would help on a future, unrelated task (e.g. project conventions, recurring \
mistakes and their fixes, useful commands). Respond with a JSON array of short strings. If there \
is nothing worth keeping, respond with an empty array.";

/// Outcome of a successful compaction.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub summary: String,
    pub preserved_tail: Vec<Message>,
    pub prefix_tokens: usize,
    pub summary_tokens: usize,
    pub tokens_saved: usize,
}

fn role_label(message: &Message) -> &'static str {
    match message.role {
        crate::backend::Role::System => "System",
        crate::backend::Role::User => "User",
        crate::backend::Role::Assistant => "Assistant",
        crate::backend::Role::Tool => "Tool",
    }
}

fn format_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for (i, message) in messages.iter().enumerate() {
        let content = if message.content.len() > MAX_MESSAGE_CHARS {
            let mut cut = MAX_MESSAGE_CHARS;
            while cut > 0 && !message.content.is_char_boundary(cut) {
                cut -= 1;
            }
            format!(
                "{}\n...[truncated, {} more chars]...",
                &message.content[..cut],
                message.content.len() - cut
            )
        } else {
            message.content.clone()
        };
        out.push_str(&format!("{}. {}: {}\n\n", i + 1, role_label(message), content));
    }
    out
}

/// Splits `messages` into `(prefix, tail)` where `tail` is the last
/// `preserve_last` messages (or all of them, if fewer exist).
pub fn split_tail(messages: &[Message], preserve_last: usize) -> (&[Message], &[Message]) {
    let split_at = messages.len().saturating_sub(preserve_last);
    messages.split_at(split_at)
}

/// Callback invoked with extracted learnings; best-effort, never awaited
/// by the compactor's primary `compact` call.
pub type LearningsCallback = Arc<dyn Fn(Vec<String>) + Send + Sync>;

pub struct Compactor {
    backend: Arc<dyn ModelBackend>,
    learnings_callback: Option<LearningsCallback>,
}

impl Compactor {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend, learnings_callback: None }
    }

    pub fn with_learnings_callback(mut self, callback: LearningsCallback) -> Self {
        self.learnings_callback = Some(callback);
        self
    }

    /// Compact `messages`, preserving the last `preserve_last` verbatim.
    /// On success, also fires a best-effort background learnings
    /// extraction if a callback is registered and the prefix has more
    /// than two messages.
    pub async fn compact(&self, messages: &[Message], preserve_last: usize) -> Result<CompactionResult> {
        let (prefix, tail) = split_tail(messages, preserve_last);
        if prefix.is_empty() {
            return Err(VecaiError::Context(ContextError::CompactionFailed(
                "nothing to compact: prefix is empty".into(),
            )));
        }

        let transcript = format_transcript(prefix);
        let prefix_tokens = estimate_tokens(&transcript);

        let summary = self
            .backend
            .generate(&transcript, Some(SUMMARIZATION_SYSTEM_PROMPT))
            .await
            .map_err(|e| VecaiError::Context(ContextError::CompactionFailed(e.to_string())))?;

        let summary_tokens = estimate_tokens(&summary);
        let tokens_saved = prefix_tokens.saturating_sub(summary_tokens);

        if let Some(callback) = self.learnings_callback.clone() {
            if prefix.len() > 2 {
                let backend = self.backend.clone();
                let transcript = transcript.clone();
                tokio::spawn(async move {
                    if let Ok(learnings) = extract_learnings(backend.as_ref(), &transcript).await {
                        if !learnings.is_empty() {
                            callback(learnings);
                        }
                    }
                });
            }
        }

        Ok(CompactionResult {
            summary,
            preserved_tail: tail.to_vec(),
            prefix_tokens,
            summary_tokens,
            tokens_saved,
        })
    }
}

async fn extract_learnings(backend: &dyn ModelBackend, transcript: &str) -> Result<Vec<String>> {
    let reply = backend
        .generate(transcript, Some(LEARNINGS_SYSTEM_PROMPT))
        .await
        .map_err(|e| VecaiError::Context(ContextError::CompactionFailed(e.to_string())))?;

    let json_slice = extract_json_array(&reply)
        .ok_or_else(|| VecaiError::Context(ContextError::CompactionFailed("no JSON array in reply".into())))?;

    let parsed: Vec<Value> = serde_json::from_str(json_slice)
        .map_err(|e| VecaiError::Context(ContextError::CompactionFailed(e.to_string())))?;

    Ok(parsed
        .into_iter()
        .filter_map(|v| v.as_str().map(str::trim).map(str::to_owned))
        .filter(|s| !s.is_empty())
        .collect())
}

/// Finds the first top-level `[...]` span in `text`, tolerating any
/// prose the model wraps the array in.
fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end < start { None } else { Some(&text[start..=end]) }
}
