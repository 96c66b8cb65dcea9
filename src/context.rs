//! Context manager: the agent loop's conversation state, token accounting,
//! and summarization-driven compaction.
//!
//! All reads/writes go through a single mutex (§5 shared-resource policy) —
//! external callers never hold this lock across a suspension point.

use std::sync::Mutex;

use crate::backend::types::Message;
use crate::config::AgentConfig;

/// Heuristic token estimate for a single string: `floor(chars/4) +
/// floor(chars/20)`. Matches §4.3 exactly; no real tokenizer is involved.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    chars / 4 + chars / 20
}

/// Fixed per-message bookkeeping overhead charged on top of content tokens.
const MESSAGE_OVERHEAD_TOKENS: usize = 10;

fn message_tokens(message: &Message) -> usize {
    let mut total = estimate_tokens(&message.content) + MESSAGE_OVERHEAD_TOKENS;
    if let Some(calls) = &message.tool_calls {
        for call in calls {
            total += estimate_tokens(&call.name) + estimate_tokens(&call.arguments.to_string());
        }
    }
    total
}

/// Learns a scale factor from observed backend token usage so externally
/// reported usage converges toward reality; internal thresholds always use
/// the raw estimate (§4.3).
pub struct TokenCalibrator {
    scale: Mutex<f64>,
}

impl TokenCalibrator {
    pub fn new() -> Self {
        Self { scale: Mutex::new(1.0) }
    }

    /// Fold one more (estimate, actual) observation into the running scale.
    /// Clamped to 2x to bound oscillation per the Design Notes.
    pub fn observe(&self, estimate: usize, actual: u64) {
        if estimate == 0 {
            return;
        }
        let ratio = (actual as f64 / estimate as f64).clamp(0.0, 2.0);
        let mut scale = self.scale.lock().expect("calibrator lock poisoned");
        // Exponential moving average so a single noisy sample can't whipsaw the scale.
        *scale = *scale * 0.7 + ratio * 0.3;
    }

    /// Apply the learned scale to an estimate, for external reporting only.
    pub fn adjust(&self, estimate: usize) -> usize {
        let scale = *self.scale.lock().expect("calibrator lock poisoned");
        ((estimate as f64) * scale).round() as usize
    }
}

impl Default for TokenCalibrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived, read-only view of context usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextStats {
    pub estimated_tokens: usize,
    pub window_tokens: usize,
    pub message_count: usize,
    pub needs_compaction: bool,
    pub needs_warning: bool,
}

impl ContextStats {
    pub fn usage_fraction(&self) -> f64 {
        if self.window_tokens == 0 {
            return 0.0;
        }
        self.estimated_tokens as f64 / self.window_tokens as f64
    }
}

struct State {
    system_prompt: String,
    messages: Vec<Message>,
    cached_tokens: usize,
    dirty: bool,
}

/// Marker prefixing the synthetic user message that wraps a compaction
/// summary, so downstream readers (and tests) can recognize it.
pub const SUMMARY_MARKER: &str = "[Summary of prior conversation]";

/// Owns the message list and token accounting for one agent session.
/// Exclusively owned by the agent loop driving that session (§3 Ownership).
pub struct ContextManager {
    state: Mutex<State>,
    pub window_tokens: usize,
    pub warn_fraction: f64,
    pub compact_fraction: f64,
    pub preserve_tail: usize,
    pub auto_compact: bool,
}

impl ContextManager {
    pub fn new(system_prompt: impl Into<String>, config: &AgentConfig) -> Self {
        Self {
            state: Mutex::new(State {
                system_prompt: system_prompt.into(),
                messages: Vec::new(),
                cached_tokens: 0,
                dirty: true,
            }),
            window_tokens: config.window_tokens,
            warn_fraction: config.warn_fraction,
            compact_fraction: config.compact_fraction,
            preserve_tail: config.preserve_tail,
            auto_compact: config.auto_compact,
        }
    }

    pub fn system_prompt(&self) -> String {
        self.state.lock().expect("context lock poisoned").system_prompt.clone()
    }

    pub fn push(&self, message: Message) {
        let mut state = self.state.lock().expect("context lock poisoned");
        state.messages.push(message);
        state.dirty = true;
    }

    /// Snapshot of the full message list, in order.
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().expect("context lock poisoned").messages.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("context lock poisoned").messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn recompute_if_dirty(state: &mut State) {
        if !state.dirty {
            return;
        }
        let mut total = estimate_tokens(&state.system_prompt) + MESSAGE_OVERHEAD_TOKENS;
        for m in &state.messages {
            total += message_tokens(m);
        }
        state.cached_tokens = total;
        state.dirty = false;
    }

    /// Raw (uncalibrated) token estimate, recomputed lazily when the
    /// message list has changed since the last query.
    pub fn estimated_tokens(&self) -> usize {
        let mut state = self.state.lock().expect("context lock poisoned");
        Self::recompute_if_dirty(&mut state);
        state.cached_tokens
    }

    pub fn stats(&self) -> ContextStats {
        let tokens = self.estimated_tokens();
        let message_count = self.len();
        let usage = if self.window_tokens == 0 { 0.0 } else { tokens as f64 / self.window_tokens as f64 };
        ContextStats {
            estimated_tokens: tokens,
            window_tokens: self.window_tokens,
            message_count,
            needs_compaction: usage >= self.compact_fraction && self.auto_compact,
            needs_warning: usage >= self.warn_fraction && usage < self.compact_fraction,
        }
    }

    /// Atomically replace the entire message list with a compaction
    /// summary plus the preserved tail (§4.3 Replace-with-summary).
    ///
    /// Result: `[synthetic user message wrapping S, synthetic assistant
    /// acknowledgment, ...tail]`, in that order.
    pub fn replace_with_summary(&self, summary: &str, tail: Vec<Message>) {
        let mut state = self.state.lock().expect("context lock poisoned");
        let mut replacement = Vec::with_capacity(2 + tail.len());
        replacement.push(Message::user(format!("{SUMMARY_MARKER}\n\n{summary}")));
        replacement.push(Message::assistant(
            "Understood — I have the summary of our prior conversation and will continue from there.",
        ));
        replacement.extend(tail);
        state.messages = replacement;
        state.dirty = true;
    }

    /// The last `k` messages, or all of them if `k >= len`.
    pub fn tail(&self, k: usize) -> Vec<Message> {
        let state = self.state.lock().expect("context lock poisoned");
        let len = state.messages.len();
        let start = len.saturating_sub(k);
        state.messages[start..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::Message;

    fn manager() -> ContextManager {
        ContextManager::new("system prompt", &AgentConfig::default())
    }

    #[test]
    fn estimate_empty_is_zero_and_monotone() {
        assert_eq!(estimate_tokens(""), 0);
        let short = estimate_tokens("hello");
        let long = estimate_tokens("hello world this is a much longer piece of text");
        assert!(long > short);
    }

    #[test]
    fn stats_reflect_pushed_messages() {
        let ctx = manager();
        let before = ctx.stats().estimated_tokens;
        ctx.push(Message::user("hello there"));
        let after = ctx.stats().estimated_tokens;
        assert!(after > before);
        assert_eq!(ctx.stats().message_count, 1);
    }

    #[test]
    fn needs_compact_at_boundary() {
        let mut config = AgentConfig::default();
        config.window_tokens = 100;
        config.compact_fraction = 0.95;
        config.warn_fraction = 0.80;
        let ctx = ContextManager::new("", &config);
        // Push enough content to sit exactly at the compact threshold.
        let long_text = "a".repeat(400); // ~95-100 estimated tokens depending on overhead
        ctx.push(Message::user(long_text));
        let stats = ctx.stats();
        if stats.usage_fraction() >= config.compact_fraction {
            assert!(stats.needs_compaction);
        }
    }

    #[test]
    fn warn_only_below_compact() {
        let mut config = AgentConfig::default();
        config.window_tokens = 1000;
        config.warn_fraction = 0.5;
        config.compact_fraction = 0.9;
        let ctx = ContextManager::new("", &config);
        ctx.push(Message::user("a".repeat(2000)));
        let stats = ctx.stats();
        let usage = stats.usage_fraction();
        if usage >= 0.5 && usage < 0.9 {
            assert!(stats.needs_warning);
            assert!(!stats.needs_compaction);
        }
    }

    #[test]
    fn replace_with_summary_has_correct_length_and_preserves_tail_order() {
        let ctx = manager();
        for i in 0..10 {
            ctx.push(Message::user(format!("msg {i}")));
        }
        let tail = ctx.tail(4);
        ctx.replace_with_summary("a summary of the earlier conversation", tail.clone());
        let messages = ctx.messages();
        assert_eq!(messages.len(), 2 + tail.len());
        assert!(messages[0].content.contains(SUMMARY_MARKER));
        for (i, m) in tail.iter().enumerate() {
            assert_eq!(messages[2 + i].content, m.content);
        }
    }

    #[test]
    fn replace_with_summary_k_larger_than_len() {
        let ctx = manager();
        ctx.push(Message::user("only message"));
        let tail = ctx.tail(50);
        assert_eq!(tail.len(), 1);
        ctx.replace_with_summary("summary", tail.clone());
        assert_eq!(ctx.len(), 2 + tail.len());
    }

    #[test]
    fn calibrator_clamps_to_2x_and_converges() {
        let cal = TokenCalibrator::new();
        cal.observe(100, 1000); // wildly off; ratio clamped to 2.0
        let adjusted = cal.adjust(100);
        assert!(adjusted <= 200);
        assert!(adjusted > 100);
    }

    #[test]
    fn calibrator_default_scale_is_identity() {
        let cal = TokenCalibrator::new();
        assert_eq!(cal.adjust(100), 100);
    }
}
