//! Tool-result cache: content-addressed storage of full tool outputs, with
//! a size-bounded per-family summary substituted into the model's context
//! and a background TTL sweeper.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::CacheConfig;

/// One stored tool result, keyed by [`cache_key`].
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub tool_name: String,
    pub full: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

/// Deterministic key: `sha256(tool_name || sorted "k=v" pairs of input)`.
/// Insertion order of the input object's keys never affects the result.
pub fn cache_key(tool_name: &str, input: &Value) -> String {
    let mut pairs: Vec<(String, String)> = match input {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), canonical_value(v))).collect(),
        other => vec![("_".to_owned(), canonical_value(other))],
    };
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b"\0");
    for (k, v) in pairs {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"\x1e");
    }
    hex::encode(hasher.finalize())
}

fn canonical_value(v: &Value) -> String {
    // serde_json's Value -> String via Display produces a stable, compact
    // JSON form regardless of where the Value came from.
    v.to_string()
}

/// Whether a raw tool result is large enough to warrant summarization
/// before it re-enters the model's context. Small results bypass the
/// cache entirely — callers may skip `Store` for them.
pub fn should_cache(result: &str, config: &CacheConfig) -> bool {
    result.len() > config.max_summary_bytes || result.lines().count() > config.max_summary_lines
}

/// Dispatches by tool-name prefix to a per-family summarizer; falls back to
/// the generic summarizer for anything unrecognized.
fn summarize(tool_name: &str, result: &str, config: &CacheConfig) -> String {
    if tool_name.starts_with("file_read") {
        file_read_summary(result, config)
    } else if tool_name.starts_with("web_search") || tool_name.contains("search") {
        search_summary(result, config)
    } else {
        generic_summary(result, config)
    }
}

/// Truncates `lines` to at most `max_summary_lines - 1` lines (the last
/// line is reserved for the trailer `trailer_fn` composes) and bounds the
/// resulting `body\ntrailer` string to `max_summary_bytes` total, so the
/// complete returned summary — body *and* trailer — satisfies both §3
/// caps rather than just the body.
///
/// `trailer_fn(elided_lines, elided_bytes)` builds the trailer text from
/// the final elision counts; it's called twice because the trailer's own
/// length (which depends on the digit count of `elided_bytes`) has to be
/// known before the body's byte budget can be sized.
fn compose_bounded(
    lines: &[String],
    total_lines: usize,
    config: &CacheConfig,
    trailer_fn: impl Fn(usize, usize) -> String,
) -> String {
    let line_budget = config.max_summary_lines.saturating_sub(1);
    let kept: &[String] = &lines[..lines.len().min(line_budget)];
    let elided_lines = total_lines.saturating_sub(kept.len());

    let full_body = kept.join("\n");
    let placeholder_trailer = trailer_fn(elided_lines, 0);
    let byte_budget = config.max_summary_bytes.saturating_sub(placeholder_trailer.len() + 1);

    let mut body = full_body.clone();
    if body.len() > byte_budget {
        let mut cut = byte_budget;
        while cut > 0 && !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    let elided_bytes = full_body.len().saturating_sub(body.len());
    let trailer = trailer_fn(elided_lines, elided_bytes);

    let mut summary = if body.is_empty() { trailer } else { format!("{body}\n{trailer}") };

    // Absolute guarantee: the real trailer (with non-zero elided_bytes) can
    // be a byte or two longer than the placeholder used to size the body
    // budget above — or, for a pathologically small configured budget, can
    // exceed it outright. Either way, hard-clamp the complete summary so
    // the cap holds regardless of trailer length.
    if summary.len() > config.max_summary_bytes {
        let mut cut = config.max_summary_bytes;
        while cut > 0 && !summary.is_char_boundary(cut) {
            cut -= 1;
        }
        summary.truncate(cut);
    }
    summary
}

fn file_read_summary(result: &str, config: &CacheConfig) -> String {
    let all_lines: Vec<&str> = result.lines().collect();
    let half = (config.max_summary_lines / 2).max(1);
    let preview: Vec<String> = all_lines.iter().take(half).map(|l| l.to_string()).collect();
    let preview_len = preview.len();
    let total = all_lines.len();
    compose_bounded(&preview, preview_len, config, |elided_lines, elided_bytes| {
        format!("--- ({elided_lines} more lines, {elided_bytes} bytes elided; file had {total} lines total) ---")
    })
}

fn search_summary(result: &str, config: &CacheConfig) -> String {
    let all_lines: Vec<&str> = result.lines().collect();
    let match_like = all_lines.iter().filter(|l| l.contains(':') || l.contains("match")).count();
    let owned: Vec<String> = all_lines.iter().map(|l| l.to_string()).collect();
    let total = all_lines.len();
    compose_bounded(&owned, total, config, |elided_lines, elided_bytes| {
        format!("--- ({elided_lines} lines / {elided_bytes} bytes elided; ~{match_like} match-like lines total) ---")
    })
}

fn generic_summary(result: &str, config: &CacheConfig) -> String {
    const MAX_LINE_LEN: usize = 100;
    let all_lines: Vec<&str> = result.lines().collect();
    let total = all_lines.len();
    let truncated: Vec<String> = all_lines
        .iter()
        .map(|l| {
            if l.len() > MAX_LINE_LEN {
                let mut cut = MAX_LINE_LEN;
                while cut > 0 && !l.is_char_boundary(cut) {
                    cut -= 1;
                }
                format!("{}…", &l[..cut])
            } else {
                l.to_string()
            }
        })
        .collect();
    compose_bounded(&truncated, total, config, |elided_lines, elided_bytes| {
        format!("--- ({elided_lines} lines / {elided_bytes} bytes elided) ---")
    })
}

/// Content-addressed cache of full tool outputs. Process-wide and shared;
/// a single internal lock guards the map (§5 shared-resource policy).
pub struct ToolResultCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    config: CacheConfig,
    sweep_stop: Arc<Notify>,
    sweep_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ToolResultCache {
    pub fn new(config: CacheConfig) -> Self {
        let cache = Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            config,
            sweep_stop: Arc::new(Notify::new()),
            sweep_task: std::sync::Mutex::new(None),
        };
        cache.spawn_sweeper();
        cache
    }

    fn spawn_sweeper(&self) {
        let entries = self.entries.clone();
        let ttl = StdDuration::from_secs(self.config.ttl_secs.max(1));
        let stop = self.sweep_stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(ttl / 2) => {
                        let now = Utc::now();
                        let mut guard = entries.write().expect("cache lock poisoned");
                        guard.retain(|_, e| {
                            let age = now.signed_duration_since(e.last_access);
                            age.to_std().map(|d| d <= ttl).unwrap_or(true)
                        });
                    }
                    _ = stop.notified() => break,
                }
            }
        });
        *self.sweep_task.lock().expect("sweep task lock poisoned") = Some(handle);
    }

    /// Store a tool result, returning `(summary, key)`. The summary is
    /// bounded per §4.5; the full result remains retrievable via `get`.
    pub fn store(&self, tool_name: &str, input: &Value, result: &str) -> (String, String) {
        let key = cache_key(tool_name, input);
        let summary = summarize(tool_name, result, &self.config);
        let now = Utc::now();
        let entry = CacheEntry {
            key: key.clone(),
            tool_name: tool_name.to_owned(),
            full: result.to_owned(),
            summary: summary.clone(),
            created_at: now,
            last_access: now,
        };
        self.entries.write().expect("cache lock poisoned").insert(key.clone(), entry);
        (summary, key)
    }

    /// Retrieve the full result for `key`, bumping its access time.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut guard = self.entries.write().expect("cache lock poisoned");
        let entry = guard.get_mut(key)?;
        entry.last_access = Utc::now();
        Some(entry.full.clone())
    }

    pub fn get_by_tool(&self, tool_name: &str, input: &Value) -> Option<String> {
        let key = cache_key(tool_name, input);
        self.get(&key)
    }

    pub fn should_cache(&self, result: &str) -> bool {
        should_cache(result, &self.config)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn close(&self) {
        self.sweep_stop.notify_one();
        if let Some(handle) = self.sweep_task.lock().expect("sweep task lock poisoned").take() {
            handle.abort();
        }
    }
}
