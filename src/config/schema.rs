//! TOML configuration schema for vecai.
//!
//! All fields have `#[serde(default)]` so a partially-filled config file
//! works correctly. Missing sections fall back to their `Default` impl.
//!
//! Example `~/.config/vecai/config.yaml` (parsed as TOML-compatible keys):
//! ```toml
//! [backend]
//! base_url = "http://localhost:11434"
//! default_model = "qwen2.5-coder:7b"
//!
//! [permission]
//! mode = "ask"
//!
//! [agent]
//! max_iterations = 25
//! ```

use serde::{Deserialize, Serialize};

// ─── BackendConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the local model runner. Overridden by `OLLAMA_HOST`.
    pub base_url: String,
    pub default_model: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub temperature: f32,
    /// Passed through to `/api/chat`'s `keep_alive` field.
    pub keep_alive: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_owned(),
            default_model: "qwen2.5-coder:7b".to_owned(),
            request_timeout_secs: 120,
            max_retries: 3,
            temperature: 0.2,
            keep_alive: "5m".to_owned(),
        }
    }
}

// ─── AgentConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub window_tokens: usize,
    pub warn_fraction: f64,
    pub compact_fraction: f64,
    pub preserve_tail: usize,
    pub auto_compact: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            window_tokens: 32_000,
            warn_fraction: 0.80,
            compact_fraction: 0.95,
            preserve_tail: 4,
            auto_compact: true,
        }
    }
}

// ─── PermissionConfigMode ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Approve every tool call automatically.
    Auto,
    /// Approve reads automatically; prompt for write/execute.
    #[default]
    Ask,
    /// Prompt for every call, including reads.
    Strict,
    /// Approve reads; deny write/execute unconditionally.
    Analysis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PermissionConfig {
    pub mode: PermissionMode,
    pub workspace_root: Option<String>,
    pub blocked_dirs: Vec<String>,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_actions: usize,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            mode: PermissionMode::default(),
            workspace_root: None,
            blocked_dirs: Vec::new(),
            rate_limit_window_secs: 3600,
            rate_limit_max_actions: 600,
        }
    }
}

// ─── CacheConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_summary_bytes: usize,
    pub max_summary_lines: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_summary_bytes: 500,
            max_summary_lines: 10,
        }
    }
}

// ─── MemoryConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub max_disk_bytes: u64,
    pub flush_debounce_secs: u64,
    pub auto_prune_interval_secs: u64,
    pub default_ttl_secs: Option<u64>,
    pub solution_similarity_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            max_disk_bytes: 10 * 1024 * 1024,
            flush_debounce_secs: 5,
            auto_prune_interval_secs: 3600,
            default_ttl_secs: None,
            solution_similarity_threshold: 0.85,
        }
    }
}

// ─── LoggingConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub debug: bool,
    pub debug_dir: Option<String>,
    pub debug_llm: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            debug: false,
            debug_dir: None,
            debug_llm: false,
        }
    }
}

// ─── AppConfig ────────────────────────────────────────────────────────────────

/// Top-level application configuration.
///
/// Loaded from `<home>/.config/vecai/config.yaml` (or `./vecai.yaml`,
/// `./.vecai/config.yaml`), falling back to defaults, then overridden by
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub agent: AgentConfig,
    pub permission: PermissionConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub logging: LoggingConfig,
}
