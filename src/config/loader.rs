//! Config loading, env-var overrides, and atomic saves.
//!
//! # Loading order
//! 1. Parse the first of `./vecai.yaml`, `./.vecai/config.yaml`,
//!    `<home>/.config/vecai/config.yaml` that exists (content is TOML; the
//!    `.yaml` extension matches the on-disk convention from the external
//!    interface description, not the encoding).
//! 2. Apply `VECAI_*` / `OLLAMA_HOST` environment variable overrides.
//! 3. Fall back to [`AppConfig::default()`] if no file is found.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use super::schema::AppConfig;

/// Candidate config paths, in first-found order.
pub fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("vecai.yaml"),
        PathBuf::from(".vecai/config.yaml"),
    ];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/vecai/config.yaml"));
    }
    paths
}

/// Load [`AppConfig`], trying each candidate path, falling back to defaults,
/// then applying environment variable overrides.
pub fn load_default_config() -> AppConfig {
    let mut config = candidate_paths()
        .into_iter()
        .find(|p| p.exists())
        .and_then(|p| load_config(&p).ok())
        .unwrap_or_default();

    apply_env_overrides(&mut config);
    config
}

/// Load [`AppConfig`] from an explicit path.
pub fn load_config(path: &Path) -> Result<AppConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("failed to read config at {path:?}: {e}"))?;
    toml::from_str(&content).map_err(|e| format!("failed to parse config at {path:?}: {e}"))
}

/// Apply environment variable overrides.
///
/// - `OLLAMA_HOST`      → `backend.base_url`
/// - `VECAI_LOG_LEVEL`  → `logging.level`
/// - `VECAI_DEBUG`      → `logging.debug` (1/0)
/// - `VECAI_DEBUG_DIR`  → `logging.debug_dir`
/// - `VECAI_DEBUG_LLM`  → `logging.debug_llm` (1/0)
pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = env::var("OLLAMA_HOST") {
        config.backend.base_url = v;
    }
    if let Ok(v) = env::var("VECAI_LOG_LEVEL") {
        config.logging.level = v;
    }
    if let Ok(v) = env::var("VECAI_DEBUG") {
        config.logging.debug = is_truthy(&v);
    }
    if let Ok(v) = env::var("VECAI_DEBUG_DIR") {
        config.logging.debug_dir = Some(v);
    }
    if let Ok(v) = env::var("VECAI_DEBUG_LLM") {
        config.logging.debug_llm = is_truthy(&v);
    }
}

fn is_truthy(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}

/// Atomically save `config` to `path` (temp-write, fsync via rename).
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), String> {
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("failed to serialize config: {e}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {e}"))?;
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, &content).map_err(|e| format!("failed to write temp config: {e}"))?;
    fs::rename(&tmp_path, path).map_err(|e| format!("failed to replace config file: {e}"))?;
    Ok(())
}
