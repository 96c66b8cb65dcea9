//! Core library for vecai, a local coding assistant built on an
//! Ollama-compatible model runner: agent execution loop, context
//! management, tool-result caching, persistent memory, and the
//! permission policy gating every tool call.

pub mod agent;
pub mod backend;
pub mod cache;
pub mod cli;
pub mod compactor;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod memory;
pub mod planner;
pub mod security;
pub mod session;
pub mod tools;

/// Convenience re-exports for the most commonly used traits and types.
///
/// ```rust
/// use vecai_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{AgentLoop, CancellationToken};
    pub use crate::backend::{ModelBackend, OllamaClient};
    pub use crate::backend::types::{Capability, Message, Role};
    pub use crate::cache::ToolResultCache;
    pub use crate::compactor::Compactor;
    pub use crate::config::{AppConfig, load_default_config};
    pub use crate::context::ContextManager;
    pub use crate::error::{Result, VecaiError};
    pub use crate::memory::MemoryLayer;
    pub use crate::planner::{Plan, Planner};
    pub use crate::security::SecurityPolicy;
    pub use crate::tools::{Tool, ToolRegistry, ToolResult};
}
