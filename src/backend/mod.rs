//! Model backend abstraction: a local Ollama-compatible HTTP server plus
//! the wire-independent types the rest of the crate speaks in.

pub mod ollama;
pub mod types;

pub use ollama::{ModelBackend, OllamaClient};
pub use types::{
    CallOptions, Capability, ChatResponse, Message, Role, StopReason, StreamChunk, TokenUsage,
    ToolCall, ToolDefinition,
};
