//! The agent execution loop and its supporting cancellation primitive.

pub mod loop_;

pub use loop_::{AgentLoop, ApprovalCallback, CancellationToken};
