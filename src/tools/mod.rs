pub mod file_ops;
pub mod registry;
pub mod retrieve_cached;
pub mod shell;
pub mod traits;
pub mod web;

use std::sync::Arc;

use crate::cache::ToolResultCache;
use crate::security::SecurityPolicy;

pub use file_ops::{FileListTool, FileReadTool, FileWriteTool};
pub use registry::ToolRegistry;
pub use retrieve_cached::RetrieveCachedTool;
pub use shell::ShellTool;
pub use traits::{Tool, ToolInfo, ToolResult};
pub use web::WebSearchTool;

/// Register the full tool set (§4.2). The analysis-mode, read-only registry
/// is then derived from this one via [`ToolRegistry::read_only_subset`] —
/// there is exactly one place tools get constructed.
pub fn register_builtin_tools(registry: &mut ToolRegistry, policy: Arc<SecurityPolicy>, cache: Arc<ToolResultCache>) {
    registry.register(Arc::new(ShellTool::new(policy.clone())));
    registry.register(Arc::new(FileReadTool::new(policy.clone())));
    registry.register(Arc::new(FileWriteTool::new(policy.clone())));
    registry.register(Arc::new(FileListTool::new(policy.clone())));
    registry.register(Arc::new(RetrieveCachedTool::new(cache)));

    if let Some(web_search) = WebSearchTool::from_env(policy) {
        registry.register(Arc::new(web_search));
    }
}
