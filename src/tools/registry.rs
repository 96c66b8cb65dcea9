use std::{collections::HashMap, sync::Arc};

use crate::backend::Capability;

use super::traits::{Tool, ToolInfo};

/// Central registry of available tools.
///
/// Built once at startup (either the "full" registry or the read-only
/// "analysis" registry, per §4.2) and never mutated afterward for the
/// lifetime of a session.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Register a tool. Overwrites any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tools (for inclusion in model `tools` payloads).
    pub fn list(&self) -> Vec<ToolInfo> {
        self.tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                schema: t.parameters_schema(),
                capability: t.capability(),
            })
            .collect()
    }

    /// Build a registry containing only the tools whose capability is
    /// [`Capability::Read`] — the analysis-mode registry (§4.2). The
    /// selection happens once at startup; the result is otherwise an
    /// ordinary, independently owned registry.
    pub fn read_only_subset(&self) -> ToolRegistry {
        let mut subset = ToolRegistry::new();
        for tool in self.tools.values() {
            if tool.capability() == Capability::Read {
                subset.register(tool.clone());
            }
        }
        subset
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Iterate over all registered tools (unfiltered).
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Tool>)> {
        self.tools.iter()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::tools::traits::ToolResult;

    struct DummyTool(&'static str, Capability);

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "A test tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn capability(&self) -> Capability {
            self.1
        }
        async fn execute(&self, _args: Value) -> Result<ToolResult, String> {
            Ok(ToolResult::ok("done"))
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("dummy", Capability::Read)));
        assert!(reg.get("dummy").is_some());
        assert!(reg.get("nonexistent").is_none());
    }

    #[test]
    fn list_returns_all_with_capability() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("dummy", Capability::Write)));
        let list = reg.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "dummy");
        assert_eq!(list[0].capability, Capability::Write);
    }

    #[test]
    fn overwrite_same_name() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("dummy", Capability::Read)));
        reg.register(Arc::new(DummyTool("dummy", Capability::Read)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn read_only_subset_excludes_write_and_execute() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("file_read", Capability::Read)));
        reg.register(Arc::new(DummyTool("file_write", Capability::Write)));
        reg.register(Arc::new(DummyTool("shell", Capability::Execute)));

        let analysis = reg.read_only_subset();
        assert_eq!(analysis.len(), 1);
        assert!(analysis.get("file_read").is_some());
        assert!(analysis.get("file_write").is_none());
        assert!(analysis.get("shell").is_none());
    }
}
