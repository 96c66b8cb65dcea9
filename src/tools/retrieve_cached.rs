//! Tool that fans back into the tool-result cache to retrieve a full
//! result the model previously only saw summarized (§4.5 Design Notes).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::backend::Capability;
use crate::cache::ToolResultCache;

use super::traits::{Tool, ToolResult};

pub struct RetrieveCachedTool {
    cache: Arc<ToolResultCache>,
}

impl RetrieveCachedTool {
    pub fn new(cache: Arc<ToolResultCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Tool for RetrieveCachedTool {
    fn name(&self) -> &str {
        "retrieve_cached"
    }

    fn description(&self) -> &str {
        "Fetch the full, unsummarized output of a prior tool call by its \
         cache key (shown alongside any summarized result)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {
                    "type": "string",
                    "description": "The cache key printed alongside a summarized tool result."
                }
            },
            "required": ["key"]
        })
    }

    fn capability(&self) -> Capability {
        Capability::Read
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let key = args.get("key").and_then(Value::as_str).ok_or("missing required argument 'key'")?;
        match self.cache.get(key) {
            Some(full) => Ok(ToolResult::ok(full)),
            None => Err(format!("no cached result found for key '{key}' (it may have expired)")),
        }
    }
}
