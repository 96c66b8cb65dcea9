//! Web search tool backed by the Tavily Search API.
//!
//! Only registered when `TAVILY_API_KEY` is set; its absence simply omits
//! the tool from both registries rather than erroring.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::backend::Capability;
use crate::security::{RiskLevel, SecurityPolicy};

use super::traits::{Tool, ToolResult};

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_RESULTS: usize = 5;

pub struct WebSearchTool {
    policy: Arc<SecurityPolicy>,
    client: reqwest::Client,
    api_key: String,
}

impl WebSearchTool {
    pub fn new(policy: Arc<SecurityPolicy>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { policy, client, api_key: api_key.into() }
    }

    /// Construct the tool from the environment, returning `None` if
    /// `TAVILY_API_KEY` is unset — callers should skip registration in
    /// that case rather than register a tool that always fails.
    pub fn from_env(policy: Arc<SecurityPolicy>) -> Option<Self> {
        std::env::var("TAVILY_API_KEY").ok().map(|key| Self::new(policy, key))
    }
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for up-to-date information and return a list of \
         relevant results (title, URL, short snippet)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The search query." },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results to return (default: 5).",
                    "minimum": 1,
                    "maximum": 10
                }
            },
            "required": ["query"]
        })
    }

    fn capability(&self) -> Capability {
        Capability::Read
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or("missing required argument 'query'")?;
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(MAX_RESULTS)
            .min(10);

        // Mode-driven permission (allow-once/allow-session/deny) is decided
        // once by the agent loop before `execute` is ever called.
        self.policy.log_action(self.name(), args.clone(), RiskLevel::Low, "allowed", None);

        let body = json!({
            "api_key": self.api_key,
            "query": query,
            "max_results": max_results,
        });

        let resp = self
            .client
            .post(TAVILY_ENDPOINT)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("search request failed: {e}"))?;

        if !resp.status().is_success() {
            return Err(format!("search API returned status {}", resp.status()));
        }

        let parsed: TavilyResponse =
            resp.json().await.map_err(|e| format!("failed to parse search response: {e}"))?;

        if parsed.results.is_empty() {
            return Ok(ToolResult::ok("no results found"));
        }

        let mut output = String::new();
        for (i, r) in parsed.results.iter().enumerate() {
            output.push_str(&format!("{}. {} ({})\n{}\n\n", i + 1, r.title, r.url, r.content));
        }

        Ok(ToolResult::ok(output.trim_end().to_owned())
            .with_metadata(json!({ "count": parsed.results.len() })))
    }
}
