//! Web search tool.
//!
//! The search engine itself is a collaborator; the tool formats hits,
//! accumulates them as sources, and runs in the early phase so later tools
//! and the final reply can reference what it found.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use companion_chat::SourceItem;

use crate::tool::{ExecutionPhase, Result, Tool, ToolContext, ToolError, ToolOutput};

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> std::result::Result<Vec<SearchHit>, String>;
}

/// Canned results, for tests and offline runs.
#[derive(Default)]
pub struct StaticSearchProvider {
    pub hits: Vec<SearchHit>,
}

#[async_trait]
impl SearchProvider for StaticSearchProvider {
    async fn search(&self, query: &str, limit: usize) -> std::result::Result<Vec<SearchHit>, String> {
        let needle = query.to_lowercase();
        Ok(self
            .hits
            .iter()
            .filter(|hit| {
                hit.title.to_lowercase().contains(&needle)
                    || hit.snippet.to_lowercase().contains(&needle)
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Deserialize)]
struct WebSearchArgs {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    5
}

pub struct WebSearchTool {
    provider: Arc<dyn SearchProvider>,
}

impl WebSearchTool {
    pub fn new(provider: Arc<dyn SearchProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns titles, URLs and snippets; cite the URLs you rely on."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "limit": { "type": "integer", "description": "Max results (default 5)" }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn execution_phase(&self) -> ExecutionPhase {
        ExecutionPhase::Early
    }

    fn trace_step_type(&self) -> &str {
        "web_search"
    }

    fn format_trace_content(&self, input: &serde_json::Value, output: &ToolOutput) -> Option<String> {
        let query = input["query"].as_str().unwrap_or("?");
        Some(format!("searched \"{query}\" ({} results)", output.sources.len()))
    }

    async fn execute(&self, input: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let args: WebSearchArgs = serde_json::from_value(input)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let hits = self
            .provider
            .search(&args.query, args.limit.clamp(1, 10))
            .await
            .map_err(ToolError::Execution)?;

        if hits.is_empty() {
            return Ok(ToolOutput::text(format!(
                "No results for \"{}\".",
                args.query
            )));
        }

        let mut lines = Vec::with_capacity(hits.len());
        let mut sources = Vec::with_capacity(hits.len());
        for (i, hit) in hits.iter().enumerate() {
            lines.push(format!("{}. {} <{}>\n   {}", i + 1, hit.title, hit.url, hit.snippet));
            sources.push(SourceItem {
                url: hit.url.clone(),
                title: hit.title.clone(),
            });
        }

        Ok(ToolOutput::text(lines.join("\n")).with_sources(sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolContext;
    use companion_chat::{InMemoryAttachmentStore, InMemoryChatStore};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ToolContext {
        ToolContext {
            workspace_id: "ws".to_string(),
            stream_id: "s1".to_string(),
            session_id: "sess".to_string(),
            persona_id: "p1".to_string(),
            cancel: CancellationToken::new(),
            messages: Arc::new(InMemoryChatStore::new()),
            attachments: Arc::new(InMemoryAttachmentStore::new()),
        }
    }

    fn provider() -> Arc<StaticSearchProvider> {
        Arc::new(StaticSearchProvider {
            hits: vec![SearchHit {
                title: "Rust book".to_string(),
                url: "https://doc.rust-lang.org/book/".to_string(),
                snippet: "Learn Rust".to_string(),
            }],
        })
    }

    #[tokio::test]
    async fn search_returns_formatted_hits_and_sources() {
        let tool = WebSearchTool::new(provider());
        let output = tool
            .execute(json!({ "query": "rust" }), &ctx())
            .await
            .unwrap();
        assert!(output.output.contains("Rust book"));
        assert_eq!(output.sources.len(), 1);
        assert_eq!(output.sources[0].url, "https://doc.rust-lang.org/book/");
    }

    #[tokio::test]
    async fn missing_query_is_invalid_arguments() {
        let tool = WebSearchTool::new(provider());
        let error = tool.execute(json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(error, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn runs_in_early_phase() {
        let tool = WebSearchTool::new(provider());
        assert_eq!(tool.execution_phase(), ExecutionPhase::Early);
    }
}
