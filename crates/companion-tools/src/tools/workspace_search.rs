//! Workspace message search.
//!
//! Early-phase research over prior workspace conversation. Besides the
//! visible result, it contributes retrieved context to the system prompt of
//! subsequent iterations so the model keeps what it found in view.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::tool::{ExecutionPhase, Result, Tool, ToolContext, ToolError, ToolOutput};

#[derive(Deserialize)]
struct WorkspaceSearchArgs {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    8
}

#[derive(Default)]
pub struct WorkspaceSearchTool;

impl WorkspaceSearchTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for WorkspaceSearchTool {
    fn name(&self) -> &str {
        "search_workspace_messages"
    }

    fn description(&self) -> &str {
        "Search earlier messages across this workspace for relevant discussion."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Text to look for" },
                "limit": { "type": "integer", "description": "Max matches (default 8)" }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn execution_phase(&self) -> ExecutionPhase {
        ExecutionPhase::Early
    }

    fn trace_step_type(&self) -> &str {
        "workspace_search"
    }

    fn format_trace_content(&self, input: &serde_json::Value, _output: &ToolOutput) -> Option<String> {
        input["query"]
            .as_str()
            .map(|q| format!("searched workspace for \"{q}\""))
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let args: WorkspaceSearchArgs = serde_json::from_value(input)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let hits = ctx
            .messages
            .search(&ctx.workspace_id, &args.query, args.limit.clamp(1, 25))
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        if hits.is_empty() {
            return Ok(ToolOutput::text(format!(
                "No workspace messages match \"{}\".",
                args.query
            )));
        }

        let lines: Vec<String> = hits
            .iter()
            .map(|m| {
                format!(
                    "[{}] {}: {}",
                    m.created_at.format("%Y-%m-%d %H:%M"),
                    m.author_id,
                    m.text()
                )
            })
            .collect();
        let rendered = lines.join("\n");

        let context = format!(
            "Relevant prior workspace discussion (query \"{}\"):\n{}",
            args.query, rendered
        );
        Ok(ToolOutput::text(rendered).with_system_context(context))
    }
}
