//! The keep_response tool.
//!
//! Only registered when the loop allows a no-message outcome (supersede
//! reruns). Like send_message it is intercepted, not executed: the loop
//! records the reason and finishes without committing anything.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::tool::{Result, Tool, ToolContext, ToolError, ToolOutput};

#[derive(Debug, Clone, Deserialize)]
pub struct KeepResponseArgs {
    pub reason: String,
}

impl KeepResponseArgs {
    pub fn parse(input: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(input.clone())
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))
    }
}

#[derive(Default)]
pub struct KeepResponseTool;

impl KeepResponseTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for KeepResponseTool {
    fn name(&self) -> &str {
        crate::KEEP_RESPONSE_TOOL
    }

    fn description(&self) -> &str {
        "Keep your previously sent response unchanged instead of sending a new message. \
         Use when the existing reply already covers the latest context."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "reason": { "type": "string", "description": "Why the existing response still stands" }
            },
            "required": ["reason"],
            "additionalProperties": false
        })
    }

    fn trace_step_type(&self) -> &str {
        "response_kept"
    }

    async fn execute(&self, input: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let _ = KeepResponseArgs::parse(&input)?;
        Ok(ToolOutput::text(
            json!({ "status": "kept" }).to_string(),
        ))
    }
}
