//! The send_message tool.
//!
//! Never executed directly: the agent loop intercepts calls to this name
//! and stages the content as a pending message so it can be reconsidered if
//! new user input lands before commit. The `execute` body exists only as a
//! backstop for a misconfigured loop.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use companion_chat::SourceItem;

use crate::tool::{Result, Tool, ToolContext, ToolError, ToolOutput};

/// Parsed arguments of a staged send_message call.
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageArgs {
    pub content: String,
    #[serde(default)]
    pub sources: Vec<SourceItem>,
}

impl SendMessageArgs {
    pub fn parse(input: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(input.clone())
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))
    }
}

#[derive(Default)]
pub struct SendMessageTool;

impl SendMessageTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        crate::SEND_MESSAGE_TOOL
    }

    fn description(&self) -> &str {
        "Send your reply to the conversation. The message is staged and \
         committed once you are done; you may call this more than once for \
         a multi-part reply."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Markdown message body" },
                "sources": {
                    "type": "array",
                    "description": "Citations backing the message",
                    "items": {
                        "type": "object",
                        "properties": {
                            "url": { "type": "string" },
                            "title": { "type": "string" }
                        },
                        "required": ["url", "title"]
                    }
                }
            },
            "required": ["content"],
            "additionalProperties": false
        })
    }

    fn trace_step_type(&self) -> &str {
        "message_sent"
    }

    async fn execute(&self, input: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        // Interception happens upstream; validate and acknowledge staging.
        let _ = SendMessageArgs::parse(&input)?;
        Ok(ToolOutput::text(
            json!({ "status": "pending", "message": "staged for delivery" }).to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_content_and_optional_sources() {
        let args = SendMessageArgs::parse(&json!({ "content": "hi" })).unwrap();
        assert_eq!(args.content, "hi");
        assert!(args.sources.is_empty());

        let args = SendMessageArgs::parse(&json!({
            "content": "cited",
            "sources": [{ "url": "https://x", "title": "X" }]
        }))
        .unwrap();
        assert_eq!(args.sources.len(), 1);
    }

    #[test]
    fn parse_rejects_missing_content() {
        assert!(SendMessageArgs::parse(&json!({})).is_err());
    }
}
