//! The uniform tool contract.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use companion_chat::{AttachmentStore, MessageStore, SourceItem};
use companion_core::ToolSchema;

#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ToolError>;

/// When in an iteration's batch the tool runs. Early tools (search,
/// research prefetch) seed sources and system context for the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Early,
    Normal,
}

/// An image the tool wants shown to the model next iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

/// What a tool hands back to the loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOutput {
    /// What the model sees (after trust-boundary wrapping).
    pub output: String,
    /// Images injected as a fresh user-role message next iteration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub multimodal: Vec<ImageRef>,
    /// Citations accumulated into the session's source set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceItem>,
    /// Appended to the system prompt of subsequent iterations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_context: Option<String>,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn with_sources(mut self, sources: Vec<SourceItem>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_system_context(mut self, context: impl Into<String>) -> Self {
        self.system_context = Some(context.into());
        self
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.multimodal.push(ImageRef { url: url.into() });
        self
    }
}

/// Per-invocation context handed to every tool.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace_id: String,
    pub stream_id: String,
    pub session_id: String,
    pub persona_id: String,
    pub cancel: CancellationToken,
    pub messages: Arc<dyn MessageStore>,
    pub attachments: Arc<dyn AttachmentStore>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> serde_json::Value;

    fn execution_phase(&self) -> ExecutionPhase {
        ExecutionPhase::Normal
    }

    /// Step type recorded in the session trace for this tool.
    fn trace_step_type(&self) -> &str {
        "tool"
    }

    /// Trace-facing rendering of the invocation. Defaults to the first
    /// line of the output.
    fn format_trace_content(&self, _input: &serde_json::Value, output: &ToolOutput) -> Option<String> {
        output.output.lines().next().map(|line| line.to_string())
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput>;

    fn to_schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

pub type SharedTool = Arc<dyn Tool>;
