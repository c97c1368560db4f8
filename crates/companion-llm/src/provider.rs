//! Provider contract.

use async_trait::async_trait;
use thiserror::Error;

use companion_core::{Message, ToolCallRequest, ToolSchema};

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("empty completion")]
    EmptyCompletion,

    #[error("object generation failed: {0}")]
    ObjectGeneration(String),
}

pub type Result<T> = std::result::Result<T, LlmError>;

/// One tool-calling generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
}

/// The provider's answer: free text, requested tool calls, and the
/// provider-shaped messages to splice back into history.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    /// Assistant (and tool-call) messages as the provider emitted them.
    pub messages: Vec<Message>,
}

impl Generation {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run one tool-calling completion.
    async fn generate_with_tools(&self, request: GenerateRequest) -> Result<Generation>;

    /// Generate a JSON object conforming to `schema`. Implementations make
    /// one repair attempt when the first completion fails to parse.
    async fn generate_object(
        &self,
        model: &str,
        schema: &serde_json::Value,
        prompt: &str,
        temperature: f32,
    ) -> Result<serde_json::Value>;
}
