//! The generic LLM-facing message shape.
//!
//! Distinct from `companion_chat::ChatMessage`: this is the transient,
//! provider-neutral history the agent loop feeds to the model. The context
//! builder converts committed chat messages into these.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use companion_chat::{Content, ContentPart};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The projection of a tool the model sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn system(content: impl Into<Content>) -> Self {
        Self::with_role(Role::System, content.into())
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<Content>, tool_calls: Option<Vec<ToolCallRequest>>) -> Self {
        let mut message = Self::with_role(Role::Assistant, content.into());
        message.tool_calls = tool_calls;
        message
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<Content>) -> Self {
        let mut message = Self::with_role(Role::Tool, content.into());
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    /// A user-role message carrying image parts, used to surface a tool's
    /// multimodal output in the next iteration.
    pub fn user_images(urls: impl IntoIterator<Item = String>) -> Self {
        let parts = urls.into_iter().map(ContentPart::image_url).collect();
        Self::with_role(Role::User, Content::Multipart(parts))
    }

    fn with_role(role: Role, content: Content) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a", None).role, Role::Assistant);
        let tool = Message::tool_result("call-1", "out");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn user_images_builds_multipart() {
        let message = Message::user_images(vec!["https://x/a.png".to_string()]);
        assert!(message.content.has_images());
    }
}
