//! Chat messages and their polymorphic content.

mod content;

pub use content::{Content, ContentPart};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::AuthorType;

/// A citation accumulated by tools and attached to agent replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub url: String,
    pub title: String,
}

/// A committed chat message.
///
/// `sequence` is assigned by the message store, strictly increasing per
/// stream. The agent runtime's new-context checks compare against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub workspace_id: String,
    pub stream_id: String,
    pub author_id: String,
    pub author_type: AuthorType,
    pub sequence: i64,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceItem>,
    /// Set on persona messages created by an agent session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Plain markdown text of the message, images elided.
    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

/// Input to `MessageStore::create_message`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub workspace_id: String,
    pub stream_id: String,
    pub author_id: String,
    pub author_type: AuthorType,
    pub content: Content,
    pub sources: Vec<SourceItem>,
    pub session_id: Option<String>,
}

/// Whether a commit created a fresh message or edited an existing one.
///
/// The store may coalesce rapid successive persona messages into an edit;
/// the runtime only needs to know which happened to emit the right event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOperation {
    Created,
    Edited,
}

/// Result of committing a message.
#[derive(Debug, Clone)]
pub struct CreatedMessage {
    pub id: String,
    pub sequence: i64,
    pub operation: MessageOperation,
}
