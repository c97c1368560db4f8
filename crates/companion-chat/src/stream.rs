//! Streams, workspaces, personas and authorship.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tenant boundary. Everything else hangs off a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// The kind of conversation surface a stream represents.
///
/// The context builder emits a different prompt section per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Scratchpad,
    Channel,
    Thread,
    Dm,
}

/// A conversation stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub stream_type: StreamType,
    /// When true, every human message triggers an automatic persona reply.
    pub companion_mode: bool,
    /// The persona that answers in companion mode.
    pub companion_persona_id: Option<String>,
    /// For threads: the channel the thread hangs off.
    pub parent_channel_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Stream {
    pub fn new(workspace_id: impl Into<String>, name: impl Into<String>, stream_type: StreamType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            stream_type,
            companion_mode: false,
            companion_persona_id: None,
            parent_channel_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_companion(mut self, persona_id: impl Into<String>) -> Self {
        self.companion_mode = true;
        self.companion_persona_id = Some(persona_id.into());
        self
    }
}

/// An AI persona that can respond in streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub workspace_id: String,
    /// Mentionable handle, e.g. `sage` for `@sage`.
    pub slug: String,
    pub display_name: String,
    pub active: bool,
    /// Persona-specific system prompt material.
    pub instructions: String,
    pub created_at: DateTime<Utc>,
}

impl Persona {
    pub fn new(
        workspace_id: impl Into<String>,
        slug: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            slug: slug.into(),
            display_name: display_name.into(),
            active: true,
            instructions: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorType {
    Human,
    Persona,
    System,
}

impl AuthorType {
    /// Persona and system messages never re-trigger dispatch.
    pub fn is_human(&self) -> bool {
        matches!(self, AuthorType::Human)
    }
}
