//! Session-scoped trace steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use companion_chat::SourceItem;

/// One trace entry within a session.
///
/// `step_number` is assigned by the store, 1-based and strictly increasing
/// per session. Steps are inserted at event time and completed by update;
/// they live as long as the session does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub id: String,
    pub session_id: String,
    pub step_number: u32,
    /// What kind of step this is: `thinking`, `message_sent`,
    /// `reconsidering`, or a tool-declared trace type.
    pub step_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceItem>,
    /// Set when the step produced or refers to a chat message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
