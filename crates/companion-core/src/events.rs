//! The strongly-typed trace event stream.
//!
//! Every observable moment of a session run is one of these. Observers
//! receive each event in emission order; the session-trace observer turns
//! them into step rows and realtime publishes, the metrics observer into
//! timing spans.

use serde::{Deserialize, Serialize};

use companion_chat::SourceItem;

/// Preview of a newly arrived message shown alongside a reconsidered draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconsideredDraft {
    pub draft: String,
    pub new_message_previews: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    pub tool_call_id: String,
    pub tool_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    SessionStart {
        session_id: String,
        stream_id: String,
        persona_id: String,
        trigger_message_id: String,
    },

    /// Model output before any commit: either free text or, when the model
    /// only emitted tool calls, a plan descriptor listing them.
    Thinking {
        session_id: String,
        content: String,
    },

    ToolStart {
        session_id: String,
        tool_call_id: String,
        tool_name: String,
        /// The tool-declared trace step type.
        step_type: String,
        arguments: serde_json::Value,
    },

    ToolComplete {
        session_id: String,
        tool_call_id: String,
        tool_name: String,
        elapsed_ms: u64,
        /// Tool-formatted trace content, not the raw output.
        content: Option<String>,
        sources: Vec<SourceItem>,
    },

    ToolError {
        session_id: String,
        #[serde(flatten)]
        info: ToolErrorInfo,
    },

    MessageSent {
        session_id: String,
        message_id: String,
        content: String,
        sources: Vec<SourceItem>,
    },

    MessageEdited {
        session_id: String,
        message_id: String,
        content: String,
    },

    /// The model explicitly chose to keep its previous response.
    ResponseKept {
        session_id: String,
        reason: String,
    },

    /// New user messages were folded into the running context.
    ContextReceived {
        session_id: String,
        message_count: usize,
        latest_sequence: i64,
    },

    /// A staged draft met newly arrived input; the model is re-deciding.
    Reconsidering {
        session_id: String,
        #[serde(flatten)]
        details: ReconsideredDraft,
    },

    SessionEnd {
        session_id: String,
        messages_sent: usize,
    },

    SessionError {
        session_id: String,
        error: String,
    },
}

impl TraceEvent {
    pub fn session_id(&self) -> &str {
        match self {
            TraceEvent::SessionStart { session_id, .. }
            | TraceEvent::Thinking { session_id, .. }
            | TraceEvent::ToolStart { session_id, .. }
            | TraceEvent::ToolComplete { session_id, .. }
            | TraceEvent::ToolError { session_id, .. }
            | TraceEvent::MessageSent { session_id, .. }
            | TraceEvent::MessageEdited { session_id, .. }
            | TraceEvent::ResponseKept { session_id, .. }
            | TraceEvent::ContextReceived { session_id, .. }
            | TraceEvent::Reconsidering { session_id, .. }
            | TraceEvent::SessionEnd { session_id, .. }
            | TraceEvent::SessionError { session_id, .. } => session_id,
        }
    }

    /// The step type recorded for this event, when it produces a step row.
    pub fn step_type(&self) -> Option<&'static str> {
        match self {
            TraceEvent::SessionStart { .. } => None,
            TraceEvent::Thinking { .. } => Some("thinking"),
            TraceEvent::ToolStart { .. } => None,
            TraceEvent::ToolComplete { .. } => Some("tool"),
            TraceEvent::ToolError { .. } => Some("tool_error"),
            TraceEvent::MessageSent { .. } => Some("message_sent"),
            TraceEvent::MessageEdited { .. } => Some("message_edited"),
            TraceEvent::ResponseKept { .. } => Some("response_kept"),
            TraceEvent::ContextReceived { .. } => Some("context_received"),
            TraceEvent::Reconsidering { .. } => Some("reconsidering"),
            TraceEvent::SessionEnd { .. } => None,
            TraceEvent::SessionError { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_with_snake_case_type() {
        let event = TraceEvent::Thinking {
            session_id: "sess-1".to_string(),
            content: "pondering".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "thinking");
        assert_eq!(json["session_id"], "sess-1");

        let event = TraceEvent::SessionStart {
            session_id: "sess-1".to_string(),
            stream_id: "s1".to_string(),
            persona_id: "p1".to_string(),
            trigger_message_id: "m1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_start");
    }

    #[test]
    fn session_id_accessor_covers_all_variants() {
        let event = TraceEvent::SessionEnd {
            session_id: "sess-9".to_string(),
            messages_sent: 1,
        };
        assert_eq!(event.session_id(), "sess-9");
    }
}
