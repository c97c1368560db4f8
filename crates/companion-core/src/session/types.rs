//! The agent session row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionStatus, to: SessionStatus },

    #[error("storage error: {0}")]
    Storage(String),
}

/// What caused a session to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Companion,
    Mention,
}

/// Session lifecycle status.
///
/// Transitions form a DAG: `Pending -> Running -> {Completed, Failed}`,
/// with `Running -> Superseded` and `Running -> Deleted` permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Superseded,
    Deleted,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Superseded
                | SessionStatus::Deleted
        )
    }

    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, to) {
            (Pending, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Running, Superseded) | (Running, Deleted) => true,
            // Retry of a failed trigger re-enters running.
            (Failed, Running) => true,
            // Heartbeat and bookkeeping updates keep the same status.
            (a, b) if *a == b && !a.is_terminal() => true,
            _ => false,
        }
    }
}

/// One row per trigger message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: String,
    pub workspace_id: String,
    pub stream_id: String,
    pub persona_id: String,
    pub trigger_message_id: String,
    pub triggered_by: TriggeredBy,
    pub status: SessionStatus,
    /// Which worker process owns the run; useful when reaping orphans.
    pub server_id: String,
    pub heartbeat_at: DateTime<Utc>,
    /// Highest message sequence this session has absorbed. Monotonic.
    pub last_seen_sequence: i64,
    /// Messages committed by this session, in send order.
    pub sent_message_ids: Vec<String>,
    /// The primary response message, when one was sent.
    pub response_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl AgentSession {
    pub(crate) fn start(
        workspace_id: String,
        stream_id: String,
        persona_id: String,
        trigger_message_id: String,
        triggered_by: TriggeredBy,
        server_id: String,
        initial_sequence: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id,
            stream_id,
            persona_id,
            trigger_message_id,
            triggered_by,
            status: SessionStatus::Running,
            server_id,
            heartbeat_at: now,
            last_seen_sequence: initial_sequence,
            sent_message_ids: Vec::new(),
            response_message_id: None,
            created_at: now,
            completed_at: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_dag() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Superseded));
        assert!(Running.can_transition_to(Deleted));
        assert!(Failed.can_transition_to(Running));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Deleted.can_transition_to(Running));
        assert!(!Superseded.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Superseded.is_terminal());
        assert!(SessionStatus::Deleted.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
    }
}
