//! Session and step store contracts.
//!
//! Every operation that guards an invariant is specified as a single atomic
//! step: implementations back them with one conditional statement (or one
//! locked critical section), never a read-then-write across await points.

use async_trait::async_trait;

use companion_chat::SourceItem;

use super::step::AgentStep;
use super::types::{AgentSession, SessionError, TriggeredBy};

pub type Result<T> = std::result::Result<T, SessionError>;

/// Input to `SessionStore::acquire_for_trigger`.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub workspace_id: String,
    pub stream_id: String,
    pub persona_id: String,
    pub trigger_message_id: String,
    pub triggered_by: TriggeredBy,
    pub server_id: String,
    /// Sequence of the trigger message; seeds `last_seen_sequence`.
    pub initial_sequence: i64,
}

/// Result of the acquire phase.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// A fresh session was inserted with status running.
    Started(AgentSession),
    /// An existing non-terminal (or failed) session for this trigger was
    /// flipped back to running.
    Resumed(AgentSession),
    /// Nothing to do; the reason is surfaced in the run outcome.
    Skipped { reason: String },
}

/// Terminal bookkeeping written by the completion phase.
#[derive(Debug, Clone, Default)]
pub struct CompletionUpdate {
    pub last_seen_sequence: i64,
    pub response_message_id: Option<String>,
    pub sent_message_ids: Vec<String>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Phase-1 acquire: idempotent per trigger message, and conditional on
    /// the single-running-per-stream invariant. Returns `Skipped` both for
    /// already-terminal triggers and for a busy stream.
    async fn acquire_for_trigger(&self, new_session: NewSession) -> Result<AcquireOutcome>;

    /// Touch `heartbeat_at`. A no-op (Ok) if the session is no longer running.
    async fn heartbeat(&self, session_id: &str) -> Result<()>;

    /// Raise `last_seen_sequence` to `sequence` if higher. Never regresses.
    async fn bump_last_seen(&self, session_id: &str, sequence: i64) -> Result<()>;

    async fn append_sent_message(&self, session_id: &str, message_id: &str) -> Result<()>;

    /// Conditional completion: returns false when the session was meanwhile
    /// superseded or deleted, in which case the caller downgrades to a skip.
    async fn complete(&self, session_id: &str, update: CompletionUpdate) -> Result<bool>;

    /// Conditional failure; false when the session already left running.
    async fn fail(&self, session_id: &str, error: &str) -> Result<bool>;

    async fn supersede(&self, session_id: &str) -> Result<bool>;

    async fn mark_deleted(&self, session_id: &str) -> Result<bool>;

    async fn find_by_id(&self, session_id: &str) -> Result<Option<AgentSession>>;

    async fn find_by_trigger(&self, trigger_message_id: &str) -> Result<Option<AgentSession>>;

    async fn find_running_for_stream(&self, stream_id: &str) -> Result<Option<AgentSession>>;

    /// Most recent session for a (stream, persona) in any status. The
    /// dispatcher's absorbed-turn check reads `last_seen_sequence` off it.
    async fn find_latest_for_stream(
        &self,
        stream_id: &str,
        persona_id: &str,
    ) -> Result<Option<AgentSession>>;

    /// Running sessions whose heartbeat is older than `stale_after` seconds.
    async fn find_stale_running(&self, stale_after_secs: i64) -> Result<Vec<AgentSession>>;
}

#[async_trait]
pub trait StepStore: Send + Sync {
    /// Insert a step with the next strictly-increasing step number.
    async fn begin_step(
        &self,
        session_id: &str,
        step_type: &str,
        content: Option<String>,
        sources: Vec<SourceItem>,
        message_id: Option<String>,
    ) -> Result<AgentStep>;

    /// Mark a step finished, optionally attaching content and sources that
    /// only became known at completion (tool results).
    async fn complete_step(
        &self,
        step_id: &str,
        content: Option<String>,
        sources: Vec<SourceItem>,
    ) -> Result<()>;

    async fn list_steps(&self, session_id: &str) -> Result<Vec<AgentStep>>;
}
