//! In-memory session and step store.
//!
//! A single mutex guards all rows so the conditional operations are atomic,
//! matching what a partial unique index plus conditional UPDATE gives a SQL
//! implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use companion_chat::SourceItem;

use super::step::AgentStep;
use super::store::{
    AcquireOutcome, CompletionUpdate, NewSession, Result, SessionStore, StepStore,
};
use super::types::{AgentSession, SessionStatus};

#[derive(Default)]
struct SessionState {
    sessions: HashMap<String, AgentSession>,
    /// session_id -> steps in insertion order.
    steps: HashMap<String, Vec<AgentStep>>,
}

#[derive(Default)]
pub struct InMemorySessionStore {
    state: Mutex<SessionState>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: overwrite a session's heartbeat timestamp.
    pub fn age_heartbeat(&self, session_id: &str, seconds: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.heartbeat_at = Utc::now() - Duration::seconds(seconds);
        }
    }

    fn transition(
        state: &mut SessionState,
        session_id: &str,
        to: SessionStatus,
        error: Option<String>,
    ) -> bool {
        let Some(session) = state.sessions.get_mut(session_id) else {
            return false;
        };
        if !session.status.can_transition_to(to) {
            return false;
        }
        session.status = to;
        session.error = error;
        if to.is_terminal() {
            session.completed_at = Some(Utc::now());
        }
        true
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn acquire_for_trigger(&self, new_session: NewSession) -> Result<AcquireOutcome> {
        let mut state = self.state.lock().unwrap();

        // Idempotence on the trigger message.
        let existing_id = state
            .sessions
            .values()
            .find(|s| s.trigger_message_id == new_session.trigger_message_id)
            .map(|s| s.id.clone());
        if let Some(id) = existing_id {
            let session = state.sessions.get_mut(&id).unwrap();
            return Ok(match session.status {
                SessionStatus::Completed => AcquireOutcome::Skipped {
                    reason: "already completed".to_string(),
                },
                SessionStatus::Superseded | SessionStatus::Deleted => AcquireOutcome::Skipped {
                    reason: format!("session {:?} for this trigger", session.status),
                },
                SessionStatus::Pending | SessionStatus::Running | SessionStatus::Failed => {
                    session.status = SessionStatus::Running;
                    session.server_id = new_session.server_id;
                    session.heartbeat_at = Utc::now();
                    session.completed_at = None;
                    session.error = None;
                    AcquireOutcome::Resumed(session.clone())
                }
            });
        }

        // The partial unique index: at most one running session per stream.
        let stream_busy = state
            .sessions
            .values()
            .any(|s| s.stream_id == new_session.stream_id && s.status == SessionStatus::Running);
        if stream_busy {
            return Ok(AcquireOutcome::Skipped {
                reason: "agent already running for stream".to_string(),
            });
        }

        let session = AgentSession::start(
            new_session.workspace_id,
            new_session.stream_id,
            new_session.persona_id,
            new_session.trigger_message_id,
            new_session.triggered_by,
            new_session.server_id,
            new_session.initial_sequence,
        );
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(AcquireOutcome::Started(session))
    }

    async fn heartbeat(&self, session_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.get_mut(session_id) {
            if session.status == SessionStatus::Running {
                session.heartbeat_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn bump_last_seen(&self, session_id: &str, sequence: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.get_mut(session_id) {
            if sequence > session.last_seen_sequence {
                session.last_seen_sequence = sequence;
            }
        }
        Ok(())
    }

    async fn append_sent_message(&self, session_id: &str, message_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.sent_message_ids.push(message_id.to_string());
        }
        Ok(())
    }

    async fn complete(&self, session_id: &str, update: CompletionUpdate) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(session) = state.sessions.get_mut(session_id) else {
            return Ok(false);
        };
        if session.status != SessionStatus::Running {
            return Ok(false);
        }
        session.status = SessionStatus::Completed;
        if update.last_seen_sequence > session.last_seen_sequence {
            session.last_seen_sequence = update.last_seen_sequence;
        }
        session.response_message_id = update.response_message_id;
        session.sent_message_ids = update.sent_message_ids;
        session.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn fail(&self, session_id: &str, error: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::transition(
            &mut state,
            session_id,
            SessionStatus::Failed,
            Some(error.to_string()),
        ))
    }

    async fn supersede(&self, session_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::transition(
            &mut state,
            session_id,
            SessionStatus::Superseded,
            None,
        ))
    }

    async fn mark_deleted(&self, session_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::transition(
            &mut state,
            session_id,
            SessionStatus::Deleted,
            None,
        ))
    }

    async fn find_by_id(&self, session_id: &str) -> Result<Option<AgentSession>> {
        let state = self.state.lock().unwrap();
        Ok(state.sessions.get(session_id).cloned())
    }

    async fn find_by_trigger(&self, trigger_message_id: &str) -> Result<Option<AgentSession>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .values()
            .find(|s| s.trigger_message_id == trigger_message_id)
            .cloned())
    }

    async fn find_running_for_stream(&self, stream_id: &str) -> Result<Option<AgentSession>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .values()
            .find(|s| s.stream_id == stream_id && s.status == SessionStatus::Running)
            .cloned())
    }

    async fn find_latest_for_stream(
        &self,
        stream_id: &str,
        persona_id: &str,
    ) -> Result<Option<AgentSession>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .values()
            .filter(|s| s.stream_id == stream_id && s.persona_id == persona_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn find_stale_running(&self, stale_after_secs: i64) -> Result<Vec<AgentSession>> {
        let cutoff = Utc::now() - Duration::seconds(stale_after_secs);
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Running && s.heartbeat_at < cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StepStore for InMemorySessionStore {
    async fn begin_step(
        &self,
        session_id: &str,
        step_type: &str,
        content: Option<String>,
        sources: Vec<SourceItem>,
        message_id: Option<String>,
    ) -> Result<AgentStep> {
        let mut state = self.state.lock().unwrap();
        let steps = state.steps.entry(session_id.to_string()).or_default();
        let step = AgentStep {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            step_number: steps.len() as u32 + 1,
            step_type: step_type.to_string(),
            content,
            sources,
            message_id,
            started_at: Utc::now(),
            completed_at: None,
        };
        steps.push(step.clone());
        Ok(step)
    }

    async fn complete_step(
        &self,
        step_id: &str,
        content: Option<String>,
        sources: Vec<SourceItem>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for steps in state.steps.values_mut() {
            if let Some(step) = steps.iter_mut().find(|s| s.id == step_id) {
                step.completed_at = Some(Utc::now());
                if content.is_some() {
                    step.content = content;
                }
                if !sources.is_empty() {
                    step.sources = sources;
                }
                return Ok(());
            }
        }
        Ok(())
    }

    async fn list_steps(&self, session_id: &str) -> Result<Vec<AgentStep>> {
        let state = self.state.lock().unwrap();
        Ok(state.steps.get(session_id).cloned().unwrap_or_default())
    }
}
