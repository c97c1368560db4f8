//! Commit and validation hooks.
//!
//! The loop never writes chat messages itself; it hands staged content to a
//! `CommitMessage` hook. The default implementation writes through the
//! message store; tests substitute their own.

use std::sync::Arc;

use async_trait::async_trait;

use companion_chat::{
    AuthorType, MessageOperation, MessageStore, NewMessage, SourceItem,
};

/// Result of committing one staged message.
#[derive(Debug, Clone)]
pub struct CommittedMessage {
    pub message_id: String,
    pub sequence: i64,
    pub operation: MessageOperation,
}

#[async_trait]
pub trait CommitMessage: Send + Sync {
    async fn commit(
        &self,
        content: &str,
        sources: &[SourceItem],
    ) -> Result<CommittedMessage, String>;
}

/// Optional gate in front of every commit. `None` accepts; `Some(reason)`
/// sends the loop back for a revision.
#[async_trait]
pub trait ResponseValidator: Send + Sync {
    async fn validate(&self, content: &str) -> Option<String>;
}

/// Default committer: persona-authored message into the message store.
pub struct StoreCommitter {
    messages: Arc<dyn MessageStore>,
    workspace_id: String,
    stream_id: String,
    persona_id: String,
    session_id: String,
}

impl StoreCommitter {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        workspace_id: impl Into<String>,
        stream_id: impl Into<String>,
        persona_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            messages,
            workspace_id: workspace_id.into(),
            stream_id: stream_id.into(),
            persona_id: persona_id.into(),
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
impl CommitMessage for StoreCommitter {
    async fn commit(
        &self,
        content: &str,
        sources: &[SourceItem],
    ) -> Result<CommittedMessage, String> {
        let created = self
            .messages
            .create_message(NewMessage {
                workspace_id: self.workspace_id.clone(),
                stream_id: self.stream_id.clone(),
                author_id: self.persona_id.clone(),
                author_type: AuthorType::Persona,
                content: content.into(),
                sources: sources.to_vec(),
                session_id: Some(self.session_id.clone()),
            })
            .await
            .map_err(|e| e.to_string())?;
        Ok(CommittedMessage {
            message_id: created.id,
            sequence: created.sequence,
            operation: created.operation,
        })
    }
}
