//! In-memory reference implementations of the chat collaborators.
//!
//! Sequence assignment and edit-coalescing match the contracts the runtime
//! relies on, so these double as the fixtures for every scenario test.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::attachment::{Attachment, AttachmentStatus};
use crate::message::{ChatMessage, CreatedMessage, MessageOperation, NewMessage};
use crate::store::{
    AttachmentStore, ChatStoreError, ListOptions, MessageStore, Result, StreamDirectory,
};
use crate::stream::{AuthorType, Persona, Stream};

#[derive(Default)]
struct ChatState {
    streams: HashMap<String, Stream>,
    personas: HashMap<String, Persona>,
    /// author_id -> type, for actor classification during dispatch.
    authors: HashMap<String, AuthorType>,
    /// stream_id -> ordered messages.
    messages: HashMap<String, Vec<ChatMessage>>,
    /// stream_id -> next sequence.
    next_sequence: HashMap<String, i64>,
}

/// In-memory message store plus directory.
#[derive(Default)]
pub struct InMemoryChatStore {
    state: Mutex<ChatState>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_stream(&self, stream: Stream) {
        let mut state = self.state.lock().unwrap();
        state.streams.insert(stream.id.clone(), stream);
    }

    pub fn insert_persona(&self, persona: Persona) {
        let mut state = self.state.lock().unwrap();
        state.authors.insert(persona.id.clone(), AuthorType::Persona);
        state.personas.insert(persona.id.clone(), persona);
    }

    pub fn insert_author(&self, author_id: impl Into<String>, author_type: AuthorType) {
        let mut state = self.state.lock().unwrap();
        state.authors.insert(author_id.into(), author_type);
    }

    /// Test convenience: commit a human message and return it.
    pub fn push_human_message(
        &self,
        workspace_id: &str,
        stream_id: &str,
        author_id: &str,
        text: &str,
    ) -> ChatMessage {
        let mut state = self.state.lock().unwrap();
        state.authors.insert(author_id.to_string(), AuthorType::Human);
        Self::commit_locked(
            &mut state,
            NewMessage {
                workspace_id: workspace_id.to_string(),
                stream_id: stream_id.to_string(),
                author_id: author_id.to_string(),
                author_type: AuthorType::Human,
                content: text.into(),
                sources: Vec::new(),
                session_id: None,
            },
        )
        .1
    }

    fn commit_locked(state: &mut ChatState, message: NewMessage) -> (CreatedMessage, ChatMessage) {
        let sequence = {
            let next = state
                .next_sequence
                .entry(message.stream_id.clone())
                .or_insert(1);
            let assigned = *next;
            *next += 1;
            assigned
        };
        let committed = ChatMessage {
            id: Uuid::new_v4().to_string(),
            workspace_id: message.workspace_id,
            stream_id: message.stream_id.clone(),
            author_id: message.author_id,
            author_type: message.author_type,
            sequence,
            content: message.content,
            sources: message.sources,
            session_id: message.session_id,
            created_at: Utc::now(),
        };
        state
            .messages
            .entry(message.stream_id)
            .or_default()
            .push(committed.clone());
        (
            CreatedMessage {
                id: committed.id.clone(),
                sequence,
                operation: MessageOperation::Created,
            },
            committed,
        )
    }
}

#[async_trait]
impl MessageStore for InMemoryChatStore {
    async fn list(&self, stream_id: &str, opts: ListOptions) -> Result<Vec<ChatMessage>> {
        let state = self.state.lock().unwrap();
        let messages = state.messages.get(stream_id).cloned().unwrap_or_default();
        let mut filtered: Vec<ChatMessage> = messages
            .into_iter()
            .filter(|m| opts.before_sequence.is_none_or(|b| m.sequence < b))
            .collect();
        if opts.limit > 0 && filtered.len() > opts.limit {
            filtered = filtered.split_off(filtered.len() - opts.limit);
        }
        Ok(filtered)
    }

    async fn list_since(
        &self,
        stream_id: &str,
        since_sequence: i64,
        exclude_author: Option<&str>,
    ) -> Result<Vec<ChatMessage>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .get(stream_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.sequence > since_sequence)
                    .filter(|m| exclude_author.is_none_or(|a| m.author_id != a))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_by_sequence_range(
        &self,
        stream_id: &str,
        from: i64,
        to: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .get(stream_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.sequence >= from && m.sequence <= to)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_by_id(&self, message_id: &str) -> Result<Option<ChatMessage>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .values()
            .flatten()
            .find(|m| m.id == message_id)
            .cloned())
    }

    async fn find_by_ids(&self, message_ids: &[String]) -> Result<Vec<ChatMessage>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .values()
            .flatten()
            .filter(|m| message_ids.contains(&m.id))
            .cloned()
            .collect())
    }

    async fn create_message(&self, message: NewMessage) -> Result<CreatedMessage> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::commit_locked(&mut state, message).0)
    }

    async fn search(
        &self,
        workspace_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let needle = query.to_lowercase();
        let state = self.state.lock().unwrap();
        let mut hits: Vec<ChatMessage> = state
            .messages
            .values()
            .flatten()
            .filter(|m| m.workspace_id == workspace_id)
            .filter(|m| m.text().to_lowercase().contains(&needle))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        hits.truncate(limit);
        Ok(hits)
    }
}

#[async_trait]
impl StreamDirectory for InMemoryChatStore {
    async fn find_stream(&self, stream_id: &str) -> Result<Option<Stream>> {
        let state = self.state.lock().unwrap();
        Ok(state.streams.get(stream_id).cloned())
    }

    async fn find_persona(&self, persona_id: &str) -> Result<Option<Persona>> {
        let state = self.state.lock().unwrap();
        Ok(state.personas.get(persona_id).cloned())
    }

    async fn find_persona_by_slug(
        &self,
        workspace_id: &str,
        slug: &str,
    ) -> Result<Option<Persona>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .personas
            .values()
            .find(|p| p.workspace_id == workspace_id && p.slug == slug)
            .cloned())
    }

    async fn author_type(&self, _workspace_id: &str, author_id: &str) -> Result<AuthorType> {
        let state = self.state.lock().unwrap();
        Ok(state
            .authors
            .get(author_id)
            .copied()
            .unwrap_or(AuthorType::Human))
    }
}

/// In-memory attachment store with a polling `await_processing`.
pub struct InMemoryAttachmentStore {
    attachments: Mutex<HashMap<String, Attachment>>,
    poll_interval: Duration,
    poll_deadline: Duration,
}

impl Default for InMemoryAttachmentStore {
    fn default() -> Self {
        Self {
            attachments: Mutex::new(HashMap::new()),
            poll_interval: Duration::from_millis(25),
            poll_deadline: Duration::from_secs(30),
        }
    }
}

impl InMemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll(mut self, interval: Duration, deadline: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_deadline = deadline;
        self
    }

    pub fn insert(&self, attachment: Attachment) {
        let mut attachments = self.attachments.lock().unwrap();
        attachments.insert(attachment.id.clone(), attachment);
    }

    pub fn set_status(&self, attachment_id: &str, status: AttachmentStatus) {
        let mut attachments = self.attachments.lock().unwrap();
        if let Some(attachment) = attachments.get_mut(attachment_id) {
            attachment.status = status;
        }
    }
}

#[async_trait]
impl AttachmentStore for InMemoryAttachmentStore {
    async fn find_by_message_id(&self, message_id: &str) -> Result<Vec<Attachment>> {
        let attachments = self.attachments.lock().unwrap();
        Ok(attachments
            .values()
            .filter(|a| a.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn find_by_message_ids(&self, message_ids: &[String]) -> Result<Vec<Attachment>> {
        let attachments = self.attachments.lock().unwrap();
        Ok(attachments
            .values()
            .filter(|a| message_ids.contains(&a.message_id))
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, attachment_id: &str) -> Result<Option<Attachment>> {
        let attachments = self.attachments.lock().unwrap();
        Ok(attachments.get(attachment_id).cloned())
    }

    async fn await_processing(&self, attachment_ids: &[String]) -> Result<Vec<Attachment>> {
        let deadline = tokio::time::Instant::now() + self.poll_deadline;
        loop {
            let (settled, pending): (Vec<Attachment>, Vec<String>) = {
                let attachments = self.attachments.lock().unwrap();
                let mut settled = Vec::new();
                let mut pending = Vec::new();
                for id in attachment_ids {
                    match attachments.get(id) {
                        Some(a) if a.status.is_terminal() => settled.push(a.clone()),
                        Some(a) => pending.push(a.id.clone()),
                        // Unknown ids are treated as settled-absent rather
                        // than blocking forever.
                        None => {}
                    }
                }
                (settled, pending)
            };

            if pending.is_empty() {
                return Ok(settled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChatStoreError::AttachmentTimeout(pending));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
