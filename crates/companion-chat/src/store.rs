//! Storage collaborator contracts.
//!
//! The runtime never talks to a database directly; it consumes these traits.
//! `memory` provides the reference implementations used by the worker's
//! default wiring and by tests.

use async_trait::async_trait;
use thiserror::Error;

use crate::attachment::Attachment;
use crate::message::{ChatMessage, CreatedMessage, NewMessage};
use crate::stream::{AuthorType, Persona, Stream};

#[derive(Error, Debug)]
pub enum ChatStoreError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("attachment processing timed out for: {0:?}")]
    AttachmentTimeout(Vec<String>),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, ChatStoreError>;

/// Options for `MessageStore::list`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub limit: usize,
    /// Only messages with `sequence < before_sequence`.
    pub before_sequence: Option<i64>,
}

/// Message persistence collaborator.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Most recent messages first capped at `limit`, returned oldest-first.
    async fn list(&self, stream_id: &str, opts: ListOptions) -> Result<Vec<ChatMessage>>;

    /// Messages with `sequence > since_sequence`, oldest-first, optionally
    /// excluding a single author (the persona checking for new user input).
    async fn list_since(
        &self,
        stream_id: &str,
        since_sequence: i64,
        exclude_author: Option<&str>,
    ) -> Result<Vec<ChatMessage>>;

    /// Messages with sequence in `[from, to]` inclusive, oldest-first.
    async fn list_by_sequence_range(
        &self,
        stream_id: &str,
        from: i64,
        to: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>>;

    async fn find_by_id(&self, message_id: &str) -> Result<Option<ChatMessage>>;

    async fn find_by_ids(&self, message_ids: &[String]) -> Result<Vec<ChatMessage>>;

    /// Commit a message. The store assigns id and sequence and reports
    /// whether the commit created or edited.
    async fn create_message(&self, message: NewMessage) -> Result<CreatedMessage>;

    /// Case-insensitive substring scan over recent history. Used by the
    /// workspace research tool; newest matches first.
    async fn search(
        &self,
        workspace_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>>;
}

/// Attachment persistence collaborator.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn find_by_message_id(&self, message_id: &str) -> Result<Vec<Attachment>>;

    async fn find_by_message_ids(&self, message_ids: &[String]) -> Result<Vec<Attachment>>;

    async fn find_by_id(&self, attachment_id: &str) -> Result<Option<Attachment>>;

    /// Block until every attachment is in a terminal extraction state.
    /// Implementations poll with a bounded deadline and fail with
    /// `AttachmentTimeout` listing the unsettled ids.
    async fn await_processing(&self, attachment_ids: &[String]) -> Result<Vec<Attachment>>;
}

/// Directory lookups for streams and personas.
#[async_trait]
pub trait StreamDirectory: Send + Sync {
    async fn find_stream(&self, stream_id: &str) -> Result<Option<Stream>>;

    async fn find_persona(&self, persona_id: &str) -> Result<Option<Persona>>;

    async fn find_persona_by_slug(&self, workspace_id: &str, slug: &str)
        -> Result<Option<Persona>>;

    async fn author_type(&self, workspace_id: &str, author_id: &str) -> Result<AuthorType>;
}
