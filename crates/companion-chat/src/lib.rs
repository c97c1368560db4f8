//! companion-chat - Chat domain types and storage collaborator contracts
//!
//! This crate provides the foundational chat types used across the companion
//! runtime:
//! - `stream` - Workspaces, streams, personas, authorship
//! - `message` - Chat messages and polymorphic content
//! - `attachment` - Attachments and their extraction lifecycle
//! - `store` - Collaborator traits the runtime consumes (messages,
//!   attachments, directory lookups, realtime fanout)
//! - `memory` - In-memory reference implementations of the collaborators

pub mod attachment;
pub mod memory;
pub mod message;
pub mod realtime;
pub mod store;
pub mod stream;

pub use attachment::{Attachment, AttachmentStatus};
pub use memory::{InMemoryAttachmentStore, InMemoryChatStore};
pub use message::{
    ChatMessage, Content, ContentPart, CreatedMessage, MessageOperation, NewMessage, SourceItem,
};
pub use realtime::{channel_room, session_room, stream_room, NullRealtimeBus, RealtimeBus};
pub use store::{AttachmentStore, ChatStoreError, ListOptions, MessageStore, StreamDirectory};
pub use stream::{AuthorType, Persona, Stream, StreamType, Workspace};
