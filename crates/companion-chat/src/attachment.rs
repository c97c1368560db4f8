//! Attachments and their extraction lifecycle.
//!
//! Attachments are owned by the chat storage layer; the runtime only waits
//! for extraction to settle and reads the resulting descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Extraction state of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl AttachmentStatus {
    /// Terminal states stop the context builder's wait loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttachmentStatus::Ready | AttachmentStatus::Failed)
    }
}

/// A file attached to a chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub filename: String,
    pub mime: String,
    pub status: AttachmentStatus,
    /// Short generated caption, available once extraction is done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Full extracted text for document attachments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    /// Fetchable location of the raw blob (images are loaded on demand).
    pub url: String,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }

    /// One-line descriptor surfaced to the model in place of the blob.
    pub fn descriptor(&self) -> String {
        let mut parts = vec![format!("{} ({})", self.filename, self.mime)];
        if let Some(caption) = &self.caption {
            parts.push(caption.clone());
        }
        match self.status {
            AttachmentStatus::Ready => {}
            AttachmentStatus::Failed => parts.push("extraction failed".to_string()),
            _ => parts.push("still processing".to_string()),
        }
        parts.join(" - ")
    }
}
