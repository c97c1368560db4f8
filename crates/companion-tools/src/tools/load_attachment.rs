//! Attachment loader.
//!
//! Attachments appear in context as text descriptors; this tool pulls the
//! real thing on demand - extracted text for documents, the image itself
//! (as a multimodal part next iteration) for pictures.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::tool::{Result, Tool, ToolContext, ToolError, ToolOutput};

#[derive(Deserialize)]
struct LoadAttachmentArgs {
    attachment_id: String,
}

#[derive(Default)]
pub struct LoadAttachmentTool;

impl LoadAttachmentTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for LoadAttachmentTool {
    fn name(&self) -> &str {
        "load_attachment"
    }

    fn description(&self) -> &str {
        "Load an attachment's full content: extracted text for documents, the image itself for images."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "attachment_id": { "type": "string", "description": "Id from the attachment descriptor" }
            },
            "required": ["attachment_id"],
            "additionalProperties": false
        })
    }

    fn trace_step_type(&self) -> &str {
        "load_attachment"
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let args: LoadAttachmentArgs = serde_json::from_value(input)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let attachment = ctx
            .attachments
            .find_by_id(&args.attachment_id)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?
            .ok_or_else(|| ToolError::Execution(format!(
                "attachment not found: {}",
                args.attachment_id
            )))?;

        if attachment.is_image() {
            return Ok(ToolOutput::text(format!(
                "Image '{}' ({}) attached below.",
                attachment.filename, attachment.mime
            ))
            .with_image(attachment.url.clone()));
        }

        match attachment.extracted_text {
            Some(text) if !text.is_empty() => Ok(ToolOutput::text(text)),
            _ => Ok(ToolOutput::text(format!(
                "No extracted text available for '{}' (status {:?}).",
                attachment.filename, attachment.status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use companion_chat::{Attachment, AttachmentStatus, InMemoryAttachmentStore, InMemoryChatStore};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx(attachments: Arc<InMemoryAttachmentStore>) -> ToolContext {
        ToolContext {
            workspace_id: "ws".to_string(),
            stream_id: "s1".to_string(),
            session_id: "sess".to_string(),
            persona_id: "p1".to_string(),
            cancel: CancellationToken::new(),
            messages: Arc::new(InMemoryChatStore::new()),
            attachments,
        }
    }

    fn attachment(mime: &str, text: Option<&str>) -> Attachment {
        Attachment {
            id: "att-1".to_string(),
            message_id: "msg-1".to_string(),
            filename: "thing".to_string(),
            mime: mime.to_string(),
            status: AttachmentStatus::Ready,
            caption: None,
            extracted_text: text.map(|t| t.to_string()),
            url: "https://files.example.com/att-1".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn image_attachment_yields_multimodal_output() {
        let store = Arc::new(InMemoryAttachmentStore::new());
        store.insert(attachment("image/png", None));

        let tool = LoadAttachmentTool::new();
        let output = tool
            .execute(json!({ "attachment_id": "att-1" }), &ctx(store))
            .await
            .unwrap();
        assert_eq!(output.multimodal.len(), 1);
        assert_eq!(output.multimodal[0].url, "https://files.example.com/att-1");
    }

    #[tokio::test]
    async fn document_attachment_yields_extracted_text() {
        let store = Arc::new(InMemoryAttachmentStore::new());
        store.insert(attachment("application/pdf", Some("full document text")));

        let tool = LoadAttachmentTool::new();
        let output = tool
            .execute(json!({ "attachment_id": "att-1" }), &ctx(store))
            .await
            .unwrap();
        assert_eq!(output.output, "full document text");
        assert!(output.multimodal.is_empty());
    }

    #[tokio::test]
    async fn unknown_attachment_is_an_execution_error() {
        let store = Arc::new(InMemoryAttachmentStore::new());
        let tool = LoadAttachmentTool::new();
        let error = tool
            .execute(json!({ "attachment_id": "nope" }), &ctx(store))
            .await
            .unwrap_err();
        assert!(matches!(error, ToolError::Execution(_)));
    }
}
