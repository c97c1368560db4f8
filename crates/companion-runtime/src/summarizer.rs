//! LLM-backed rolling summarizer.
//!
//! Folds a batch of dropped messages into the existing summary through the
//! provider's constrained-object call.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use companion_chat::ChatMessage;
use companion_core::{SummaryError, Summarizer};
use companion_llm::LlmProvider;

pub struct LlmSummarizer {
    llm: Arc<dyn LlmProvider>,
    model: String,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        existing: Option<&str>,
        batch: &[ChatMessage],
    ) -> Result<String, SummaryError> {
        let schema = json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "Updated running summary of the conversation"
                }
            },
            "required": ["summary"]
        });

        let rendered: Vec<String> = batch
            .iter()
            .map(|m| {
                format!(
                    "[{}] {}: {}",
                    m.created_at.format("%Y-%m-%d %H:%M"),
                    m.author_id,
                    m.text()
                )
            })
            .collect();
        let prompt = format!(
            "You maintain a running summary of a chat conversation.\n\
             Current summary:\n{}\n\n\
             Fold in these older messages, keeping names, decisions and open \
             questions. Stay under 6000 characters.\n\n{}",
            existing.unwrap_or("(none yet)"),
            rendered.join("\n")
        );

        let value = self
            .llm
            .generate_object(&self.model, &schema, &prompt, 0.2)
            .await
            .map_err(|e| SummaryError::Summarize(e.to_string()))?;

        value["summary"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| SummaryError::Summarize("missing summary field".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_llm::ScriptedProvider;

    #[tokio::test]
    async fn extracts_summary_field_from_object() {
        let provider = Arc::new(ScriptedProvider::new([]));
        provider.push_object(json!({ "summary": "folded history" }));
        let summarizer = LlmSummarizer::new(provider, "test-model");

        let summary = summarizer.summarize(Some("old"), &[]).await.unwrap();
        assert_eq!(summary, "folded history");
    }

    #[tokio::test]
    async fn malformed_object_is_an_error() {
        let provider = Arc::new(ScriptedProvider::new([]));
        provider.push_object(json!({ "nope": 1 }));
        let summarizer = LlmSummarizer::new(provider, "test-model");

        assert!(summarizer.summarize(None, &[]).await.is_err());
    }
}
