//! Rolling conversation summary.
//!
//! When a conversation outgrows the active window, messages that fall off
//! the front are compacted into a persistent per-(stream, persona) summary
//! so recall survives truncation. Coverage is strictly append-only:
//! `last_summarized_sequence` never regresses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use companion_chat::{ChatMessage, MessageStore};

#[derive(Error, Debug)]
pub enum SummaryError {
    #[error("summarization failed: {0}")]
    Summarize(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, SummaryError>;

/// The persistent summary row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingSummary {
    pub stream_id: String,
    pub persona_id: String,
    pub summary: String,
    pub last_summarized_sequence: i64,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn find(&self, stream_id: &str, persona_id: &str) -> Result<Option<RollingSummary>>;

    /// Upsert with a monotonic guard: an update whose
    /// `last_summarized_sequence` is lower than the stored one is ignored.
    async fn upsert(
        &self,
        stream_id: &str,
        persona_id: &str,
        summary: String,
        last_summarized_sequence: i64,
    ) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySummaryStore {
    rows: Mutex<HashMap<(String, String), RollingSummary>>,
}

impl InMemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SummaryStore for InMemorySummaryStore {
    async fn find(&self, stream_id: &str, persona_id: &str) -> Result<Option<RollingSummary>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .get(&(stream_id.to_string(), persona_id.to_string()))
            .cloned())
    }

    async fn upsert(
        &self,
        stream_id: &str,
        persona_id: &str,
        summary: String,
        last_summarized_sequence: i64,
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let key = (stream_id.to_string(), persona_id.to_string());
        match rows.get_mut(&key) {
            Some(row) => {
                if last_summarized_sequence >= row.last_summarized_sequence {
                    row.summary = summary;
                    row.last_summarized_sequence = last_summarized_sequence;
                    row.updated_at = Utc::now();
                }
            }
            None => {
                rows.insert(
                    key,
                    RollingSummary {
                        stream_id: stream_id.to_string(),
                        persona_id: persona_id.to_string(),
                        summary,
                        last_summarized_sequence,
                        updated_at: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }
}

/// Folds a batch of dropped messages into an existing summary.
///
/// The LLM-backed implementation lives with the runtime wiring; the core
/// stays provider-agnostic.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, existing: Option<&str>, batch: &[ChatMessage]) -> Result<String>;
}

#[derive(Debug, Clone, Copy)]
pub struct SummaryConfig {
    /// Messages folded per LLM call.
    pub batch_size: usize,
    /// Upper bound on batches per invocation, to bound latency.
    pub max_batches: usize,
    /// Hard cap on stored summary text.
    pub max_summary_chars: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            batch_size: 40,
            max_batches: 3,
            max_summary_chars: 8_000,
        }
    }
}

/// Advances the rolling summary toward the active window's left edge.
pub struct RollingSummaryService {
    store: Arc<dyn SummaryStore>,
    messages: Arc<dyn MessageStore>,
    summarizer: Arc<dyn Summarizer>,
    config: SummaryConfig,
}

impl RollingSummaryService {
    pub fn new(
        store: Arc<dyn SummaryStore>,
        messages: Arc<dyn MessageStore>,
        summarizer: Arc<dyn Summarizer>,
        config: SummaryConfig,
    ) -> Self {
        Self {
            store,
            messages,
            summarizer,
            config,
        }
    }

    /// Fold messages in `[cursor, oldest_kept_sequence - 1]` into the
    /// summary, at most `max_batches` batches. Errors are non-fatal: the
    /// previous summary text is returned and the failure logged.
    pub async fn advance(
        &self,
        stream_id: &str,
        persona_id: &str,
        oldest_kept_sequence: i64,
    ) -> Option<String> {
        let existing = match self.store.find(stream_id, persona_id).await {
            Ok(row) => row,
            Err(error) => {
                log::warn!("summary lookup failed for stream {stream_id}: {error}");
                return None;
            }
        };

        let mut summary_text = existing.as_ref().map(|r| r.summary.clone());
        let mut cursor = existing
            .as_ref()
            .map(|r| r.last_summarized_sequence + 1)
            .unwrap_or(1);

        let upper = oldest_kept_sequence - 1;
        let mut batches = 0;

        while cursor <= upper && batches < self.config.max_batches {
            let batch = match self
                .messages
                .list_by_sequence_range(stream_id, cursor, upper, self.config.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(error) => {
                    log::warn!("summary batch fetch failed for stream {stream_id}: {error}");
                    return summary_text;
                }
            };
            let Some(last) = batch.last() else {
                break;
            };
            let last_sequence = last.sequence;

            let updated = match self
                .summarizer
                .summarize(summary_text.as_deref(), &batch)
                .await
            {
                Ok(updated) => cap_chars(updated, self.config.max_summary_chars),
                Err(error) => {
                    log::warn!("summarization failed for stream {stream_id}: {error}");
                    return summary_text;
                }
            };

            if let Err(error) = self
                .store
                .upsert(stream_id, persona_id, updated.clone(), last_sequence)
                .await
            {
                log::warn!("summary upsert failed for stream {stream_id}: {error}");
                return summary_text;
            }

            log::debug!(
                "rolling summary for stream {stream_id} advanced to sequence {last_sequence}"
            );
            summary_text = Some(updated);
            cursor = last_sequence + 1;
            batches += 1;
        }

        summary_text
    }
}

fn cap_chars(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    text.chars().take(max_chars).collect()
}
