//! Outbox dispatchers.
//!
//! Both dispatchers consume `message_created` outbox entries through the
//! cursor-locked listener (each with its own cursor) and enqueue
//! persona-agent jobs. `CompanionDispatcher` auto-replies in companion-mode
//! streams; `MentionDispatcher` fires on `@slug` mentions anywhere.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use companion_chat::{AuthorType, MessageStore, StreamDirectory};
use companion_core::{SessionStatus, SessionStore, TriggeredBy};

use crate::listener::{OutboxHandler, ProcessResult};
use crate::queue::JobQueue;
use crate::record::EventRecord;

pub const MESSAGE_CREATED: &str = "message_created";
pub const PERSONA_AGENT_QUEUE: &str = "persona-agent";

/// Outbox payload for a committed chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCreatedPayload {
    pub workspace_id: String,
    pub stream_id: String,
    pub message_id: String,
    pub author_id: String,
    pub author_type: AuthorType,
    pub sequence: i64,
}

/// The job both dispatchers enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaAgentJob {
    pub workspace_id: String,
    pub stream_id: String,
    pub message_id: String,
    pub persona_id: String,
    pub triggered_by: TriggeredBy,
}

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([a-zA-Z0-9][a-zA-Z0-9_-]*)").unwrap());

/// Extract distinct mention slugs in first-appearance order.
pub fn extract_mention_slugs(markdown: &str) -> Vec<String> {
    let mut slugs = Vec::new();
    for capture in MENTION_RE.captures_iter(markdown) {
        let slug = capture[1].to_string();
        if !slugs.contains(&slug) {
            slugs.push(slug);
        }
    }
    slugs
}

fn decode_payload(record: &EventRecord) -> Option<MessageCreatedPayload> {
    match serde_json::from_value(record.payload.clone()) {
        Ok(payload) => Some(payload),
        Err(error) => {
            log::warn!("outbox entry {} has malformed payload: {error}", record.id);
            None
        }
    }
}

/// Shared batch walk: dispatch each relevant record in ascending order,
/// keeping partial progress when a transient error interrupts the batch.
async fn walk_batch<F, Fut>(batch: &[EventRecord], cursor: i64, mut dispatch_one: F) -> ProcessResult
where
    F: FnMut(MessageCreatedPayload) -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut handled = cursor;
    let mut any = false;
    for record in batch {
        if record.kind != MESSAGE_CREATED {
            handled = record.id;
            continue;
        }
        let Some(payload) = decode_payload(record) else {
            // Validation failure: skip the entry, keep walking.
            handled = record.id;
            continue;
        };
        any = true;
        if let Err(error) = dispatch_one(payload).await {
            return ProcessResult::Failed {
                new_cursor: (handled > cursor).then_some(handled),
                error,
            };
        }
        handled = record.id;
    }
    if !any && handled == cursor {
        ProcessResult::NoEvents
    } else {
        ProcessResult::Processed { new_cursor: handled }
    }
}

/// Auto-reply dispatcher for companion-mode streams.
pub struct CompanionDispatcher {
    directory: Arc<dyn StreamDirectory>,
    sessions: Arc<dyn SessionStore>,
    queue: Arc<dyn JobQueue>,
}

impl CompanionDispatcher {
    pub fn new(
        directory: Arc<dyn StreamDirectory>,
        sessions: Arc<dyn SessionStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            directory,
            sessions,
            queue,
        }
    }

    async fn dispatch_one(&self, payload: MessageCreatedPayload) -> Result<(), String> {
        if !payload.author_type.is_human() {
            return Ok(());
        }

        let stream = self
            .directory
            .find_stream(&payload.stream_id)
            .await
            .map_err(|e| e.to_string())?;
        let Some(stream) = stream else {
            log::warn!("companion dispatch: unknown stream {}", payload.stream_id);
            return Ok(());
        };
        if !stream.companion_mode {
            return Ok(());
        }
        let Some(persona_id) = stream.companion_persona_id.clone() else {
            return Ok(());
        };
        let persona = self
            .directory
            .find_persona(&persona_id)
            .await
            .map_err(|e| e.to_string())?;
        let active = persona.map(|p| p.active).unwrap_or(false);
        if !active {
            log::debug!(
                "companion dispatch: persona {persona_id} missing or inactive for stream {}",
                payload.stream_id
            );
            return Ok(());
        }

        // An in-flight session absorbs this message via its new-context
        // check; a fresh job would just bounce off the stream lock.
        if self
            .sessions
            .find_running_for_stream(&payload.stream_id)
            .await
            .map_err(|e| e.to_string())?
            .is_some()
        {
            log::debug!(
                "companion dispatch: session already running for stream {}",
                payload.stream_id
            );
            return Ok(());
        }

        if let Some(latest) = self
            .sessions
            .find_latest_for_stream(&payload.stream_id, &persona_id)
            .await
            .map_err(|e| e.to_string())?
        {
            if latest.status == SessionStatus::Pending {
                return Ok(());
            }
            // A finished session that already saw this sequence absorbed
            // the turn mid-flight; re-dispatching would double-process it.
            if matches!(
                latest.status,
                SessionStatus::Completed | SessionStatus::Superseded
            ) && latest.last_seen_sequence >= payload.sequence
            {
                log::debug!(
                    "companion dispatch: sequence {} already absorbed by session {}",
                    payload.sequence,
                    latest.id
                );
                return Ok(());
            }
        }

        let job = PersonaAgentJob {
            workspace_id: payload.workspace_id,
            stream_id: payload.stream_id,
            message_id: payload.message_id,
            persona_id,
            triggered_by: TriggeredBy::Companion,
        };
        log::info!(
            "companion dispatch: enqueueing job for stream {} message {}",
            job.stream_id,
            job.message_id
        );
        self.queue
            .send(
                PERSONA_AGENT_QUEUE,
                serde_json::to_value(&job).map_err(|e| e.to_string())?,
            )
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait::async_trait]
impl OutboxHandler for CompanionDispatcher {
    fn name(&self) -> &str {
        "companion-dispatcher"
    }

    async fn process(&self, batch: &[EventRecord], cursor: i64) -> ProcessResult {
        walk_batch(batch, cursor, |payload| self.dispatch_one(payload)).await
    }
}

/// Mention dispatcher: fires one job per distinct active persona mentioned.
pub struct MentionDispatcher {
    directory: Arc<dyn StreamDirectory>,
    messages: Arc<dyn MessageStore>,
    queue: Arc<dyn JobQueue>,
}

impl MentionDispatcher {
    pub fn new(
        directory: Arc<dyn StreamDirectory>,
        messages: Arc<dyn MessageStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            directory,
            messages,
            queue,
        }
    }

    async fn dispatch_one(&self, payload: MessageCreatedPayload) -> Result<(), String> {
        // Persona messages never re-trigger dispatch.
        if !payload.author_type.is_human() {
            return Ok(());
        }

        let message = self
            .messages
            .find_by_id(&payload.message_id)
            .await
            .map_err(|e| e.to_string())?;
        let Some(message) = message else {
            log::warn!("mention dispatch: unknown message {}", payload.message_id);
            return Ok(());
        };

        for slug in extract_mention_slugs(&message.text()) {
            let persona = self
                .directory
                .find_persona_by_slug(&payload.workspace_id, &slug)
                .await
                .map_err(|e| e.to_string())?;
            let Some(persona) = persona else {
                continue;
            };
            if !persona.active {
                log::debug!("mention dispatch: persona '{slug}' is inactive");
                continue;
            }

            let job = PersonaAgentJob {
                workspace_id: payload.workspace_id.clone(),
                stream_id: payload.stream_id.clone(),
                message_id: payload.message_id.clone(),
                persona_id: persona.id.clone(),
                triggered_by: TriggeredBy::Mention,
            };
            log::info!(
                "mention dispatch: enqueueing job for persona '{slug}' on message {}",
                job.message_id
            );
            self.queue
                .send(
                    PERSONA_AGENT_QUEUE,
                    serde_json::to_value(&job).map_err(|e| e.to_string())?,
                )
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl OutboxHandler for MentionDispatcher {
    fn name(&self) -> &str {
        "mention-dispatcher"
    }

    async fn process(&self, batch: &[EventRecord], cursor: i64) -> ProcessResult {
        walk_batch(batch, cursor, |payload| self.dispatch_one(payload)).await
    }
}
