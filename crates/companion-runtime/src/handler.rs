//! Persona-agent job handler.
//!
//! The glue from queue to loop: resolve the job's stream/persona/trigger,
//! claim the session, build context, run the loop, commit through the
//! message store. Validation failures (malformed payloads, unknown
//! references) are skipped; transient failures propagate so the queue
//! retries.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use companion_chat::{AttachmentStore, MessageStore, StreamDirectory};
use companion_core::NewSession;
use companion_outbox::{Job, JobHandler, PersonaAgentJob};
use companion_tools::ToolContext;

use crate::context::ContextBuilder;
use crate::hooks::{ResponseValidator, StoreCommitter};
use crate::lifecycle::{with_companion_session, LifecycleDeps, RunOutcome};
use crate::runner::{AgentLoop, LoopRequest, RuntimeError};

pub struct PersonaJobHandler {
    directory: Arc<dyn StreamDirectory>,
    messages: Arc<dyn MessageStore>,
    attachments: Arc<dyn AttachmentStore>,
    lifecycle: LifecycleDeps,
    builder: Arc<ContextBuilder>,
    agent_loop: Arc<AgentLoop>,
    validator: Option<Arc<dyn ResponseValidator>>,
    /// Worker-level shutdown; each session gets a child token.
    shutdown: CancellationToken,
}

impl PersonaJobHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<dyn StreamDirectory>,
        messages: Arc<dyn MessageStore>,
        attachments: Arc<dyn AttachmentStore>,
        lifecycle: LifecycleDeps,
        builder: Arc<ContextBuilder>,
        agent_loop: Arc<AgentLoop>,
        validator: Option<Arc<dyn ResponseValidator>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            directory,
            messages,
            attachments,
            lifecycle,
            builder,
            agent_loop,
            validator,
            shutdown,
        }
    }

    pub async fn run_job(&self, job: PersonaAgentJob) -> Result<RunOutcome, RuntimeError> {
        let stream = self
            .directory
            .find_stream(&job.stream_id)
            .await?
            .ok_or_else(|| {
                RuntimeError::Unrecoverable(format!("unknown stream: {}", job.stream_id))
            })?;
        let persona = self
            .directory
            .find_persona(&job.persona_id)
            .await?
            .ok_or_else(|| {
                RuntimeError::Unrecoverable(format!("unknown persona: {}", job.persona_id))
            })?;
        let trigger = self
            .messages
            .find_by_id(&job.message_id)
            .await?
            .ok_or_else(|| {
                RuntimeError::Unrecoverable(format!("unknown trigger message: {}", job.message_id))
            })?;

        let new_session = NewSession {
            workspace_id: job.workspace_id.clone(),
            stream_id: job.stream_id.clone(),
            persona_id: job.persona_id.clone(),
            trigger_message_id: job.message_id.clone(),
            triggered_by: job.triggered_by,
            server_id: self.lifecycle.server_id.clone(),
            initial_sequence: trigger.sequence,
        };

        let builder = Arc::clone(&self.builder);
        let agent_loop = Arc::clone(&self.agent_loop);
        let messages = Arc::clone(&self.messages);
        let attachments = Arc::clone(&self.attachments);
        let validator = self.validator.clone();
        let shutdown = self.shutdown.clone();

        with_companion_session(&self.lifecycle, new_session, move |session| async move {
            let context = builder
                .build(&stream, &persona, &trigger, session.triggered_by)
                .await?;

            let committer = Arc::new(StoreCommitter::new(
                Arc::clone(&messages),
                session.workspace_id.clone(),
                session.stream_id.clone(),
                session.persona_id.clone(),
                session.id.clone(),
            ));
            let tool_ctx = ToolContext {
                workspace_id: session.workspace_id.clone(),
                stream_id: session.stream_id.clone(),
                session_id: session.id.clone(),
                persona_id: session.persona_id.clone(),
                cancel: shutdown.child_token(),
                messages,
                attachments,
            };

            agent_loop
                .run(LoopRequest {
                    session,
                    system_prompt: context.system_prompt,
                    history: context.history,
                    tool_ctx,
                    committer,
                    validator,
                })
                .await
        })
        .await
    }
}

#[async_trait]
impl JobHandler for PersonaJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), String> {
        let parsed: PersonaAgentJob = match serde_json::from_value(job.payload.clone()) {
            Ok(parsed) => parsed,
            Err(error) => {
                // Malformed payloads don't get better with retries.
                log::warn!("dropping malformed persona-agent job {}: {error}", job.id);
                return Ok(());
            }
        };

        match self.run_job(parsed).await {
            Ok(RunOutcome::Completed {
                session_id,
                sent_message_ids,
                ..
            }) => {
                log::info!(
                    "[{session_id}] job {} completed ({} message(s))",
                    job.id,
                    sent_message_ids.len()
                );
                Ok(())
            }
            Ok(RunOutcome::NoMessage { session_id, reason }) => {
                log::info!("[{session_id}] job {} finished without a message: {reason}", job.id);
                Ok(())
            }
            Ok(RunOutcome::Skipped { reason }) => {
                log::debug!("job {} skipped: {reason}", job.id);
                Ok(())
            }
            Err(RuntimeError::Unrecoverable(reason)) => {
                // Unknown references don't get better with retries.
                log::error!("job {} dropped: {reason}", job.id);
                Ok(())
            }
            Err(error) => {
                log::warn!("job {} failed: {error}", job.id);
                Err(error.to_string())
            }
        }
    }
}
