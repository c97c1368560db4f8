//! The agent loop.
//!
//! Iterates LLM call -> tool execution -> new-message check -> commit or
//! reconsider, under a fixed iteration ceiling. `send_message` tool calls
//! are staged as pending messages rather than executed, which is what makes
//! reconsideration possible: if new user input lands between staging and
//! commit, the model sees its own draft next to the new messages and
//! decides again.
//!
//! Ordering guarantees kept here: tool calls always execute before the
//! new-message check; pending messages commit in submission order;
//! `last_seen_sequence` only moves forward.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;

use companion_chat::{ChatMessage, ChatStoreError, MessageOperation, SourceItem};
use companion_core::{
    truncate_history, AgentSession, Message, ObserverBus, ReconsideredDraft, SessionError,
    SessionStore, ToolCallRequest, ToolErrorInfo, ToolSchema, TraceEvent,
};
use companion_llm::{GenerateRequest, LlmError, LlmProvider};
use companion_tools::{
    wrap_untrusted, ExecutionPhase, KeepResponseArgs, SendMessageArgs, Tool, ToolContext,
    ToolOutput, ToolRegistry, KEEP_RESPONSE_TOOL, SEND_MESSAGE_TOOL,
};

use crate::config::LoopConfig;
use crate::hooks::{CommitMessage, ResponseValidator};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("aborted")]
    Aborted,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("loop completed without sending a message")]
    NoMessageProduced,

    #[error("chat store error: {0}")]
    Chat(#[from] ChatStoreError),

    #[error("session store error: {0}")]
    Session(#[from] SessionError),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// A staged, not-yet-committed reply. Never outlives the iteration that
/// staged it unless reconsideration is triggered.
#[derive(Debug, Clone)]
struct PendingMessage {
    content: String,
    sources: Vec<SourceItem>,
    #[allow(dead_code)]
    prepared_at: DateTime<Utc>,
}

/// Everything one run needs beyond the loop's own dependencies.
pub struct LoopRequest {
    pub session: AgentSession,
    pub system_prompt: String,
    pub history: Vec<Message>,
    pub tool_ctx: ToolContext,
    pub committer: Arc<dyn CommitMessage>,
    pub validator: Option<Arc<dyn ResponseValidator>>,
}

#[derive(Debug, Clone)]
pub enum LoopResult {
    MessagesSent {
        sent_message_ids: Vec<String>,
        response_message_id: Option<String>,
        last_seen_sequence: i64,
    },
    /// A legitimate no-message finish (keep_response, or exhaustion with
    /// `allow_no_message_output`).
    NoMessage {
        reason: String,
        last_seen_sequence: i64,
    },
}

pub struct AgentLoop {
    llm: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    sessions: Arc<dyn SessionStore>,
    bus: ObserverBus,
    config: LoopConfig,
}

impl AgentLoop {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        sessions: Arc<dyn SessionStore>,
        bus: ObserverBus,
        config: LoopConfig,
    ) -> Self {
        Self {
            llm,
            registry,
            sessions,
            bus,
            config,
        }
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.registry
            .schemas()
            .into_iter()
            .filter(|schema| {
                schema.name != KEEP_RESPONSE_TOOL || self.config.allow_no_message_output
            })
            .collect()
    }

    pub async fn run(&self, request: LoopRequest) -> Result<LoopResult> {
        let LoopRequest {
            session,
            system_prompt,
            mut history,
            tool_ctx,
            committer,
            validator,
        } = request;

        let session_id = session.id.clone();
        let stream_id = session.stream_id.clone();
        let persona_id = session.persona_id.clone();

        let mut last_seen = session.last_seen_sequence;
        let mut retrieved_context: Vec<String> = Vec::new();
        let mut sources: Vec<SourceItem> = Vec::new();
        let mut pending: Vec<PendingMessage> = Vec::new();
        let mut keep_reason: Option<String> = None;
        let mut sent_message_ids: Vec<String> = Vec::new();
        let mut response_message_id: Option<String> = None;
        let mut reconsidered_text_response = false;
        let mut validation_failures = 0usize;
        let tools = self.tool_schemas();

        for iteration in 0..self.config.max_iterations {
            // Pre-flight: react to external supersede/delete.
            if tool_ctx.cancel.is_cancelled() {
                return Err(RuntimeError::Aborted);
            }

            let system = assemble_system(&system_prompt, &retrieved_context);
            let window = truncate_history(&history, self.config.truncation);
            log::debug!(
                "[{session_id}] iteration {} ({} messages in window)",
                iteration + 1,
                window.len()
            );

            let generation = self
                .llm
                .generate_with_tools(GenerateRequest {
                    model: self.config.model.clone(),
                    system,
                    messages: window,
                    tools: tools.clone(),
                    temperature: self.config.temperature,
                    max_output_tokens: self.config.max_output_tokens,
                })
                .await?;

            if !generation.text.is_empty() || !generation.tool_calls.is_empty() {
                let thinking = if generation.text.is_empty() {
                    plan_descriptor(&generation.tool_calls)
                } else {
                    generation.text.clone()
                };
                self.bus
                    .emit(TraceEvent::Thinking {
                        session_id: session_id.clone(),
                        content: thinking,
                    })
                    .await;
            }

            history.extend(generation.messages.iter().cloned());

            if generation.tool_calls.is_empty() {
                // Text-only: an implicit response.
                if generation.text.trim().is_empty() {
                    continue;
                }

                let new_messages = self
                    .poll_new_messages(&tool_ctx, &stream_id, &persona_id, last_seen)
                    .await?;
                if !new_messages.is_empty() && !reconsidered_text_response {
                    last_seen = self
                        .inject_new_messages(&session_id, &mut history, &new_messages, last_seen)
                        .await?;
                    history.push(Message::system(format!(
                        "[New context arrived while you were responding]\n\
                         The messages above came in while you were preparing a reply. \
                         Your draft was:\n{}\n\
                         Please incorporate the new context and respond.",
                        generation.text
                    )));
                    reconsidered_text_response = true;
                    continue;
                }

                if let Some(validator) = validator.as_ref() {
                    if let Some(reason) = validator.validate(&generation.text).await {
                        validation_failures += 1;
                        log::debug!("[{session_id}] response rejected by validator: {reason}");
                        history.push(Message::system(revise_note(&reason)));
                        continue;
                    }
                }

                let committed = committer
                    .commit(&generation.text, &sources)
                    .await
                    .map_err(RuntimeError::Commit)?;
                self.record_commit(
                    &session_id,
                    &generation.text,
                    &sources,
                    &committed.message_id,
                    committed.operation,
                )
                .await?;
                sent_message_ids.push(committed.message_id.clone());
                response_message_id.get_or_insert(committed.message_id);
                break;
            }

            // Tool calls present: execute, then finalize-or-reconsider.
            let batch = self
                .execute_tool_batch(
                    &session_id,
                    &tool_ctx,
                    &generation.tool_calls,
                    &mut retrieved_context,
                    &mut sources,
                    &mut pending,
                    &mut keep_reason,
                )
                .await?;
            history.extend(batch);

            if tool_ctx.cancel.is_cancelled() {
                return Err(RuntimeError::Aborted);
            }

            // Tool execution always precedes this check; a user message that
            // raced the tools is seen here, not dropped.
            let new_messages = self
                .poll_new_messages(&tool_ctx, &stream_id, &persona_id, last_seen)
                .await?;

            if !pending.is_empty() {
                if new_messages.is_empty() {
                    if let Some(validator) = validator.as_ref() {
                        let mut rejected = None;
                        for staged in &pending {
                            if let Some(reason) = validator.validate(&staged.content).await {
                                rejected = Some(reason);
                                break;
                            }
                        }
                        if let Some(reason) = rejected {
                            validation_failures += 1;
                            log::debug!(
                                "[{session_id}] staged reply rejected by validator: {reason}"
                            );
                            history.push(Message::system(revise_note(&reason)));
                            pending.clear();
                            continue;
                        }
                    }

                    // Commit in submission order.
                    for staged in pending.drain(..) {
                        let mut staged_sources = sources.clone();
                        merge_sources(&mut staged_sources, staged.sources.clone());
                        let committed = committer
                            .commit(&staged.content, &staged_sources)
                            .await
                            .map_err(RuntimeError::Commit)?;
                        self.record_commit(
                            &session_id,
                            &staged.content,
                            &staged_sources,
                            &committed.message_id,
                            committed.operation,
                        )
                        .await?;
                        sent_message_ids.push(committed.message_id.clone());
                        response_message_id.get_or_insert(committed.message_id);
                    }
                    break;
                }

                // Draft meets new input: reconsider.
                let draft = pending
                    .iter()
                    .map(|p| p.content.clone())
                    .collect::<Vec<_>>()
                    .join("\n---\n");
                let previews = preview_messages(&new_messages);
                last_seen = self
                    .inject_new_messages(&session_id, &mut history, &new_messages, last_seen)
                    .await?;
                self.bus
                    .emit(TraceEvent::Reconsidering {
                        session_id: session_id.clone(),
                        details: ReconsideredDraft {
                            draft: draft.clone(),
                            new_message_previews: previews,
                        },
                    })
                    .await;
                history.push(Message::system(format!(
                    "[New context arrived before your reply was delivered]\n\
                     Your staged draft:\n{draft}\n\
                     Re-evaluate it against the new messages above. You may keep \
                     your draft by calling send_message again with the same \
                     content, or revise it.",
                )));
                pending.clear();
                continue;
            }

            if let Some(reason) = keep_reason.take() {
                if new_messages.is_empty() {
                    self.bus
                        .emit(TraceEvent::ResponseKept {
                            session_id: session_id.clone(),
                            reason: reason.clone(),
                        })
                        .await;
                    return Ok(LoopResult::NoMessage {
                        reason,
                        last_seen_sequence: last_seen,
                    });
                }

                let previews = preview_messages(&new_messages);
                last_seen = self
                    .inject_new_messages(&session_id, &mut history, &new_messages, last_seen)
                    .await?;
                self.bus
                    .emit(TraceEvent::Reconsidering {
                        session_id: session_id.clone(),
                        details: ReconsideredDraft {
                            draft: format!("(keep previous response: {reason})"),
                            new_message_previews: previews,
                        },
                    })
                    .await;
                history.push(Message::system(
                    "[New context arrived]\nYou chose to keep your previous response, \
                     but new messages came in above. Decide again: call send_message \
                     to reply, or keep_response if the existing reply still stands."
                        .to_string(),
                ));
                continue;
            }

            if !new_messages.is_empty() {
                last_seen = self
                    .inject_new_messages(&session_id, &mut history, &new_messages, last_seen)
                    .await?;
            }
        }

        if !sent_message_ids.is_empty() {
            return Ok(LoopResult::MessagesSent {
                sent_message_ids,
                response_message_id,
                last_seen_sequence: last_seen,
            });
        }

        if self.config.allow_no_message_output {
            let reason = if validation_failures > 0 {
                "repeatedly failed validation".to_string()
            } else {
                "iteration limit reached without a reply".to_string()
            };
            return Ok(LoopResult::NoMessage {
                reason,
                last_seen_sequence: last_seen,
            });
        }

        Err(RuntimeError::NoMessageProduced)
    }

    /// Execute one iteration's tool calls: early phase first, then normal;
    /// send_message and keep_response are staged, never executed. Returns
    /// the tool-role (and image) messages to append, in the original call
    /// order.
    #[allow(clippy::too_many_arguments)]
    async fn execute_tool_batch(
        &self,
        session_id: &str,
        tool_ctx: &ToolContext,
        calls: &[ToolCallRequest],
        retrieved_context: &mut Vec<String>,
        sources: &mut Vec<SourceItem>,
        pending: &mut Vec<PendingMessage>,
        keep_reason: &mut Option<String>,
    ) -> Result<Vec<Message>> {
        let mut early: Vec<&ToolCallRequest> = Vec::new();
        let mut normal: Vec<&ToolCallRequest> = Vec::new();
        let mut results: HashMap<String, String> = HashMap::new();
        let mut images: Vec<String> = Vec::new();

        for call in calls {
            match call.name.as_str() {
                SEND_MESSAGE_TOOL => match SendMessageArgs::parse(&call.arguments) {
                    Ok(args) => {
                        log::debug!("[{session_id}] staging send_message ({} chars)", args.content.len());
                        pending.push(PendingMessage {
                            content: args.content,
                            sources: args.sources,
                            prepared_at: Utc::now(),
                        });
                        results.insert(
                            call.id.clone(),
                            serde_json::json!({
                                "status": "pending",
                                "message": "staged for delivery",
                            })
                            .to_string(),
                        );
                    }
                    Err(error) => {
                        results.insert(call.id.clone(), format!("Error: {error}"));
                    }
                },
                KEEP_RESPONSE_TOOL => {
                    if !self.config.allow_no_message_output {
                        results.insert(
                            call.id.clone(),
                            "Error: keep_response is not available here".to_string(),
                        );
                        continue;
                    }
                    match KeepResponseArgs::parse(&call.arguments) {
                        Ok(args) => {
                            *keep_reason = Some(args.reason);
                            results.insert(
                                call.id.clone(),
                                serde_json::json!({ "status": "kept" }).to_string(),
                            );
                        }
                        Err(error) => {
                            results.insert(call.id.clone(), format!("Error: {error}"));
                        }
                    }
                }
                _ => match self.registry.get(&call.name) {
                    Some(tool) if tool.execution_phase() == ExecutionPhase::Early => {
                        early.push(call)
                    }
                    Some(_) => normal.push(call),
                    None => {
                        self.bus
                            .emit(TraceEvent::ToolError {
                                session_id: session_id.to_string(),
                                info: ToolErrorInfo {
                                    tool_call_id: call.id.clone(),
                                    tool_name: call.name.clone(),
                                    error: format!("unknown tool: {}", call.name),
                                },
                            })
                            .await;
                        results.insert(
                            call.id.clone(),
                            format!("Error: unknown tool: {}", call.name),
                        );
                    }
                },
            }
        }

        for call in early.into_iter().chain(normal) {
            // Lookup succeeded during partitioning.
            let Some(tool) = self.registry.get(&call.name) else {
                continue;
            };
            let output = self
                .execute_one(session_id, tool_ctx, call, tool.as_ref())
                .await;
            match output {
                Ok(output) => {
                    merge_sources(sources, output.sources.clone());
                    if let Some(context) = &output.system_context {
                        retrieved_context.push(context.clone());
                    }
                    for image in &output.multimodal {
                        images.push(image.url.clone());
                    }
                    results.insert(call.id.clone(), wrap_untrusted(&call.name, &output.output));
                }
                Err(error) => {
                    results.insert(call.id.clone(), format!("Error: {error}"));
                }
            }
        }

        // Tool-result messages in original call order, images afterwards.
        let mut appended = Vec::with_capacity(calls.len() + 1);
        for call in calls {
            let content = results
                .remove(&call.id)
                .unwrap_or_else(|| "Error: tool produced no result".to_string());
            appended.push(Message::tool_result(call.id.clone(), content));
        }
        if !images.is_empty() {
            appended.push(Message::user_images(images));
        }
        Ok(appended)
    }

    async fn execute_one(
        &self,
        session_id: &str,
        tool_ctx: &ToolContext,
        call: &ToolCallRequest,
        tool: &dyn Tool,
    ) -> std::result::Result<ToolOutput, String> {
        self.bus
            .emit(TraceEvent::ToolStart {
                session_id: session_id.to_string(),
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                step_type: tool.trace_step_type().to_string(),
                arguments: call.arguments.clone(),
            })
            .await;

        let started = Instant::now();
        match tool.execute(call.arguments.clone(), tool_ctx).await {
            Ok(output) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                log::debug!("[{session_id}] tool '{}' completed in {elapsed_ms}ms", call.name);
                self.bus
                    .emit(TraceEvent::ToolComplete {
                        session_id: session_id.to_string(),
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        elapsed_ms,
                        content: tool.format_trace_content(&call.arguments, &output),
                        sources: output.sources.clone(),
                    })
                    .await;
                Ok(output)
            }
            Err(error) => {
                log::warn!("[{session_id}] tool '{}' failed: {error}", call.name);
                self.bus
                    .emit(TraceEvent::ToolError {
                        session_id: session_id.to_string(),
                        info: ToolErrorInfo {
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            error: error.to_string(),
                        },
                    })
                    .await;
                Err(error.to_string())
            }
        }
    }

    async fn poll_new_messages(
        &self,
        tool_ctx: &ToolContext,
        stream_id: &str,
        persona_id: &str,
        last_seen: i64,
    ) -> Result<Vec<ChatMessage>> {
        Ok(tool_ctx
            .messages
            .list_since(stream_id, last_seen, Some(persona_id))
            .await?)
    }

    /// Fold newly arrived messages into history, bump the monotonic
    /// `last_seen_sequence` both locally and on the session row, and let
    /// observers know context was received.
    async fn inject_new_messages(
        &self,
        session_id: &str,
        history: &mut Vec<Message>,
        new_messages: &[ChatMessage],
        last_seen: i64,
    ) -> Result<i64> {
        let mut latest = last_seen;
        for message in new_messages {
            history.push(format_incoming(message));
            latest = latest.max(message.sequence);
        }
        self.sessions.bump_last_seen(session_id, latest).await?;
        self.bus
            .emit(TraceEvent::ContextReceived {
                session_id: session_id.to_string(),
                message_count: new_messages.len(),
                latest_sequence: latest,
            })
            .await;
        Ok(latest)
    }

    async fn record_commit(
        &self,
        session_id: &str,
        content: &str,
        sources: &[SourceItem],
        message_id: &str,
        operation: MessageOperation,
    ) -> Result<()> {
        self.sessions
            .append_sent_message(session_id, message_id)
            .await?;
        let event = match operation {
            MessageOperation::Created => TraceEvent::MessageSent {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
                content: content.to_string(),
                sources: sources.to_vec(),
            },
            MessageOperation::Edited => TraceEvent::MessageEdited {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
                content: content.to_string(),
            },
        };
        self.bus.emit(event).await;
        Ok(())
    }
}

fn assemble_system(base: &str, retrieved_context: &[String]) -> String {
    if retrieved_context.is_empty() {
        return base.to_string();
    }
    let mut system = base.to_string();
    system.push_str("\n\n## Retrieved context\n");
    for context in retrieved_context {
        system.push_str(context);
        system.push('\n');
    }
    system
}

fn plan_descriptor(calls: &[ToolCallRequest]) -> String {
    let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
    format!("planning tool calls: {}", names.join(", "))
}

fn revise_note(reason: &str) -> String {
    format!(
        "[Your reply was not accepted]\nReason: {reason}\nPlease produce a revised reply."
    )
}

/// Human messages keep their timestamp/author prefix so the model can
/// attribute them; the persona's own messages stay unadorned.
fn format_incoming(message: &ChatMessage) -> Message {
    let prefix = format!(
        "[{}] {}: ",
        message.created_at.format("%Y-%m-%d %H:%M"),
        message.author_id
    );
    Message::user(format!("{prefix}{}", message.text()))
}

fn preview_messages(messages: &[ChatMessage]) -> Vec<String> {
    messages
        .iter()
        .map(|m| {
            let text = m.text();
            let preview: String = text.chars().take(140).collect();
            preview
        })
        .collect()
}

fn merge_sources(into: &mut Vec<SourceItem>, new: Vec<SourceItem>) {
    for source in new {
        if !into
            .iter()
            .any(|s| s.url == source.url && s.title == source.title)
        {
            into.push(source);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sources_dedupes_on_url_and_title() {
        let mut set = vec![SourceItem {
            url: "https://a".to_string(),
            title: "A".to_string(),
        }];
        merge_sources(
            &mut set,
            vec![
                SourceItem {
                    url: "https://a".to_string(),
                    title: "A".to_string(),
                },
                SourceItem {
                    url: "https://b".to_string(),
                    title: "B".to_string(),
                },
            ],
        );
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn plan_descriptor_lists_tool_names() {
        let calls = vec![
            ToolCallRequest {
                id: "1".to_string(),
                name: "web_search".to_string(),
                arguments: serde_json::json!({}),
            },
            ToolCallRequest {
                id: "2".to_string(),
                name: "fetch_url".to_string(),
                arguments: serde_json::json!({}),
            },
        ];
        assert_eq!(
            plan_descriptor(&calls),
            "planning tool calls: web_search, fetch_url"
        );
    }

    #[test]
    fn assemble_system_appends_retrieved_context() {
        let system = assemble_system("base", &["found a thing".to_string()]);
        assert!(system.starts_with("base"));
        assert!(system.contains("## Retrieved context"));
        assert!(system.contains("found a thing"));
        assert_eq!(assemble_system("base", &[]), "base");
    }
}
