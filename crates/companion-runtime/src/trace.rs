//! Session-trace observer.
//!
//! Every trace event becomes an agent-step row and a realtime publish to
//! the session room, the stream room and, for threads, the parent channel
//! room. Tool steps open on `tool:start` and close on completion or error;
//! everything else is a single insert-and-complete.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use companion_chat::{channel_room, session_room, stream_room, RealtimeBus, StreamDirectory};
use companion_core::{StepStore, TraceObserver, TraceEvent};

#[derive(Clone)]
struct SessionRooms {
    stream_id: String,
    parent_channel_id: Option<String>,
}

pub struct SessionTraceObserver {
    steps: Arc<dyn StepStore>,
    realtime: Arc<dyn RealtimeBus>,
    directory: Arc<dyn StreamDirectory>,
    /// session_id -> rooms, learned from session_start.
    rooms: Mutex<HashMap<String, SessionRooms>>,
    /// (session_id, tool_call_id) -> open step id.
    open_tools: Mutex<HashMap<(String, String), String>>,
}

impl SessionTraceObserver {
    pub fn new(
        steps: Arc<dyn StepStore>,
        realtime: Arc<dyn RealtimeBus>,
        directory: Arc<dyn StreamDirectory>,
    ) -> Self {
        Self {
            steps,
            realtime,
            directory,
            rooms: Mutex::new(HashMap::new()),
            open_tools: Mutex::new(HashMap::new()),
        }
    }

    async fn publish(&self, event: &TraceEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(error) => {
                log::warn!("trace event serialization failed: {error}");
                return;
            }
        };
        let event_name = payload["type"].as_str().unwrap_or("trace").to_string();
        let session_id = event.session_id();

        self.realtime
            .publish(&session_room(session_id), &event_name, payload.clone())
            .await;
        let rooms = self.rooms.lock().await;
        if let Some(rooms) = rooms.get(session_id) {
            self.realtime
                .publish(&stream_room(&rooms.stream_id), &event_name, payload.clone())
                .await;
            if let Some(channel) = &rooms.parent_channel_id {
                self.realtime
                    .publish(&channel_room(channel), &event_name, payload)
                    .await;
            }
        }
    }

    async fn record_step(&self, event: &TraceEvent) -> Result<(), String> {
        let session_id = event.session_id().to_string();
        match event {
            TraceEvent::ToolStart {
                tool_call_id,
                tool_name,
                step_type,
                arguments,
                ..
            } => {
                let step = self
                    .steps
                    .begin_step(
                        &session_id,
                        step_type,
                        Some(format!("{tool_name} {arguments}")),
                        Vec::new(),
                        None,
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                self.open_tools
                    .lock()
                    .await
                    .insert((session_id, tool_call_id.clone()), step.id);
            }
            TraceEvent::ToolComplete {
                tool_call_id,
                content,
                sources,
                ..
            } => {
                let open = self
                    .open_tools
                    .lock()
                    .await
                    .remove(&(session_id.clone(), tool_call_id.clone()));
                if let Some(step_id) = open {
                    self.steps
                        .complete_step(&step_id, content.clone(), sources.clone())
                        .await
                        .map_err(|e| e.to_string())?;
                }
            }
            TraceEvent::ToolError { info, .. } => {
                let open = self
                    .open_tools
                    .lock()
                    .await
                    .remove(&(session_id.clone(), info.tool_call_id.clone()));
                match open {
                    Some(step_id) => {
                        self.steps
                            .complete_step(
                                &step_id,
                                Some(format!("error: {}", info.error)),
                                Vec::new(),
                            )
                            .await
                            .map_err(|e| e.to_string())?;
                    }
                    // An unknown tool never opened a step; record one shot.
                    None => {
                        let step = self
                            .steps
                            .begin_step(
                                &session_id,
                                "tool_error",
                                Some(format!("{}: {}", info.tool_name, info.error)),
                                Vec::new(),
                                None,
                            )
                            .await
                            .map_err(|e| e.to_string())?;
                        self.steps
                            .complete_step(&step.id, None, Vec::new())
                            .await
                            .map_err(|e| e.to_string())?;
                    }
                }
            }
            _ => {
                // Single-shot steps for everything that produces one.
                let Some(step_type) = event.step_type() else {
                    return Ok(());
                };
                let (content, sources, message_id) = match event {
                    TraceEvent::Thinking { content, .. } => {
                        (Some(content.clone()), Vec::new(), None)
                    }
                    TraceEvent::MessageSent {
                        content,
                        sources,
                        message_id,
                        ..
                    } => (
                        Some(content.clone()),
                        sources.clone(),
                        Some(message_id.clone()),
                    ),
                    TraceEvent::MessageEdited {
                        content, message_id, ..
                    } => (Some(content.clone()), Vec::new(), Some(message_id.clone())),
                    TraceEvent::ResponseKept { reason, .. } => {
                        (Some(reason.clone()), Vec::new(), None)
                    }
                    TraceEvent::ContextReceived {
                        message_count,
                        latest_sequence,
                        ..
                    } => (
                        Some(format!(
                            "{message_count} new message(s), up to sequence {latest_sequence}"
                        )),
                        Vec::new(),
                        None,
                    ),
                    TraceEvent::Reconsidering { details, .. } => {
                        (Some(details.draft.clone()), Vec::new(), None)
                    }
                    _ => (None, Vec::new(), None),
                };
                let step = self
                    .steps
                    .begin_step(&session_id, step_type, content, sources, message_id)
                    .await
                    .map_err(|e| e.to_string())?;
                self.steps
                    .complete_step(&step.id, None, Vec::new())
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TraceObserver for SessionTraceObserver {
    fn name(&self) -> &str {
        "session-trace"
    }

    async fn on_event(&self, event: &TraceEvent) -> Result<(), String> {
        if let TraceEvent::SessionStart {
            session_id,
            stream_id,
            ..
        } = event
        {
            let parent_channel_id = match self.directory.find_stream(stream_id).await {
                Ok(Some(stream)) => stream.parent_channel_id,
                _ => None,
            };
            self.rooms.lock().await.insert(
                session_id.clone(),
                SessionRooms {
                    stream_id: stream_id.clone(),
                    parent_channel_id,
                },
            );
        }

        let result = self.record_step(event).await;
        self.publish(event).await;

        if matches!(
            event,
            TraceEvent::SessionEnd { .. } | TraceEvent::SessionError { .. }
        ) {
            let session_id = event.session_id().to_string();
            self.rooms.lock().await.remove(&session_id);
            self.open_tools
                .lock()
                .await
                .retain(|(sid, _), _| sid != &session_id);
        }

        result
    }
}
