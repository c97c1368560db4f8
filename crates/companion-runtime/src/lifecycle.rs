//! Session lifecycle: claim, heartbeat, complete.
//!
//! Three phases, and no storage handle is held between them - the work
//! phase can sit in LLM calls for minutes without pinning anything. A crash
//! during phase 2 leaves a running row with a frozen heartbeat for the
//! orphan reaper; completion racing a supersede/delete downgrades to a
//! skip, never an error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use companion_core::{
    AcquireOutcome, AgentSession, CompletionUpdate, NewSession, ObserverBus, SessionStore,
    TraceEvent,
};
use companion_outbox::{EventLog, OutboxStore};

use crate::runner::{LoopResult, Result};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub const SESSION_STARTED: &str = "session_started";
pub const SESSION_COMPLETED: &str = "session_completed";
pub const SESSION_FAILED: &str = "session_failed";

#[derive(Clone)]
pub struct LifecycleDeps {
    pub sessions: Arc<dyn SessionStore>,
    pub event_log: Arc<dyn EventLog>,
    pub outbox: Arc<dyn OutboxStore>,
    pub bus: ObserverBus,
    /// Identifies this worker process on session rows.
    pub server_id: String,
    pub heartbeat_interval: Duration,
}

/// How a session run ended, seen from the job handler.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed {
        session_id: String,
        response_message_id: Option<String>,
        sent_message_ids: Vec<String>,
    },
    /// Nothing ran (duplicate trigger, busy stream) or the session was
    /// superseded mid-run. Not an error.
    Skipped { reason: String },
    /// The run finished legitimately without a message.
    NoMessage { session_id: String, reason: String },
}

async fn append_session_event(
    deps: &LifecycleDeps,
    kind: &str,
    session: &AgentSession,
    extra: serde_json::Value,
) {
    let mut payload = json!({
        "session_id": session.id,
        "stream_id": session.stream_id,
        "persona_id": session.persona_id,
        "trigger_message_id": session.trigger_message_id,
    });
    if let (Some(payload), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }
    // Event-log/outbox appends are bookkeeping; a failure is logged, not
    // propagated into the session outcome.
    if let Err(error) = deps.event_log.append(kind, payload.clone()).await {
        log::warn!("[{}] event log append failed: {error}", session.id);
    }
    if let Err(error) = deps.outbox.append(kind, payload).await {
        log::warn!("[{}] outbox append failed: {error}", session.id);
    }
}

/// Run `work` inside a claimed session.
///
/// Phase 1 acquires (or resumes) the session row atomically; phase 2 runs
/// `work` under a heartbeat; phase 3 records the terminal state. Work
/// errors mark the session failed and propagate, so the job layer retries.
pub async fn with_companion_session<F, Fut>(
    deps: &LifecycleDeps,
    new_session: NewSession,
    work: F,
) -> Result<RunOutcome>
where
    F: FnOnce(AgentSession) -> Fut,
    Fut: Future<Output = Result<LoopResult>>,
{
    // Phase 1: acquire.
    let session = match deps.sessions.acquire_for_trigger(new_session).await? {
        AcquireOutcome::Started(session) => {
            log::info!(
                "[{}] session started for stream {} (trigger {})",
                session.id,
                session.stream_id,
                session.trigger_message_id
            );
            session
        }
        AcquireOutcome::Resumed(session) => {
            log::info!("[{}] session resumed (trigger {})", session.id, session.trigger_message_id);
            session
        }
        AcquireOutcome::Skipped { reason } => {
            log::debug!("session acquisition skipped: {reason}");
            return Ok(RunOutcome::Skipped { reason });
        }
    };

    append_session_event(deps, SESSION_STARTED, &session, json!({})).await;
    deps.bus
        .emit(TraceEvent::SessionStart {
            session_id: session.id.clone(),
            stream_id: session.stream_id.clone(),
            persona_id: session.persona_id.clone(),
            trigger_message_id: session.trigger_message_id.clone(),
        })
        .await;

    // Phase 2: work, under a heartbeat.
    let heartbeat_cancel = CancellationToken::new();
    let heartbeat = {
        let sessions = Arc::clone(&deps.sessions);
        let session_id = session.id.clone();
        let interval = deps.heartbeat_interval;
        let cancel = heartbeat_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = sessions.heartbeat(&session_id).await {
                            log::warn!("[{session_id}] heartbeat write failed: {error}");
                        }
                    }
                }
            }
        })
    };

    let work_result = work(session.clone()).await;

    // The timer stops on every path out of phase 2.
    heartbeat_cancel.cancel();
    let _ = heartbeat.await;

    // Phase 3: record the terminal state.
    match work_result {
        Ok(LoopResult::MessagesSent {
            sent_message_ids,
            response_message_id,
            last_seen_sequence,
        }) => {
            let completed = deps
                .sessions
                .complete(
                    &session.id,
                    CompletionUpdate {
                        last_seen_sequence,
                        response_message_id: response_message_id.clone(),
                        sent_message_ids: sent_message_ids.clone(),
                    },
                )
                .await?;
            if !completed {
                log::info!("[{}] session was superseded or deleted mid-run", session.id);
                return Ok(RunOutcome::Skipped {
                    reason: "session superseded or deleted mid-run".to_string(),
                });
            }
            append_session_event(
                deps,
                SESSION_COMPLETED,
                &session,
                json!({ "messages_sent": sent_message_ids.len() }),
            )
            .await;
            deps.bus
                .emit(TraceEvent::SessionEnd {
                    session_id: session.id.clone(),
                    messages_sent: sent_message_ids.len(),
                })
                .await;
            Ok(RunOutcome::Completed {
                session_id: session.id,
                response_message_id,
                sent_message_ids,
            })
        }
        Ok(LoopResult::NoMessage {
            reason,
            last_seen_sequence,
        }) => {
            let completed = deps
                .sessions
                .complete(
                    &session.id,
                    CompletionUpdate {
                        last_seen_sequence,
                        response_message_id: None,
                        sent_message_ids: Vec::new(),
                    },
                )
                .await?;
            if !completed {
                return Ok(RunOutcome::Skipped {
                    reason: "session superseded or deleted mid-run".to_string(),
                });
            }
            append_session_event(
                deps,
                SESSION_COMPLETED,
                &session,
                json!({ "messages_sent": 0, "no_message_reason": reason }),
            )
            .await;
            deps.bus
                .emit(TraceEvent::SessionEnd {
                    session_id: session.id.clone(),
                    messages_sent: 0,
                })
                .await;
            Ok(RunOutcome::NoMessage {
                session_id: session.id,
                reason,
            })
        }
        Err(error) => {
            let message = error.to_string();
            log::error!("[{}] session failed: {message}", session.id);
            match deps.sessions.fail(&session.id, &message).await {
                Ok(true) => {
                    append_session_event(
                        deps,
                        SESSION_FAILED,
                        &session,
                        json!({ "error": message }),
                    )
                    .await;
                }
                Ok(false) => {
                    log::debug!("[{}] failure raced a terminal transition", session.id);
                }
                Err(store_error) => {
                    log::warn!("[{}] could not mark failed: {store_error}", session.id);
                }
            }
            deps.bus
                .emit(TraceEvent::SessionError {
                    session_id: session.id.clone(),
                    error: message,
                })
                .await;
            Err(error)
        }
    }
}
