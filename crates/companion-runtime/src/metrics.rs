//! Metrics observer.
//!
//! Maps the event stream onto timing spans: session:start opens a session
//! span, tool:start/complete/error bracket tool spans, session:end/error
//! close everything. The snapshot is what a metrics pipeline or dashboard
//! would scrape.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;

use companion_core::{TraceEvent, TraceObserver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub session_id: String,
    pub status: SessionStatus,
    pub duration_ms: u64,
    pub llm_turns: u32,
    pub tool_calls: u32,
    pub tool_errors: u32,
    pub tool_time_ms: u64,
    pub messages_sent: u32,
    pub reconsiderations: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: usize,
    pub finished: Vec<SessionMetrics>,
}

struct SessionSpan {
    started: Instant,
    llm_turns: u32,
    tool_calls: u32,
    tool_errors: u32,
    tool_time_ms: u64,
    messages_sent: u32,
    reconsiderations: u32,
    open_tools: HashMap<String, Instant>,
}

impl SessionSpan {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            llm_turns: 0,
            tool_calls: 0,
            tool_errors: 0,
            tool_time_ms: 0,
            messages_sent: 0,
            reconsiderations: 0,
            open_tools: HashMap::new(),
        }
    }

    fn finish(self, session_id: String, status: SessionStatus) -> SessionMetrics {
        SessionMetrics {
            session_id,
            status,
            duration_ms: self.started.elapsed().as_millis() as u64,
            llm_turns: self.llm_turns,
            tool_calls: self.tool_calls,
            tool_errors: self.tool_errors,
            tool_time_ms: self.tool_time_ms,
            messages_sent: self.messages_sent,
            reconsiderations: self.reconsiderations,
        }
    }
}

#[derive(Default)]
pub struct MetricsObserver {
    state: Mutex<MetricsState>,
}

#[derive(Default)]
struct MetricsState {
    active: HashMap<String, SessionSpan>,
    finished: Vec<SessionMetrics>,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap();
        MetricsSnapshot {
            active_sessions: state.active.len(),
            finished: state.finished.clone(),
        }
    }
}

#[async_trait]
impl TraceObserver for MetricsObserver {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn on_event(&self, event: &TraceEvent) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        match event {
            TraceEvent::SessionStart { session_id, .. } => {
                state.active.insert(session_id.clone(), SessionSpan::new());
            }
            TraceEvent::Thinking { session_id, .. } => {
                if let Some(span) = state.active.get_mut(session_id) {
                    span.llm_turns += 1;
                }
            }
            TraceEvent::ToolStart {
                session_id,
                tool_call_id,
                ..
            } => {
                if let Some(span) = state.active.get_mut(session_id) {
                    span.tool_calls += 1;
                    span.open_tools.insert(tool_call_id.clone(), Instant::now());
                }
            }
            TraceEvent::ToolComplete {
                session_id,
                tool_call_id,
                ..
            } => {
                if let Some(span) = state.active.get_mut(session_id) {
                    if let Some(started) = span.open_tools.remove(tool_call_id) {
                        span.tool_time_ms += started.elapsed().as_millis() as u64;
                    }
                }
            }
            TraceEvent::ToolError { session_id, info } => {
                if let Some(span) = state.active.get_mut(session_id) {
                    span.tool_errors += 1;
                    if let Some(started) = span.open_tools.remove(&info.tool_call_id) {
                        span.tool_time_ms += started.elapsed().as_millis() as u64;
                    }
                }
            }
            TraceEvent::MessageSent { session_id, .. }
            | TraceEvent::MessageEdited { session_id, .. } => {
                if let Some(span) = state.active.get_mut(session_id) {
                    span.messages_sent += 1;
                }
            }
            TraceEvent::Reconsidering { session_id, .. } => {
                if let Some(span) = state.active.get_mut(session_id) {
                    span.reconsiderations += 1;
                }
            }
            TraceEvent::SessionEnd { session_id, .. } => {
                if let Some(span) = state.active.remove(session_id) {
                    let metrics = span.finish(session_id.clone(), SessionStatus::Completed);
                    state.finished.push(metrics);
                }
            }
            TraceEvent::SessionError { session_id, .. } => {
                if let Some(span) = state.active.remove(session_id) {
                    let metrics = span.finish(session_id.clone(), SessionStatus::Error);
                    state.finished.push(metrics);
                }
            }
            TraceEvent::ResponseKept { .. } | TraceEvent::ContextReceived { .. } => {}
        }
        Ok(())
    }
}
