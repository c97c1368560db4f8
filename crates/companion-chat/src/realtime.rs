//! Realtime fanout collaborator.
//!
//! A rooms-style publish interface. The session-trace observer publishes
//! every agent step to the session room, the stream room and, for threads,
//! the parent channel room.

use async_trait::async_trait;

/// Room name for a single agent session.
pub fn session_room(session_id: &str) -> String {
    format!("agent-session:{session_id}")
}

/// Room name for a stream.
pub fn stream_room(stream_id: &str) -> String {
    format!("stream:{stream_id}")
}

/// Room name for a channel (threads publish to their parent too).
pub fn channel_room(channel_id: &str) -> String {
    format!("channel:{channel_id}")
}

/// Publish interface. Implementations must not block the caller on slow
/// subscribers; failures are the implementation's to log.
#[async_trait]
pub trait RealtimeBus: Send + Sync {
    async fn publish(&self, room: &str, event_name: &str, payload: serde_json::Value);
}

/// A bus that drops everything. Useful in tests and headless runs.
#[derive(Debug, Default)]
pub struct NullRealtimeBus;

#[async_trait]
impl RealtimeBus for NullRealtimeBus {
    async fn publish(&self, _room: &str, _event_name: &str, _payload: serde_json::Value) {}
}
