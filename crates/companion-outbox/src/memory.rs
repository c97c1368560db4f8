//! In-memory event log and outbox.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::record::{EventLog, EventRecord, OutboxStore, Result};

/// Plain append-only log with monotonic ids.
#[derive(Default)]
pub struct InMemoryEventLog {
    state: Mutex<LogState>,
}

#[derive(Default)]
struct LogState {
    entries: Vec<EventRecord>,
    next_id: i64,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries of a kind, for assertions.
    pub fn entries_of_kind(&self, kind: &str) -> Vec<EventRecord> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, kind: &str, payload: serde_json::Value) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.entries.push(EventRecord {
            id,
            kind: kind.to_string(),
            payload,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn fetch_after(&self, cursor: i64, limit: usize) -> Result<Vec<EventRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .filter(|e| e.id > cursor)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
struct CursorRow {
    last_processed_id: i64,
    lease_owner: Option<String>,
    lease_expires_at: DateTime<Utc>,
}

impl Default for CursorRow {
    fn default() -> Self {
        Self {
            last_processed_id: 0,
            lease_owner: None,
            lease_expires_at: Utc::now(),
        }
    }
}

/// Outbox: the same log shape plus leased cursor rows.
#[derive(Default)]
pub struct InMemoryOutbox {
    log: InMemoryEventLog,
    cursors: Mutex<HashMap<String, CursorRow>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries_of_kind(&self, kind: &str) -> Vec<EventRecord> {
        self.log.entries_of_kind(kind)
    }

    fn lease_duration(duration: Duration) -> chrono::Duration {
        chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(30))
    }
}

#[async_trait]
impl EventLog for InMemoryOutbox {
    async fn append(&self, kind: &str, payload: serde_json::Value) -> Result<i64> {
        self.log.append(kind, payload).await
    }

    async fn fetch_after(&self, cursor: i64, limit: usize) -> Result<Vec<EventRecord>> {
        self.log.fetch_after(cursor, limit).await
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn try_acquire_lease(
        &self,
        listener_id: &str,
        owner: &str,
        duration: Duration,
    ) -> Result<bool> {
        let mut cursors = self.cursors.lock().unwrap();
        let row = cursors.entry(listener_id.to_string()).or_default();
        let now = Utc::now();
        let free = row.lease_owner.is_none()
            || row.lease_expires_at <= now
            || row.lease_owner.as_deref() == Some(owner);
        if free {
            row.lease_owner = Some(owner.to_string());
            row.lease_expires_at = now + Self::lease_duration(duration);
        }
        Ok(free)
    }

    async fn refresh_lease(
        &self,
        listener_id: &str,
        owner: &str,
        duration: Duration,
    ) -> Result<bool> {
        let mut cursors = self.cursors.lock().unwrap();
        let row = cursors.entry(listener_id.to_string()).or_default();
        let now = Utc::now();
        let held = row.lease_owner.as_deref() == Some(owner) && row.lease_expires_at > now;
        if held {
            row.lease_expires_at = now + Self::lease_duration(duration);
        }
        Ok(held)
    }

    async fn release_lease(&self, listener_id: &str, owner: &str) -> Result<()> {
        let mut cursors = self.cursors.lock().unwrap();
        if let Some(row) = cursors.get_mut(listener_id) {
            if row.lease_owner.as_deref() == Some(owner) {
                row.lease_owner = None;
                row.lease_expires_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn load_cursor(&self, listener_id: &str) -> Result<i64> {
        let cursors = self.cursors.lock().unwrap();
        Ok(cursors
            .get(listener_id)
            .map(|row| row.last_processed_id)
            .unwrap_or(0))
    }

    async fn advance_cursor(&self, listener_id: &str, to: i64) -> Result<()> {
        let mut cursors = self.cursors.lock().unwrap();
        let row = cursors.entry(listener_id.to_string()).or_default();
        if to > row.last_processed_id {
            row.last_processed_id = to;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ids_are_monotonic_and_fetch_is_ordered() {
        let log = InMemoryEventLog::new();
        for i in 0..5 {
            log.append("message_created", json!({ "n": i })).await.unwrap();
        }
        let batch = log.fetch_after(2, 10).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let outbox = InMemoryOutbox::new();
        let lease = Duration::from_secs(30);

        assert!(outbox.try_acquire_lease("l1", "a", lease).await.unwrap());
        assert!(!outbox.try_acquire_lease("l1", "b", lease).await.unwrap());
        // Re-acquire by the same owner extends.
        assert!(outbox.try_acquire_lease("l1", "a", lease).await.unwrap());

        // Expired lease is free for takeover.
        assert!(outbox
            .try_acquire_lease("l2", "a", Duration::from_millis(0))
            .await
            .unwrap());
        assert!(outbox.try_acquire_lease("l2", "b", lease).await.unwrap());
    }

    #[tokio::test]
    async fn refresh_fails_after_expiry() {
        let outbox = InMemoryOutbox::new();
        assert!(outbox
            .try_acquire_lease("l1", "a", Duration::from_millis(0))
            .await
            .unwrap());
        assert!(!outbox
            .refresh_lease("l1", "a", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cursor_is_monotonic() {
        let outbox = InMemoryOutbox::new();
        outbox.advance_cursor("l1", 10).await.unwrap();
        outbox.advance_cursor("l1", 4).await.unwrap();
        assert_eq!(outbox.load_cursor("l1").await.unwrap(), 10);
    }
}
