//! Event log and outbox contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, OutboxError>;

/// One append-only entry. Ids are monotonically increasing in insertion
/// order within a single log; the event log and the outbox have
/// independent id spaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The append-only event log (the system of record for what happened).
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, kind: &str, payload: serde_json::Value) -> Result<i64>;

    /// Entries with `id > cursor`, ascending, capped at `limit`.
    async fn fetch_after(&self, cursor: i64, limit: usize) -> Result<Vec<EventRecord>>;
}

/// The outbox: an event log plus per-listener cursor rows with time leases.
///
/// Lease exclusivity holds only while the lease is unexpired; an expired
/// lease is free for any owner to take. All lease operations are single
/// atomic steps in implementations.
#[async_trait]
pub trait OutboxStore: EventLog {
    /// Acquire or extend: succeeds when the cursor row has no lease, an
    /// expired lease, or a lease already held by `owner`.
    async fn try_acquire_lease(
        &self,
        listener_id: &str,
        owner: &str,
        duration: Duration,
    ) -> Result<bool>;

    /// Extend an unexpired lease held by `owner`. False means the lease was
    /// lost (expired and possibly taken over).
    async fn refresh_lease(
        &self,
        listener_id: &str,
        owner: &str,
        duration: Duration,
    ) -> Result<bool>;

    async fn release_lease(&self, listener_id: &str, owner: &str) -> Result<()>;

    /// Last processed id for the listener; 0 when never advanced.
    async fn load_cursor(&self, listener_id: &str) -> Result<i64>;

    /// Monotonic: a `to` below the stored cursor is ignored.
    async fn advance_cursor(&self, listener_id: &str, to: i64) -> Result<()>;
}
