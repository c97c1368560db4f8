//! The orphan reaper.
//!
//! A worker that dies mid-run leaves its session `running` with a frozen
//! heartbeat, which would wedge the stream behind the single-running
//! invariant. The reaper sweeps those up and fails them. The fail is a
//! conditional transition, so concurrent reapers on other nodes are safe.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use companion_core::{ObserverBus, SessionStore, TraceEvent};
use companion_outbox::{EventLog, OutboxStore};

use crate::lifecycle::SESSION_FAILED;

pub const ORPHANED_ERROR: &str = "orphaned (stale heartbeat)";

pub struct OrphanReaper {
    sessions: Arc<dyn SessionStore>,
    event_log: Arc<dyn EventLog>,
    outbox: Arc<dyn OutboxStore>,
    bus: ObserverBus,
    /// Sweep cadence.
    interval: Duration,
    /// Heartbeats older than this are orphans.
    stale_threshold: Duration,
}

impl OrphanReaper {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        event_log: Arc<dyn EventLog>,
        outbox: Arc<dyn OutboxStore>,
        bus: ObserverBus,
    ) -> Self {
        Self {
            sessions,
            event_log,
            outbox,
            bus,
            interval: Duration::from_secs(15),
            stale_threshold: Duration::from_secs(60),
        }
    }

    pub fn with_timing(mut self, interval: Duration, stale_threshold: Duration) -> Self {
        self.interval = interval;
        self.stale_threshold = stale_threshold;
        self
    }

    /// One sweep; returns how many sessions were reaped.
    pub async fn sweep_once(&self) -> usize {
        let stale = match self
            .sessions
            .find_stale_running(self.stale_threshold.as_secs() as i64)
            .await
        {
            Ok(stale) => stale,
            Err(error) => {
                log::warn!("orphan sweep query failed: {error}");
                return 0;
            }
        };

        let mut reaped = 0;
        for session in stale {
            match self.sessions.fail(&session.id, ORPHANED_ERROR).await {
                Ok(true) => {
                    reaped += 1;
                    log::warn!(
                        "[{}] reaped orphaned session (heartbeat at {})",
                        session.id,
                        session.heartbeat_at
                    );
                    let payload = json!({
                        "session_id": session.id,
                        "stream_id": session.stream_id,
                        "persona_id": session.persona_id,
                        "trigger_message_id": session.trigger_message_id,
                        "error": ORPHANED_ERROR,
                    });
                    if let Err(error) = self.event_log.append(SESSION_FAILED, payload.clone()).await
                    {
                        log::warn!("[{}] event log append failed: {error}", session.id);
                    }
                    if let Err(error) = self.outbox.append(SESSION_FAILED, payload).await {
                        log::warn!("[{}] outbox append failed: {error}", session.id);
                    }
                    self.bus
                        .emit(TraceEvent::SessionError {
                            session_id: session.id.clone(),
                            error: ORPHANED_ERROR.to_string(),
                        })
                        .await;
                }
                // Someone else (another reaper, a completion) got there
                // first; nothing to do.
                Ok(false) => {}
                Err(error) => {
                    log::warn!("[{}] orphan fail failed: {error}", session.id);
                }
            }
        }
        reaped
    }

    /// Sweep on an interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!(
            "orphan reaper running (every {:?}, threshold {:?})",
            self.interval,
            self.stale_threshold
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
        log::info!("orphan reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_core::{AcquireOutcome, InMemorySessionStore, NewSession, SessionStatus, TriggeredBy};
    use companion_outbox::{InMemoryEventLog, InMemoryOutbox};

    async fn start_session(sessions: &InMemorySessionStore, trigger: &str) -> String {
        let outcome = sessions
            .acquire_for_trigger(NewSession {
                workspace_id: "ws".to_string(),
                stream_id: "s1".to_string(),
                persona_id: "p1".to_string(),
                trigger_message_id: trigger.to_string(),
                triggered_by: TriggeredBy::Companion,
                server_id: "srv".to_string(),
                initial_sequence: 1,
            })
            .await
            .unwrap();
        match outcome {
            AcquireOutcome::Started(session) => session.id,
            other => panic!("expected start, got {other:?}"),
        }
    }

    fn reaper(sessions: Arc<InMemorySessionStore>) -> OrphanReaper {
        OrphanReaper::new(
            sessions,
            Arc::new(InMemoryEventLog::new()),
            Arc::new(InMemoryOutbox::new()),
            companion_core::ObserverBus::new(),
        )
        .with_timing(Duration::from_millis(10), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn stale_running_session_is_failed() {
        let sessions = Arc::new(InMemorySessionStore::new());
        let session_id = start_session(&sessions, "m1").await;
        sessions.age_heartbeat(&session_id, 120);

        let reaped = reaper(Arc::clone(&sessions)).sweep_once().await;
        assert_eq!(reaped, 1);

        let session = sessions.find_by_id(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.error.as_deref(), Some(ORPHANED_ERROR));
    }

    #[tokio::test]
    async fn fresh_sessions_are_left_alone() {
        let sessions = Arc::new(InMemorySessionStore::new());
        let session_id = start_session(&sessions, "m1").await;

        let reaped = reaper(Arc::clone(&sessions)).sweep_once().await;
        assert_eq!(reaped, 0);
        let session = sessions.find_by_id(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let sessions = Arc::new(InMemorySessionStore::new());
        let session_id = start_session(&sessions, "m1").await;
        sessions.age_heartbeat(&session_id, 120);

        let reaper = reaper(Arc::clone(&sessions));
        assert_eq!(reaper.sweep_once().await, 1);
        assert_eq!(reaper.sweep_once().await, 0);
    }
}
