//! The cursor-locked listener.
//!
//! One logical consumer per `listener_id`, enforced by a time-leased cursor
//! row. The listener acquires the lease with backoff, keeps it refreshed
//! from a background task, and walks the outbox forward in batches,
//! persisting partial progress when a handler fails part-way.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::record::{EventRecord, OutboxError, OutboxStore};

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("could not acquire lease for '{listener_id}' after {attempts} attempts")]
    LeaseUnavailable { listener_id: String, attempts: u32 },

    #[error("invalid listener config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

pub type Result<T> = std::result::Result<T, ListenerError>;

/// Outcome of one handler invocation.
#[derive(Debug, Clone)]
pub enum ProcessResult {
    /// Nothing relevant in the batch.
    NoEvents,
    /// Everything up to `new_cursor` is handled.
    Processed { new_cursor: i64 },
    /// Something broke; entries up to `new_cursor` (when present) are
    /// handled and must not be redone.
    Failed { new_cursor: Option<i64>, error: String },
}

/// A consumer of outbox batches. Entries arrive strictly ascending by id.
#[async_trait::async_trait]
pub trait OutboxHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, batch: &[EventRecord], cursor: i64) -> ProcessResult;
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub listener_id: String,
    /// Initial lease duration.
    pub lock_duration: Duration,
    /// Lease refresh cadence; must be strictly less than half the lease.
    pub refresh_interval: Duration,
    /// Attempts at initial lease acquisition before giving up.
    pub max_retries: u32,
    /// Base of the exponential backoff between acquisition attempts.
    pub base_backoff: Duration,
    /// How many outbox entries to pull per fetch.
    pub batch_size: usize,
    /// Fallback poll cadence when no wakeups arrive.
    pub idle_poll: Duration,
}

impl ListenerConfig {
    pub fn new(listener_id: impl Into<String>) -> Self {
        Self {
            listener_id: listener_id.into(),
            lock_duration: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10),
            max_retries: 5,
            base_backoff: Duration::from_millis(250),
            batch_size: 100,
            idle_poll: Duration::from_secs(2),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.refresh_interval.as_millis() * 2 >= self.lock_duration.as_millis() {
            return Err(ListenerError::InvalidConfig(format!(
                "refresh_interval {:?} must be < lock_duration/2 ({:?})",
                self.refresh_interval, self.lock_duration
            )));
        }
        if self.batch_size == 0 {
            return Err(ListenerError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// External wakeup for a running listener. Cheap to clone and hand to the
/// debouncer or to event emitters.
#[derive(Clone, Default)]
pub struct ListenerHandle {
    notify: Arc<Notify>,
}

impl ListenerHandle {
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

pub struct CursorLockedListener {
    store: Arc<dyn OutboxStore>,
    handler: Arc<dyn OutboxHandler>,
    config: ListenerConfig,
    /// Identifies this process as the lease owner.
    owner: String,
    handle: ListenerHandle,
}

impl CursorLockedListener {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        handler: Arc<dyn OutboxHandler>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            store,
            handler,
            config,
            owner: uuid::Uuid::new_v4().to_string(),
            handle: ListenerHandle::default(),
        }
    }

    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    /// Acquire the lease, retrying with exponential backoff plus jitter.
    /// Exhausting `max_retries` is a fatal bootstrap error.
    async fn acquire_lease(&self) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            if self
                .store
                .try_acquire_lease(&self.config.listener_id, &self.owner, self.config.lock_duration)
                .await?
            {
                log::info!(
                    "listener '{}' acquired lease (owner {})",
                    self.config.listener_id,
                    self.owner
                );
                return Ok(());
            }

            attempt += 1;
            if attempt > self.config.max_retries {
                return Err(ListenerError::LeaseUnavailable {
                    listener_id: self.config.listener_id.clone(),
                    attempts: attempt,
                });
            }

            let backoff = backoff_with_jitter(self.config.base_backoff, attempt);
            log::debug!(
                "listener '{}' lease busy, retrying in {:?} (attempt {attempt})",
                self.config.listener_id,
                backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Drain everything currently available, advancing the cursor past
    /// handled entries. Handler failures are logged; partial progress is
    /// persisted so retries don't redo work.
    pub async fn drain_available(&self) -> Result<()> {
        loop {
            let cursor = self.store.load_cursor(&self.config.listener_id).await?;
            let batch = self
                .store
                .fetch_after(cursor, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }

            // A panicking handler must not take the lease down with it.
            let result = std::panic::AssertUnwindSafe(self.handler.process(&batch, cursor))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| ProcessResult::Failed {
                    new_cursor: None,
                    error: "handler panicked".to_string(),
                });

            match result {
                ProcessResult::NoEvents => {
                    // Nothing relevant; skip past the batch so it isn't
                    // refetched forever.
                    if let Some(last) = batch.last() {
                        self.store
                            .advance_cursor(&self.config.listener_id, last.id)
                            .await?;
                    }
                }
                ProcessResult::Processed { new_cursor } => {
                    self.store
                        .advance_cursor(&self.config.listener_id, new_cursor)
                        .await?;
                }
                ProcessResult::Failed { new_cursor, error } => {
                    if let Some(new_cursor) = new_cursor {
                        self.store
                            .advance_cursor(&self.config.listener_id, new_cursor)
                            .await?;
                    }
                    log::error!(
                        "listener '{}' handler '{}' failed: {error}",
                        self.config.listener_id,
                        self.handler.name()
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Run until cancelled. Acquires the lease (fatal on failure), keeps it
    /// refreshed, and processes batches on wakeup or idle poll. The lease
    /// is always released on the way out.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.config.validate()?;
        self.acquire_lease().await?;

        let refresher = {
            let store = Arc::clone(&self.store);
            let listener_id = self.config.listener_id.clone();
            let owner = self.owner.clone();
            let lock_duration = self.config.lock_duration;
            let refresh_interval = self.config.refresh_interval;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(refresh_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            match store.refresh_lease(&listener_id, &owner, lock_duration).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    log::warn!("listener '{listener_id}' lost its lease");
                                }
                                Err(error) => {
                                    // Retried on the next tick.
                                    log::warn!("listener '{listener_id}' lease refresh failed: {error}");
                                }
                            }
                        }
                    }
                }
            })
        };

        let result = loop {
            if let Err(error) = self.drain_available().await {
                break Err(error);
            }
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = self.handle.notify.notified() => {}
                _ = tokio::time::sleep(self.config.idle_poll) => {}
            }
        };

        refresher.abort();
        if let Err(error) = self
            .store
            .release_lease(&self.config.listener_id, &self.owner)
            .await
        {
            log::warn!(
                "listener '{}' failed to release lease: {error}",
                self.config.listener_id
            );
        } else {
            log::info!("listener '{}' released lease", self.config.listener_id);
        }
        result
    }
}

fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(8));
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
    exp + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryOutbox;
    use crate::record::EventLog;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recording {
        seen: Mutex<Vec<i64>>,
        /// Fail when this id is first seen; cleared afterwards.
        fail_on: Mutex<Option<i64>>,
    }

    impl Recording {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_on: Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl OutboxHandler for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn process(&self, batch: &[EventRecord], _cursor: i64) -> ProcessResult {
            let mut handled = None;
            for record in batch {
                let fail = { *self.fail_on.lock().unwrap() };
                if fail == Some(record.id) {
                    *self.fail_on.lock().unwrap() = None;
                    return ProcessResult::Failed {
                        new_cursor: handled,
                        error: "scripted failure".to_string(),
                    };
                }
                self.seen.lock().unwrap().push(record.id);
                handled = Some(record.id);
            }
            match handled {
                Some(new_cursor) => ProcessResult::Processed { new_cursor },
                None => ProcessResult::NoEvents,
            }
        }
    }

    fn listener(
        store: Arc<InMemoryOutbox>,
        handler: Arc<Recording>,
    ) -> CursorLockedListener {
        let mut config = ListenerConfig::new("test-listener");
        config.base_backoff = Duration::from_millis(1);
        config.idle_poll = Duration::from_millis(10);
        CursorLockedListener::new(store, handler, config)
    }

    #[tokio::test]
    async fn drains_in_ascending_order_and_advances_cursor() {
        let store = Arc::new(InMemoryOutbox::new());
        for i in 0..5 {
            store.append("message_created", json!({ "n": i })).await.unwrap();
        }
        let handler = Arc::new(Recording::new());
        let listener = listener(Arc::clone(&store), Arc::clone(&handler));

        listener.acquire_lease().await.unwrap();
        listener.drain_available().await.unwrap();

        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(store.load_cursor("test-listener").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn partial_progress_survives_handler_failure() {
        let store = Arc::new(InMemoryOutbox::new());
        for i in 0..4 {
            store.append("message_created", json!({ "n": i })).await.unwrap();
        }
        let handler = Arc::new(Recording::new());
        *handler.fail_on.lock().unwrap() = Some(3);
        let listener = listener(Arc::clone(&store), Arc::clone(&handler));

        listener.acquire_lease().await.unwrap();
        listener.drain_available().await.unwrap();
        // Entries 1 and 2 were handled before the failure; the cursor
        // reflects that.
        assert_eq!(store.load_cursor("test-listener").await.unwrap(), 2);

        // The retry resumes at entry 3 without redoing 1 and 2.
        listener.drain_available().await.unwrap();
        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(store.load_cursor("test-listener").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn acquisition_gives_up_after_max_retries() {
        let store = Arc::new(InMemoryOutbox::new());
        // Another owner holds the lease.
        assert!(store
            .try_acquire_lease("test-listener", "other", Duration::from_secs(60))
            .await
            .unwrap());

        let handler = Arc::new(Recording::new());
        let mut config = ListenerConfig::new("test-listener");
        config.max_retries = 2;
        config.base_backoff = Duration::from_millis(1);
        let listener = CursorLockedListener::new(store, handler, config);

        let error = listener.acquire_lease().await.unwrap_err();
        assert!(matches!(error, ListenerError::LeaseUnavailable { .. }));
    }

    #[tokio::test]
    async fn run_releases_lease_on_cancel() {
        let store = Arc::new(InMemoryOutbox::new());
        let handler = Arc::new(Recording::new());
        let listener = Arc::new(listener(Arc::clone(&store), handler));

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let listener = Arc::clone(&listener);
            let cancel = cancel.clone();
            async move { listener.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        // The lease is free again.
        assert!(store
            .try_acquire_lease("test-listener", "newcomer", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn config_rejects_slow_refresh() {
        let mut config = ListenerConfig::new("x");
        config.lock_duration = Duration::from_secs(10);
        config.refresh_interval = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }
}
