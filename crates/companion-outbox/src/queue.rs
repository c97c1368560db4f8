//! Job queue contract and the in-memory implementation.
//!
//! FIFO per named queue, at-least-once delivery, retry with exponential
//! backoff. Handlers are idempotent by construction (session acquisition is
//! unique per trigger), so redelivery is safe.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue '{0}' is closed")]
    Closed(String),

    #[error("queue '{0}' already has a worker")]
    WorkerTaken(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// One unit of work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    /// 1-based delivery attempt.
    pub attempt: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn send(&self, queue: &str, payload: serde_json::Value) -> Result<()>;
}

/// Processes jobs from one queue. A returned error triggers redelivery.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> std::result::Result<(), String>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

struct Channel {
    tx: mpsc::UnboundedSender<Job>,
    rx: Option<mpsc::UnboundedReceiver<Job>>,
}

/// In-memory queue: one unbounded channel per queue name, one worker per
/// queue.
#[derive(Default)]
pub struct InMemoryJobQueue {
    channels: Mutex<HashMap<String, Channel>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, queue: &str) -> mpsc::UnboundedSender<Job> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(queue.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                Channel { tx, rx: Some(rx) }
            })
            .tx
            .clone()
    }

    /// Claim the consumer side of a queue and process jobs until cancelled.
    /// Failed jobs are retried in place with exponential backoff, then
    /// dropped (with an error log) once `max_attempts` is exhausted.
    pub async fn run_worker(
        &self,
        queue: &str,
        handler: std::sync::Arc<dyn JobHandler>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut rx = {
            let mut channels = self.channels.lock().unwrap();
            let channel = channels.entry(queue.to_string()).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                Channel { tx, rx: Some(rx) }
            });
            channel
                .rx
                .take()
                .ok_or_else(|| QueueError::WorkerTaken(queue.to_string()))?
        };

        log::info!("worker started for queue '{queue}'");
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let mut job = job;
            loop {
                match handler.handle(&job).await {
                    Ok(()) => break,
                    Err(error) if job.attempt < policy.max_attempts => {
                        let backoff = policy
                            .base_backoff
                            .saturating_mul(1u32 << (job.attempt - 1).min(8));
                        log::warn!(
                            "job {} on '{}' failed (attempt {}): {error}; retrying in {:?}",
                            job.id,
                            queue,
                            job.attempt,
                            backoff
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        job.attempt += 1;
                    }
                    Err(error) => {
                        log::error!(
                            "job {} on '{}' dropped after {} attempts: {error}",
                            job.id,
                            queue,
                            job.attempt
                        );
                        break;
                    }
                }
            }
        }
        log::info!("worker stopped for queue '{queue}'");
        Ok(())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn send(&self, queue: &str, payload: serde_json::Value) -> Result<()> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            payload,
            attempt: 1,
        };
        self.sender(queue)
            .send(job)
            .map_err(|_| QueueError::Closed(queue.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
        order: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, job: &Job) -> std::result::Result<(), String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err("transient".to_string());
            }
            self.order.lock().unwrap().push(job.payload["n"].as_i64().unwrap());
            Ok(())
        }
    }

    #[tokio::test]
    async fn jobs_are_fifo_per_queue() {
        let queue = Arc::new(InMemoryJobQueue::new());
        for n in 0..4 {
            queue.send("q", json!({ "n": n })).await.unwrap();
        }
        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            order: Mutex::new(Vec::new()),
        });

        let cancel = CancellationToken::new();
        let worker = tokio::spawn({
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            async move {
                queue
                    .run_worker("q", handler, RetryPolicy::default(), cancel)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        worker.await.unwrap().unwrap();

        assert_eq!(*handler.order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_jobs_are_retried_with_backoff() {
        let queue = Arc::new(InMemoryJobQueue::new());
        queue.send("q", json!({ "n": 7 })).await.unwrap();
        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 2,
            order: Mutex::new(Vec::new()),
        });

        let cancel = CancellationToken::new();
        let worker = tokio::spawn({
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            async move {
                let policy = RetryPolicy {
                    max_attempts: 3,
                    base_backoff: Duration::from_millis(5),
                };
                queue.run_worker("q", handler, policy, cancel).await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        worker.await.unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*handler.order.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn second_worker_on_same_queue_is_rejected() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            order: Mutex::new(Vec::new()),
        });

        let cancel = CancellationToken::new();
        let first = tokio::spawn({
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            async move {
                queue
                    .run_worker("q", handler, RetryPolicy::default(), cancel)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = queue
            .run_worker("q", handler, RetryPolicy::default(), cancel.clone())
            .await;
        assert!(matches!(second, Err(QueueError::WorkerTaken(_))));

        cancel.cancel();
        first.await.unwrap().unwrap();
    }
}
