//! Debounced execution with a forced maximum wait.
//!
//! `trigger()` schedules the wrapped action after a quiet period of
//! `debounce`; a burst of triggers keeps deferring it, but once `max_wait`
//! has elapsed since the first pending trigger the action runs regardless.
//! At most one execution is in flight at a time, and triggers arriving
//! during an execution coalesce into one follow-up run.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct DebounceWithMaxWait {
    tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl DebounceWithMaxWait {
    /// Spawn the debounce task around `action`.
    pub fn spawn<F, Fut>(
        debounce: Duration,
        max_wait: Duration,
        cancel: CancellationToken,
        action: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let task = tokio::spawn(async move {
            'outer: loop {
                // Wait for the first trigger of a burst.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => {
                        if received.is_none() {
                            break;
                        }
                    }
                }

                let force_at = tokio::time::Instant::now() + max_wait;
                // Quiet-period loop: every further trigger resets the
                // debounce window, bounded by the forced deadline.
                loop {
                    let quiet_at = tokio::time::Instant::now() + debounce;
                    let deadline = quiet_at.min(force_at);
                    tokio::select! {
                        _ = cancel.cancelled() => break 'outer,
                        _ = tokio::time::sleep_until(deadline) => break,
                        received = rx.recv() => {
                            if received.is_none() {
                                break;
                            }
                            if tokio::time::Instant::now() >= force_at {
                                break;
                            }
                        }
                    }
                }

                action().await;
            }
        });
        Self { tx, task }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_action(counter: Arc<AtomicUsize>) -> impl Fn() -> futures::future::BoxFuture<'static, ()> + Send + Sync {
        move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn burst_of_triggers_coalesces_into_one_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debounce = DebounceWithMaxWait::spawn(
            Duration::from_millis(30),
            Duration::from_millis(500),
            CancellationToken::new(),
            counter_action(Arc::clone(&runs)),
        );

        for _ in 0..5 {
            debounce.trigger();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        debounce.shutdown().await;
    }

    #[tokio::test]
    async fn max_wait_forces_execution_under_constant_triggering() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debounce = DebounceWithMaxWait::spawn(
            Duration::from_millis(40),
            Duration::from_millis(100),
            CancellationToken::new(),
            counter_action(Arc::clone(&runs)),
        );

        // Trigger every 10ms for 300ms: quiet periods never happen, but the
        // forced deadline fires.
        for _ in 0..30 {
            debounce.trigger();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(runs.load(Ordering::SeqCst) >= 2);
        debounce.shutdown().await;
    }

    #[tokio::test]
    async fn no_trigger_means_no_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debounce = DebounceWithMaxWait::spawn(
            Duration::from_millis(10),
            Duration::from_millis(50),
            CancellationToken::new(),
            counter_action(Arc::clone(&runs)),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        debounce.shutdown().await;
    }
}
