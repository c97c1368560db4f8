//! Observer fanout for trace events.
//!
//! A flat list of observers invoked in registration order. A failing
//! observer is logged and skipped; it never blocks the others or the run.

use std::sync::Arc;

use async_trait::async_trait;

use crate::events::TraceEvent;

#[async_trait]
pub trait TraceObserver: Send + Sync {
    /// Short name used in failure logs.
    fn name(&self) -> &str;

    async fn on_event(&self, event: &TraceEvent) -> Result<(), String>;
}

/// Fans every event out to all attached observers.
#[derive(Default, Clone)]
pub struct ObserverBus {
    observers: Vec<Arc<dyn TraceObserver>>,
}

impl ObserverBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, observer: Arc<dyn TraceObserver>) {
        self.observers.push(observer);
    }

    pub fn with(mut self, observer: Arc<dyn TraceObserver>) -> Self {
        self.attach(observer);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub async fn emit(&self, event: TraceEvent) {
        for observer in &self.observers {
            if let Err(error) = observer.on_event(&event).await {
                log::warn!(
                    "[{}] observer '{}' failed: {}",
                    event.session_id(),
                    observer.name(),
                    error
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl TraceObserver for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_event(&self, _event: &TraceEvent) -> Result<(), String> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl TraceObserver for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_event(&self, _event: &TraceEvent) -> Result<(), String> {
            Err("always fails".to_string())
        }
    }

    #[tokio::test]
    async fn failing_observer_does_not_block_others() {
        let counting = Arc::new(Counting {
            seen: AtomicUsize::new(0),
        });
        let bus = ObserverBus::new()
            .with(Arc::new(Failing))
            .with(counting.clone());

        bus.emit(TraceEvent::Thinking {
            session_id: "sess-1".to_string(),
            content: "x".to_string(),
        })
        .await;

        assert_eq!(counting.seen.load(Ordering::SeqCst), 1);
    }
}
