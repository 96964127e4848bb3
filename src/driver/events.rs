//! Broadcast fan-out for task events.
//!
//! Each subscriber gets its own bounded queue fed by a single publisher, so
//! one slow reader can never block the others: when a subscriber's queue is
//! full the event is dropped for that subscriber only.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::plugin::TaskEvent;

/// Queue depth per subscriber.
const EVENT_QUEUE_DEPTH: usize = 64;

/// Event broadcaster.
#[derive(Default)]
pub struct Eventer {
    subscribers: Mutex<Vec<mpsc::Sender<TaskEvent>>>,
}

impl Eventer {
    /// Create an eventer with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its queue.
    pub fn subscribe(&self) -> mpsc::Receiver<TaskEvent> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish an event to every live subscriber.
    pub fn emit(&self, event: TaskEvent) {
        debug!(task_id = %event.task_id, message = %event.message, "emitting task event");
        self.subscribers.lock().retain(|tx| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                // Slow reader: drop this event for them, keep the subscription.
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(task_id = %event.task_id, "subscriber queue full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Drop all subscriptions, closing every subscriber's queue.
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }

    /// Number of live subscribers.
    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::SystemTime;

    fn event(message: &str) -> TaskEvent {
        TaskEvent {
            task_id: "t1".into(),
            task_name: "vm".into(),
            alloc_id: "a1".into(),
            timestamp: SystemTime::now(),
            message: message.into(),
            annotations: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_the_event() {
        let eventer = Eventer::new();
        let mut first = eventer.subscribe();
        let mut second = eventer.subscribe();

        eventer.emit(event("image downloading"));

        assert_eq!(first.recv().await.unwrap().message, "image downloading");
        assert_eq!(second.recv().await.unwrap().message, "image downloading");
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let eventer = Eventer::new();
        let rx = eventer.subscribe();
        let mut live = eventer.subscribe();
        drop(rx);

        eventer.emit(event("one"));
        assert_eq!(eventer.subscriber_count(), 1);
        assert_eq!(live.recv().await.unwrap().message, "one");
    }

    #[tokio::test]
    async fn test_full_queue_drops_event_but_keeps_subscriber() {
        let eventer = Eventer::new();
        let mut rx = eventer.subscribe();

        for i in 0..EVENT_QUEUE_DEPTH + 10 {
            eventer.emit(event(&format!("event-{}", i)));
        }
        // Overflow events were dropped, the subscription survives.
        assert_eq!(eventer.subscriber_count(), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.message, "event-0");

        eventer.close();
        let mut drained = 1;
        while rx.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, EVENT_QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let eventer = Eventer::new();
        let mut rx = eventer.subscribe();
        eventer.close();
        assert!(rx.recv().await.is_none());
    }
}
