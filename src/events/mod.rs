//! Bounded fan-out of lifecycle and topology events.
//!
//! [`EventBus`] is a thin wrapper around [`tokio::sync::broadcast`].
//! Publishers never block: when a subscriber falls behind, the channel
//! drops its oldest events and the subscriber observes a lag notice.
//! Per-publisher ordering is preserved; across publishers events may
//! interleave.

pub mod callbacks;

pub use callbacks::{CallbackNotifier, CallbackRecord, CallbackSink, LogCallbackSink};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::task::{ErrorClass, TaskPriority};
use crate::node::registry::NodeStatus;

/// Lifecycle and topology events emitted by the control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    NodeRegistered {
        node_id: String,
        at_ms: u64,
    },
    NodeUnregistered {
        node_id: String,
        at_ms: u64,
    },
    NodeStatusChanged {
        node_id: String,
        from: NodeStatus,
        to: NodeStatus,
        at_ms: u64,
    },
    NodeOffline {
        node_id: String,
        at_ms: u64,
    },
    TaskSubmitted {
        task_id: String,
        priority: TaskPriority,
        at_ms: u64,
    },
    TaskScheduled {
        task_id: String,
        nodes: Vec<String>,
        at_ms: u64,
    },
    TaskCompleted {
        task_id: String,
        node_id: String,
        elapsed_ms: u64,
        callback_url: Option<String>,
        at_ms: u64,
    },
    TaskFailed {
        task_id: String,
        class: ErrorClass,
        message: String,
        callback_url: Option<String>,
        at_ms: u64,
    },
    TaskCancelled {
        task_id: String,
        callback_url: Option<String>,
        at_ms: u64,
    },
}

/// Broadcast channel for control-plane events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all subscribers. Never blocks; a send with no
    /// subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Subscribe from this point onward.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_fan_out_in_publish_order() {
        let bus = EventBus::new(8);
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.publish(Event::NodeRegistered {
            node_id: "n1".into(),
            at_ms: 1,
        });
        bus.publish(Event::NodeOffline {
            node_id: "n1".into(),
            at_ms: 2,
        });

        for rx in [&mut rx_a, &mut rx_b] {
            assert!(matches!(
                rx.recv().await.unwrap(),
                Event::NodeRegistered { .. }
            ));
            assert!(matches!(rx.recv().await.unwrap(), Event::NodeOffline { .. }));
        }
    }

    #[tokio::test]
    async fn slow_subscribers_lose_oldest_events() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(Event::TaskCancelled {
                task_id: format!("t{i}"),
                callback_url: None,
                at_ms: i,
            });
        }
        // The first recv reports the lag, then the newest two arrive.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(matches!(rx.recv().await, Ok(Event::TaskCancelled { .. })));
    }
}
