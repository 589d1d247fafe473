//! Terminal-transition callbacks.
//!
//! When a submitted task carried a `callback_url`, the notification is a
//! side effect of the terminal event, delivered by this bus subscriber —
//! never on the task engine's threads. The sink is pluggable; the
//! reference deployment posts JSON over HTTP from its transport adapter.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::events::Event;

/// Terminal notification payload.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackRecord {
    pub task_id: String,
    pub state: &'static str,
    pub node_id: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub error: Option<String>,
}

/// Destination for callback notifications.
#[async_trait]
pub trait CallbackSink: Send + Sync + fmt::Debug {
    async fn notify(&self, url: &str, record: &CallbackRecord);
}

/// Default sink: log and drop. Embedders provide a real transport.
#[derive(Debug, Default)]
pub struct LogCallbackSink;

#[async_trait]
impl CallbackSink for LogCallbackSink {
    async fn notify(&self, url: &str, record: &CallbackRecord) {
        debug!(url, task_id = %record.task_id, state = record.state, "callback notification");
    }
}

/// Bus subscriber that forwards terminal task events to the sink.
#[derive(Debug)]
pub struct CallbackNotifier {
    sink: Arc<dyn CallbackSink>,
}

impl CallbackNotifier {
    pub fn new(sink: Arc<dyn CallbackSink>) -> Self {
        Self { sink }
    }

    pub async fn run(
        self,
        mut events: broadcast::Receiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.handle(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "callback notifier lagged, notifications lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&self, event: &Event) {
        let (url, record) = match event {
            Event::TaskCompleted {
                task_id,
                node_id,
                elapsed_ms,
                callback_url: Some(url),
                ..
            } => (
                url.clone(),
                CallbackRecord {
                    task_id: task_id.clone(),
                    state: "completed",
                    node_id: Some(node_id.clone()),
                    elapsed_ms: Some(*elapsed_ms),
                    error: None,
                },
            ),
            Event::TaskFailed {
                task_id,
                class,
                message,
                callback_url: Some(url),
                ..
            } => (
                url.clone(),
                CallbackRecord {
                    task_id: task_id.clone(),
                    state: "failed",
                    node_id: None,
                    elapsed_ms: None,
                    error: Some(format!("{class}: {message}")),
                },
            ),
            Event::TaskCancelled {
                task_id,
                callback_url: Some(url),
                ..
            } => (
                url.clone(),
                CallbackRecord {
                    task_id: task_id.clone(),
                    state: "cancelled",
                    node_id: None,
                    elapsed_ms: None,
                    error: None,
                },
            ),
            _ => return,
        };
        self.sink.notify(&url, &record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::ErrorClass;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(String, CallbackRecord)>>,
    }

    #[async_trait]
    impl CallbackSink for RecordingSink {
        async fn notify(&self, url: &str, record: &CallbackRecord) {
            self.seen
                .lock()
                .unwrap()
                .push((url.to_string(), record.clone()));
        }
    }

    #[tokio::test]
    async fn every_terminal_state_with_a_url_notifies() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = CallbackNotifier::new(sink.clone());

        notifier
            .handle(&Event::TaskCompleted {
                task_id: "t1".into(),
                node_id: "n1".into(),
                elapsed_ms: 10,
                callback_url: Some("cb://done".into()),
                at_ms: 0,
            })
            .await;
        notifier
            .handle(&Event::TaskFailed {
                task_id: "t2".into(),
                class: ErrorClass::Timeout,
                message: "deadline passed".into(),
                callback_url: Some("cb://failed".into()),
                at_ms: 0,
            })
            .await;
        notifier
            .handle(&Event::TaskCancelled {
                task_id: "t3".into(),
                callback_url: Some("cb://gone".into()),
                at_ms: 0,
            })
            .await;
        // No url, no notification.
        notifier
            .handle(&Event::TaskCancelled {
                task_id: "t4".into(),
                callback_url: None,
                at_ms: 0,
            })
            .await;

        let seen = sink.seen.lock().unwrap();
        let states: Vec<&str> = seen.iter().map(|(_, r)| r.state).collect();
        assert_eq!(states, vec!["completed", "failed", "cancelled"]);
        assert_eq!(seen[2].0, "cb://gone");
    }
}
