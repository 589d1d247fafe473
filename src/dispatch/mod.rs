//! Delivery of scheduled tasks to their assigned nodes.
//!
//! The transport itself is pluggable ([`NodeTransport`]); the dispatcher
//! owns the retry/timeout policy around it and the per-node RTT estimate
//! consumed by the `latency_optimized` placement strategy.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::engine::task::{ErrorClass, TaskPriority, TaskRequirements};
use crate::node::registry::Endpoint;

/// RTT EWMA smoothing factor.
const RTT_ALPHA: f64 = 0.2;

/// Transport-level failures, as reported by a [`NodeTransport`].
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Could not reach the node.
    Network(String),
    /// Reached the node but it cannot take work right now.
    Unavailable(String),
    /// The node affirmatively refused the task. Not retried inline.
    Rejected(String),
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Network(_) => ErrorClass::NetworkError,
            TransportError::Unavailable(_) => ErrorClass::NodeFailure,
            TransportError::Rejected(_) => ErrorClass::NodeRejected,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TransportError::Network(m)
            | TransportError::Unavailable(m)
            | TransportError::Rejected(m) => m,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Network(m) => write!(f, "network error: {m}"),
            TransportError::Unavailable(m) => write!(f, "node unavailable: {m}"),
            TransportError::Rejected(m) => write!(f, "node rejected: {m}"),
        }
    }
}

/// Envelope shipped to a node for one assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub task_id: String,
    pub task_type: String,
    pub priority: TaskPriority,
    pub requirements: TaskRequirements,
    pub input_data: serde_json::Value,
    pub timeout_secs: u64,
    pub deadline_ms: Option<u64>,
    /// Zero-based retry attempt, for node-side idempotency hints.
    pub attempt: u32,
}

/// Node-facing transport. The reference deployment speaks HTTP/JSON, but
/// the core only needs these two calls; both carry a deadline enforced by
/// the dispatcher.
#[async_trait]
pub trait NodeTransport: Send + Sync + fmt::Debug {
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        payload: &DispatchPayload,
    ) -> Result<(), TransportError>;

    async fn cancel(&self, endpoint: &Endpoint, task_id: &str) -> Result<(), TransportError>;
}

/// Per-node dispatch round-trip EWMA.
#[derive(Debug, Default)]
pub struct RttTracker {
    ewma_ms: DashMap<String, f64>,
}

impl RttTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node_id: &str, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1_000.0;
        self.ewma_ms
            .entry(node_id.to_string())
            .and_modify(|ewma| *ewma = (1.0 - RTT_ALPHA) * *ewma + RTT_ALPHA * sample)
            .or_insert(sample);
    }

    pub fn ewma_ms(&self, node_id: &str) -> Option<f64> {
        self.ewma_ms.get(node_id).map(|e| *e.value())
    }

    pub fn forget(&self, node_id: &str) {
        self.ewma_ms.remove(node_id);
    }
}

/// Inline retry policy around one delivery attempt.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Per-attempt budget.
    pub timeout: Duration,
    /// Inline retries on transport errors, beyond the first attempt.
    pub retries: u32,
    pub backoff_base: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 2,
            backoff_base: Duration::from_millis(500),
        }
    }
}

/// Ships assignments to nodes and reports how delivery settled.
#[derive(Debug)]
pub struct Dispatcher {
    transport: Arc<dyn NodeTransport>,
    rtt: Arc<RttTracker>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn NodeTransport>, config: DispatchConfig) -> Self {
        Self {
            transport,
            rtt: Arc::new(RttTracker::new()),
            config,
        }
    }

    pub fn rtt(&self) -> Arc<RttTracker> {
        self.rtt.clone()
    }

    /// Deliver one assignment. Retries transport errors inline with
    /// jittered exponential backoff; an affirmative rejection is final.
    pub async fn deliver(
        &self,
        node_id: &str,
        endpoint: &Endpoint,
        payload: &DispatchPayload,
    ) -> Result<(), (ErrorClass, String)> {
        let mut last: (ErrorClass, String) = (
            ErrorClass::NetworkError,
            "no dispatch attempt made".to_string(),
        );
        for attempt in 0..=self.config.retries {
            let started = Instant::now();
            match timeout(self.config.timeout, self.transport.dispatch(endpoint, payload)).await {
                Ok(Ok(())) => {
                    self.rtt.record(node_id, started.elapsed());
                    metrics::counter!("lattice.dispatch.delivered_total").increment(1);
                    return Ok(());
                }
                Ok(Err(err @ TransportError::Rejected(_))) => {
                    metrics::counter!("lattice.dispatch.rejected_total").increment(1);
                    return Err((err.class(), err.message().to_string()));
                }
                Ok(Err(err)) => {
                    debug!(node_id, %endpoint, attempt, error = %err, "dispatch attempt failed");
                    last = (err.class(), err.message().to_string());
                }
                Err(_) => {
                    debug!(node_id, %endpoint, attempt, "dispatch attempt timed out");
                    last = (
                        ErrorClass::NetworkError,
                        format!("dispatch to {endpoint} timed out"),
                    );
                }
            }
            if attempt < self.config.retries {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }
        metrics::counter!("lattice.dispatch.failed_total").increment(1);
        Err(last)
    }

    /// Best-effort cancel with the same per-attempt deadline. Failure is
    /// logged, never propagated: the task is finalized locally regardless.
    pub async fn cancel_best_effort(&self, node_id: &str, endpoint: &Endpoint, task_id: &str) {
        match timeout(self.config.timeout, self.transport.cancel(endpoint, task_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(node_id, task_id, error = %err, "node cancel failed");
            }
            Err(_) => {
                warn!(node_id, task_id, "node cancel timed out");
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(10));
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(exp + jitter)
    }
}

/// In-process transport that accepts everything and records what it saw.
/// Used by the demo binary and as a test double.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    dispatched: Mutex<Vec<(Endpoint, DispatchPayload)>>,
    cancelled: Mutex<Vec<(Endpoint, String)>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> Vec<(Endpoint, DispatchPayload)> {
        self.dispatched.lock().expect("loopback poisoned").clone()
    }

    pub fn cancelled(&self) -> Vec<(Endpoint, String)> {
        self.cancelled.lock().expect("loopback poisoned").clone()
    }
}

#[async_trait]
impl NodeTransport for LoopbackTransport {
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        payload: &DispatchPayload,
    ) -> Result<(), TransportError> {
        self.dispatched
            .lock()
            .expect("loopback poisoned")
            .push((endpoint.clone(), payload.clone()));
        Ok(())
    }

    async fn cancel(&self, endpoint: &Endpoint, task_id: &str) -> Result<(), TransportError> {
        self.cancelled
            .lock()
            .expect("loopback poisoned")
            .push((endpoint.clone(), task_id.to_string()));
        Ok(())
    }
}
