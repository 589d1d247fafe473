//! Shared test harness: manual clock plus a scriptable node transport.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lattice::clock::ManualClock;
use lattice::dispatch::{DispatchPayload, NodeTransport, TransportError};
use lattice::store::Store;
use lattice::{
    Endpoint, HeartbeatSample, NodeDescriptor, Orchestrator, OrchestratorConfig, ResourceSample,
    TaskPriority, TaskRequirements, TaskSpec,
};

/// Per-endpoint scripted behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Accept,
    Reject,
    NetworkFail,
}

/// Transport double that records traffic, fails on request, and tracks
/// how many dispatches were in flight at once.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    behaviors: dashmap::DashMap<String, Behavior>,
    dispatched: Mutex<Vec<(String, DispatchPayload)>>,
    cancelled: Mutex<Vec<(String, String)>>,
    dispatch_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, endpoint: &Endpoint, behavior: Behavior) {
        self.behaviors.insert(endpoint.to_string(), behavior);
    }

    /// Hold each dispatch open for this long, so concurrent deliveries
    /// become observable through [`Self::max_in_flight`].
    pub fn set_dispatch_delay(&self, delay: Duration) {
        *self.dispatch_delay.lock().unwrap() = Some(delay);
    }

    pub fn dispatched(&self) -> Vec<(String, DispatchPayload)> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<(String, String)> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Highest number of dispatches that overlapped in time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeTransport for ScriptedTransport {
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        payload: &DispatchPayload,
    ) -> Result<(), TransportError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.dispatch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let key = endpoint.to_string();
        let result = match self
            .behaviors
            .get(&key)
            .map(|b| *b.value())
            .unwrap_or(Behavior::Accept)
        {
            Behavior::Accept => {
                self.dispatched
                    .lock()
                    .unwrap()
                    .push((key, payload.clone()));
                Ok(())
            }
            Behavior::Reject => Err(TransportError::Rejected("scripted rejection".into())),
            Behavior::NetworkFail => Err(TransportError::Network("scripted outage".into())),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn cancel(&self, endpoint: &Endpoint, task_id: &str) -> Result<(), TransportError> {
        self.cancelled
            .lock()
            .unwrap()
            .push((endpoint.to_string(), task_id.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<ScriptedTransport>,
}

pub fn harness(config: OrchestratorConfig) -> Harness {
    harness_with_store(config, None)
}

pub fn harness_with_store(config: OrchestratorConfig, store: Option<Arc<dyn Store>>) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let transport = Arc::new(ScriptedTransport::new());
    let orchestrator = Arc::new(
        Orchestrator::with_parts(config, transport.clone(), clock.clone(), store)
            .expect("orchestrator construction"),
    );
    Harness {
        orchestrator,
        clock,
        transport,
    }
}

/// Fast-dispatch test config: tiny inline-retry backoff, short grace.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::defaults();
    config.dispatch.retries = 0;
    config.dispatch.timeout_seconds = 1;
    config
}

pub fn endpoint(port: u16) -> Endpoint {
    Endpoint {
        host: "127.0.0.1".into(),
        port,
    }
}

pub fn node(id: &str, port: u16, caps: &[&str]) -> NodeDescriptor {
    NodeDescriptor {
        node_id: id.to_string(),
        endpoint: endpoint(port),
        node_type: "worker".into(),
        capabilities: caps.iter().map(|c| c.to_string()).collect(),
        version: "1.0.0".into(),
        location: None,
        metadata: serde_json::Value::Null,
        agents: vec![],
    }
}

pub fn healthy_sample() -> HeartbeatSample {
    HeartbeatSample {
        resources: ResourceSample {
            cpu_pct: 20.0,
            memory_pct: 30.0,
            gpu_pct: 0.0,
            memory_free_mb: 16_384,
            load_score: 0.2,
        },
        agents: None,
    }
}

pub fn spec(task_type: &str, priority: TaskPriority, caps: &[&str]) -> TaskSpec {
    TaskSpec {
        task_id: String::new(),
        task_type: task_type.to_string(),
        priority,
        requirements: TaskRequirements {
            required_capabilities: caps.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>(),
            ..TaskRequirements::default()
        },
        input_data: serde_json::json!({"payload": true}),
        timeout_secs: 30,
        deadline_ms: None,
        max_retries: None,
        callback_url: None,
    }
}
