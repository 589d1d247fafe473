use std::collections::BTreeSet;
use std::fmt;
use std::sync::RwLock;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::events::{Event, EventBus};
use crate::utils::error::LatticeError;

/// Reliability EWMA smoothing factor.
const RELIABILITY_ALPHA: f64 = 0.1;

/// Address the dispatcher uses to reach a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Node operational states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Degraded,
    Maintenance,
    Offline,
    Error,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Active => "active",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Maintenance => "maintenance",
            NodeStatus::Offline => "offline",
            NodeStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl NodeStatus {
    /// Operator-driven transition graph. Monitor and heartbeat transitions
    /// go through dedicated registry methods, not through `set_status`.
    pub fn operator_transition_allowed(from: NodeStatus, to: NodeStatus) -> bool {
        match to {
            // Escalation is always allowed.
            NodeStatus::Error => true,
            // Anything except an escalated node can be drained.
            NodeStatus::Maintenance => from != NodeStatus::Error,
            // Leaving maintenance is the only operator path back to active.
            NodeStatus::Active => from == NodeStatus::Maintenance,
            // Degraded and offline belong to the liveness monitor.
            NodeStatus::Degraded | NodeStatus::Offline => false,
        }
    }
}

/// Last reported resource telemetry for a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    /// CPU utilization percentage, 0..=100.
    pub cpu_pct: f64,
    /// Memory utilization percentage, 0..=100.
    pub memory_pct: f64,
    /// GPU utilization percentage, 0..=100.
    pub gpu_pct: f64,
    /// Free memory in megabytes.
    pub memory_free_mb: u64,
    /// Composite load score in [0, 1], lower is idler.
    pub load_score: f64,
}

impl ResourceSample {
    pub fn cpu_pct_free(&self) -> f64 {
        (100.0 - self.cpu_pct).max(0.0)
    }
}

/// Worker process inside a node. Purely descriptive: the core routes to
/// nodes, and the node picks an agent. Agent capabilities are folded into
/// the node's capability set for placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub agent_type: String,
    pub status: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub specialized_models: Vec<String>,
    #[serde(default = "default_efficiency")]
    pub efficiency_score: f64,
}

fn default_efficiency() -> f64 {
    1.0
}

/// Registration request from a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub agents: Vec<AgentInfo>,
}

/// Heartbeat payload: telemetry plus an optional agent roster refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatSample {
    pub resources: ResourceSample,
    #[serde(default)]
    pub agents: Option<Vec<AgentInfo>>,
}

/// Authoritative node record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub endpoint: Endpoint,
    pub node_type: String,
    /// Own capabilities unioned with every agent's capabilities.
    pub capabilities: BTreeSet<String>,
    pub version: String,
    pub location: Option<String>,
    pub metadata: serde_json::Value,
    pub status: NodeStatus,
    pub resources: ResourceSample,
    /// EWMA of task success over this node, clamped to [0, 1].
    pub reliability_score: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Tasks currently assigned to this node.
    pub active_tasks: u32,
    pub last_heartbeat_ms: u64,
    pub registered_at_ms: u64,
    pub agents: Vec<AgentInfo>,
    /// Set when the liveness monitor, not an operator, degraded or
    /// offlined this node. Heartbeats only heal liveness-caused states.
    #[serde(default)]
    pub liveness_flagged: bool,
}

impl NodeInfo {
    fn from_descriptor(desc: NodeDescriptor, now_ms: u64) -> Self {
        let mut capabilities = desc.capabilities;
        for agent in &desc.agents {
            capabilities.extend(agent.capabilities.iter().cloned());
        }
        Self {
            node_id: desc.node_id,
            endpoint: desc.endpoint,
            node_type: desc.node_type,
            capabilities,
            version: desc.version,
            location: desc.location,
            metadata: desc.metadata,
            status: NodeStatus::Active,
            resources: ResourceSample::default(),
            reliability_score: 1.0,
            tasks_completed: 0,
            tasks_failed: 0,
            active_tasks: 0,
            last_heartbeat_ms: now_ms,
            registered_at_ms: now_ms,
            agents: desc.agents,
            liveness_flagged: false,
        }
    }
}

/// Outcome of a `register` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// New node inserted.
    Registered,
    /// Same node, same endpoint: no-op refresh.
    Refreshed,
    /// Same node, new endpoint: endpoint rotated, counters and
    /// reliability preserved (the node is presumed to have restarted).
    EndpointRotated,
}

/// Point-in-time view of the fleet.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub nodes: Vec<NodeInfo>,
    pub taken_at_ms: u64,
}

impl RegistrySnapshot {
    pub fn count_by_status(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }
}

/// Single source of truth for node and agent topology.
///
/// Writers serialize per node through the dashmap entry lock and share a
/// read-side gate; `snapshot` takes the gate exclusively, so the returned
/// view is consistent at a single point in time while heartbeats stay
/// concurrent with each other and with dispatch.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: DashMap<String, NodeInfo>,
    snapshot_gate: RwLock<()>,
    clock: SharedClock,
    bus: EventBus,
}

impl NodeRegistry {
    pub fn new(clock: SharedClock, bus: EventBus) -> Self {
        Self {
            nodes: DashMap::new(),
            snapshot_gate: RwLock::new(()),
            clock,
            bus,
        }
    }

    /// Register a new node or refresh an existing one.
    pub fn register(&self, desc: NodeDescriptor) -> Result<RegisterOutcome, LatticeError> {
        if desc.node_id.is_empty() {
            return Err(LatticeError::invalid_input("node_id must not be empty"));
        }
        let _gate = self.snapshot_gate.read().expect("snapshot gate poisoned");
        let now_ms = self.clock.now_ms();

        if let Some(mut entry) = self.nodes.get_mut(&desc.node_id) {
            let outcome = if entry.endpoint == desc.endpoint {
                RegisterOutcome::Refreshed
            } else {
                info!(
                    node_id = %desc.node_id,
                    old = %entry.endpoint,
                    new = %desc.endpoint,
                    "node re-registered with new endpoint"
                );
                entry.endpoint = desc.endpoint;
                RegisterOutcome::EndpointRotated
            };
            // Descriptor fields refresh; counters and reliability survive.
            entry.node_type = desc.node_type;
            entry.version = desc.version;
            entry.location = desc.location;
            entry.metadata = desc.metadata;
            let mut capabilities = desc.capabilities;
            for agent in &desc.agents {
                capabilities.extend(agent.capabilities.iter().cloned());
            }
            entry.capabilities = capabilities;
            entry.agents = desc.agents;
            entry.last_heartbeat_ms = entry.last_heartbeat_ms.max(now_ms);
            entry.status = NodeStatus::Active;
            entry.liveness_flagged = false;
            return Ok(outcome);
        }

        let node_id = desc.node_id.clone();
        let info = NodeInfo::from_descriptor(desc, now_ms);
        self.nodes.insert(node_id.clone(), info);
        metrics::gauge!("lattice.nodes.registered").set(self.nodes.len() as f64);
        self.bus.publish(Event::NodeRegistered {
            node_id,
            at_ms: now_ms,
        });
        Ok(RegisterOutcome::Registered)
    }

    /// Refresh liveness and telemetry for a node. The hottest write path:
    /// one dashmap entry lock, no global exclusion.
    pub fn heartbeat(&self, node_id: &str, sample: HeartbeatSample) -> Result<(), LatticeError> {
        let _gate = self.snapshot_gate.read().expect("snapshot gate poisoned");
        let now_ms = self.clock.now_ms();
        let mut entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| LatticeError::not_found(format!("unknown node {node_id}")))?;

        entry.last_heartbeat_ms = entry.last_heartbeat_ms.max(now_ms);
        entry.resources = sample.resources;
        if let Some(agents) = sample.agents {
            let mut capabilities: BTreeSet<String> = entry.capabilities.clone();
            for agent in &agents {
                capabilities.extend(agent.capabilities.iter().cloned());
            }
            entry.capabilities = capabilities;
            entry.agents = agents;
        }

        // Heartbeat-driven healing: only liveness-caused degradation heals.
        // Maintenance and error are sticky until an operator intervenes.
        if entry.liveness_flagged
            && matches!(entry.status, NodeStatus::Offline | NodeStatus::Degraded)
        {
            let from = entry.status;
            entry.status = NodeStatus::Active;
            entry.liveness_flagged = false;
            drop(entry);
            debug!(node_id, %from, "node healed by heartbeat");
            self.bus.publish(Event::NodeStatusChanged {
                node_id: node_id.to_string(),
                from,
                to: NodeStatus::Active,
                at_ms: now_ms,
            });
        }
        Ok(())
    }

    /// Operator status change, validated against the transition graph.
    pub fn set_status(&self, node_id: &str, new_status: NodeStatus) -> Result<(), LatticeError> {
        let _gate = self.snapshot_gate.read().expect("snapshot gate poisoned");
        let mut entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| LatticeError::not_found(format!("unknown node {node_id}")))?;

        let from = entry.status;
        if from == new_status {
            return Ok(());
        }
        if !NodeStatus::operator_transition_allowed(from, new_status) {
            return Err(LatticeError::InvalidTransition {
                from: from.to_string(),
                to: new_status.to_string(),
            });
        }
        entry.status = new_status;
        entry.liveness_flagged = false;
        drop(entry);
        self.bus.publish(Event::NodeStatusChanged {
            node_id: node_id.to_string(),
            from,
            to: new_status,
            at_ms: self.clock.now_ms(),
        });
        Ok(())
    }

    /// Remove a node. The caller is responsible for failing tasks still
    /// assigned to it.
    pub fn unregister(&self, node_id: &str) -> Result<NodeInfo, LatticeError> {
        let _gate = self.snapshot_gate.read().expect("snapshot gate poisoned");
        let (_, info) = self
            .nodes
            .remove(node_id)
            .ok_or_else(|| LatticeError::not_found(format!("unknown node {node_id}")))?;
        metrics::gauge!("lattice.nodes.registered").set(self.nodes.len() as f64);
        self.bus.publish(Event::NodeUnregistered {
            node_id: node_id.to_string(),
            at_ms: self.clock.now_ms(),
        });
        Ok(info)
    }

    /// Consistent point-in-time view. Excludes concurrent writers for the
    /// duration of the clone; used by placement, metrics and API queries.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let _gate = self.snapshot_gate.write().expect("snapshot gate poisoned");
        RegistrySnapshot {
            nodes: self.nodes.iter().map(|e| e.value().clone()).collect(),
            taken_at_ms: self.clock.now_ms(),
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.get(node_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Monitor transition: mark a node degraded because its heartbeat aged.
    pub(crate) fn mark_degraded(&self, node_id: &str) -> bool {
        let _gate = self.snapshot_gate.read().expect("snapshot gate poisoned");
        let Some(mut entry) = self.nodes.get_mut(node_id) else {
            return false;
        };
        if entry.status != NodeStatus::Active {
            return false;
        }
        entry.status = NodeStatus::Degraded;
        entry.liveness_flagged = true;
        drop(entry);
        self.bus.publish(Event::NodeStatusChanged {
            node_id: node_id.to_string(),
            from: NodeStatus::Active,
            to: NodeStatus::Degraded,
            at_ms: self.clock.now_ms(),
        });
        true
    }

    /// Monitor transition: mark a node offline. Maintenance and error are
    /// never overridden.
    pub(crate) fn mark_offline(&self, node_id: &str) -> bool {
        let _gate = self.snapshot_gate.read().expect("snapshot gate poisoned");
        let Some(mut entry) = self.nodes.get_mut(node_id) else {
            return false;
        };
        if matches!(
            entry.status,
            NodeStatus::Maintenance | NodeStatus::Error | NodeStatus::Offline
        ) {
            return false;
        }
        let from = entry.status;
        entry.status = NodeStatus::Offline;
        entry.liveness_flagged = true;
        drop(entry);
        let at_ms = self.clock.now_ms();
        self.bus.publish(Event::NodeStatusChanged {
            node_id: node_id.to_string(),
            from,
            to: NodeStatus::Offline,
            at_ms,
        });
        self.bus.publish(Event::NodeOffline {
            node_id: node_id.to_string(),
            at_ms,
        });
        true
    }

    /// Monitor transition: heal a liveness-only degradation once the
    /// heartbeat is fresh again.
    pub(crate) fn heal_degraded(&self, node_id: &str) -> bool {
        let _gate = self.snapshot_gate.read().expect("snapshot gate poisoned");
        let Some(mut entry) = self.nodes.get_mut(node_id) else {
            return false;
        };
        if entry.status != NodeStatus::Degraded || !entry.liveness_flagged {
            return false;
        }
        entry.status = NodeStatus::Active;
        entry.liveness_flagged = false;
        drop(entry);
        self.bus.publish(Event::NodeStatusChanged {
            node_id: node_id.to_string(),
            from: NodeStatus::Degraded,
            to: NodeStatus::Active,
            at_ms: self.clock.now_ms(),
        });
        true
    }

    /// A task was handed to this node.
    pub(crate) fn record_dispatch(&self, node_id: &str) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.active_tasks = entry.active_tasks.saturating_add(1);
        }
    }

    /// A dispatched assignment settled; fold the outcome into the node's
    /// counters and reliability EWMA.
    pub(crate) fn record_outcome(&self, node_id: &str, success: bool) {
        let Some(mut entry) = self.nodes.get_mut(node_id) else {
            return;
        };
        entry.active_tasks = entry.active_tasks.saturating_sub(1);
        if success {
            entry.tasks_completed += 1;
        } else {
            entry.tasks_failed += 1;
        }
        let observation = if success { 1.0 } else { 0.0 };
        entry.reliability_score = ((1.0 - RELIABILITY_ALPHA) * entry.reliability_score
            + RELIABILITY_ALPHA * observation)
            .clamp(0.0, 1.0);
    }

    /// An assignment was abandoned without a node-reported outcome
    /// (cancelled, or superseded by a redundant sibling).
    pub(crate) fn release_assignment(&self, node_id: &str) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.active_tasks = entry.active_tasks.saturating_sub(1);
        }
    }

    /// Restore a node record verbatim (crash recovery). The node comes
    /// back `offline` until its first heartbeat.
    pub(crate) fn restore(&self, mut info: NodeInfo) {
        info.status = NodeStatus::Offline;
        info.liveness_flagged = true;
        info.active_tasks = 0;
        self.nodes.insert(info.node_id.clone(), info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn registry() -> (Arc<ManualClock>, NodeRegistry) {
        let clock = Arc::new(ManualClock::new());
        let bus = EventBus::new(64);
        let reg = NodeRegistry::new(clock.clone(), bus);
        (clock, reg)
    }

    fn descriptor(id: &str, port: u16) -> NodeDescriptor {
        NodeDescriptor {
            node_id: id.to_string(),
            endpoint: Endpoint {
                host: "127.0.0.1".into(),
                port,
            },
            node_type: "worker".into(),
            capabilities: BTreeSet::from(["ai_inference".to_string()]),
            version: "1.0".into(),
            location: None,
            metadata: serde_json::Value::Null,
            agents: vec![],
        }
    }

    #[test]
    fn register_is_idempotent_for_same_endpoint() {
        let (_clock, reg) = registry();
        assert_eq!(
            reg.register(descriptor("n1", 9000)).unwrap(),
            RegisterOutcome::Registered
        );
        reg.record_dispatch("n1");
        reg.record_outcome("n1", true);
        let before = reg.get("n1").unwrap();

        assert_eq!(
            reg.register(descriptor("n1", 9000)).unwrap(),
            RegisterOutcome::Refreshed
        );
        let after = reg.get("n1").unwrap();
        assert_eq!(after.tasks_completed, before.tasks_completed);
        assert_eq!(after.reliability_score, before.reliability_score);
    }

    #[test]
    fn endpoint_rotation_preserves_counters() {
        let (_clock, reg) = registry();
        reg.register(descriptor("n1", 9000)).unwrap();
        reg.record_dispatch("n1");
        reg.record_outcome("n1", false);

        assert_eq!(
            reg.register(descriptor("n1", 9001)).unwrap(),
            RegisterOutcome::EndpointRotated
        );
        let node = reg.get("n1").unwrap();
        assert_eq!(node.endpoint.port, 9001);
        assert_eq!(node.tasks_failed, 1);
        assert!(node.reliability_score < 1.0);
    }

    #[test]
    fn heartbeat_heals_liveness_offline_but_not_maintenance() {
        let (clock, reg) = registry();
        reg.register(descriptor("n1", 9000)).unwrap();
        assert!(reg.mark_offline("n1"));
        clock.advance(Duration::from_secs(1));
        reg.heartbeat("n1", HeartbeatSample::default()).unwrap();
        assert_eq!(reg.get("n1").unwrap().status, NodeStatus::Active);

        reg.set_status("n1", NodeStatus::Maintenance).unwrap();
        reg.heartbeat("n1", HeartbeatSample::default()).unwrap();
        assert_eq!(reg.get("n1").unwrap().status, NodeStatus::Maintenance);
    }

    #[test]
    fn set_status_rejects_monitor_owned_transitions() {
        let (_clock, reg) = registry();
        reg.register(descriptor("n1", 9000)).unwrap();
        let err = reg.set_status("n1", NodeStatus::Offline).unwrap_err();
        assert!(matches!(err, LatticeError::InvalidTransition { .. }));
    }

    #[test]
    fn reliability_stays_clamped() {
        let (_clock, reg) = registry();
        reg.register(descriptor("n1", 9000)).unwrap();
        for _ in 0..100 {
            reg.record_dispatch("n1");
            reg.record_outcome("n1", false);
        }
        let node = reg.get("n1").unwrap();
        assert!(node.reliability_score >= 0.0 && node.reliability_score <= 1.0);
        assert_eq!(node.tasks_failed, 100);
    }

    #[test]
    fn heartbeat_unknown_node_errors() {
        let (_clock, reg) = registry();
        let err = reg
            .heartbeat("ghost", HeartbeatSample::default())
            .unwrap_err();
        assert!(matches!(err, LatticeError::NotFound(_)));
    }
}
