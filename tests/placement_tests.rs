//! Placement filtering and scoring invariants.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{healthy_sample, node};
use lattice::clock::ManualClock;
use lattice::dispatch::RttTracker;
use lattice::events::EventBus;
use lattice::node::liveness::{LivenessConfig, LivenessMonitor};
use lattice::node::registry::{HeartbeatSample, NodeRegistry, ResourceSample};
use lattice::placement::{PlacementAlgorithm, PlacementConfig, PlacementEngine};
use lattice::{NodeStatus, TaskRequirements};

struct Fleet {
    clock: Arc<ManualClock>,
    registry: Arc<NodeRegistry>,
    rtt: Arc<RttTracker>,
}

fn fleet() -> Fleet {
    let clock: Arc<ManualClock> = Arc::new(ManualClock::new());
    let registry = Arc::new(NodeRegistry::new(clock.clone(), EventBus::new(64)));
    Fleet {
        clock,
        registry,
        rtt: Arc::new(RttTracker::new()),
    }
}

fn engine(fleet: &Fleet, algorithm: PlacementAlgorithm) -> PlacementEngine {
    PlacementEngine::new(
        PlacementConfig {
            algorithm,
            ..PlacementConfig::default()
        },
        fleet.rtt.clone(),
    )
}

fn requirements(caps: &[&str]) -> TaskRequirements {
    TaskRequirements {
        required_capabilities: caps.iter().map(|c| c.to_string()).collect(),
        ..TaskRequirements::default()
    }
}

fn add_node(fleet: &Fleet, id: &str, port: u16, caps: &[&str]) {
    fleet.registry.register(node(id, port, caps)).unwrap();
    fleet.registry.heartbeat(id, healthy_sample()).unwrap();
}

#[test]
fn only_capable_active_nodes_are_eligible() {
    let f = fleet();
    add_node(&f, "gpu-1", 9001, &["ai_inference", "gpu"]);
    add_node(&f, "cpu-1", 9002, &["generic"]);
    add_node(&f, "drained", 9003, &["ai_inference"]);
    add_node(&f, "broken", 9004, &["ai_inference"]);
    f.registry.set_status("drained", NodeStatus::Maintenance).unwrap();
    f.registry.set_status("broken", NodeStatus::Error).unwrap();

    let engine = engine(&f, PlacementAlgorithm::WeightedRoundRobin);
    let chosen = engine.select(&f.registry.snapshot(), &requirements(&["ai_inference"]), 5);
    assert_eq!(chosen.len(), 1);
    assert_eq!(chosen[0].node_id, "gpu-1");
}

#[test]
fn degraded_nodes_need_explicit_opt_in() {
    let f = fleet();
    add_node(&f, "n1", 9001, &["compute"]);
    let monitor = LivenessMonitor::new(
        f.registry.clone(),
        f.clock.clone(),
        LivenessConfig {
            heartbeat_interval: Duration::from_secs(10),
            ..LivenessConfig::default()
        },
    );
    f.clock.advance(Duration::from_secs(16));
    monitor.sweep();
    assert_eq!(f.registry.get("n1").unwrap().status, NodeStatus::Degraded);

    let engine = engine(&f, PlacementAlgorithm::WeightedRoundRobin);
    assert!(engine
        .select(&f.registry.snapshot(), &requirements(&["compute"]), 1)
        .is_empty());

    engine.update_config(|c| c.allow_degraded = true);
    let chosen = engine.select(&f.registry.snapshot(), &requirements(&["compute"]), 1);
    assert_eq!(chosen.len(), 1);
}

#[test]
fn excluded_nodes_never_come_back() {
    let f = fleet();
    add_node(&f, "n1", 9001, &[]);
    add_node(&f, "n2", 9002, &[]);

    let engine = engine(&f, PlacementAlgorithm::WeightedRoundRobin);
    let mut reqs = requirements(&[]);
    reqs.excluded_nodes.insert("n1".to_string());
    let chosen = engine.select(&f.registry.snapshot(), &reqs, 5);
    assert_eq!(chosen.len(), 1);
    assert_eq!(chosen[0].node_id, "n2");
}

#[test]
fn resource_floors_filter_thin_nodes() {
    let f = fleet();
    add_node(&f, "thin", 9001, &[]);
    add_node(&f, "roomy", 9002, &[]);
    f.registry
        .heartbeat(
            "thin",
            HeartbeatSample {
                resources: ResourceSample {
                    cpu_pct: 95.0,
                    memory_pct: 90.0,
                    gpu_pct: 0.0,
                    memory_free_mb: 512,
                    load_score: 0.9,
                },
                agents: None,
            },
        )
        .unwrap();

    let engine = engine(&f, PlacementAlgorithm::WeightedRoundRobin);
    let mut reqs = requirements(&[]);
    reqs.min_cpu_pct_free = 20.0;
    reqs.min_memory_mb = 4_096;
    let chosen = engine.select(&f.registry.snapshot(), &reqs, 5);
    assert_eq!(chosen.len(), 1);
    assert_eq!(chosen[0].node_id, "roomy");
}

#[test]
fn preferred_nodes_restrict_then_expand() {
    let f = fleet();
    add_node(&f, "n1", 9001, &[]);
    add_node(&f, "n2", 9002, &[]);
    add_node(&f, "n3", 9003, &[]);

    let engine = engine(&f, PlacementAlgorithm::WeightedRoundRobin);
    let mut reqs = requirements(&[]);
    reqs.preferred_nodes = vec!["n2".to_string()];

    // Enough preferred candidates for k=1: restricted to the preference.
    let chosen = engine.select(&f.registry.snapshot(), &reqs, 1);
    assert_eq!(chosen[0].node_id, "n2");

    // k exceeds the preferred set: expands to the full filtered set.
    let chosen = engine.select(&f.registry.snapshot(), &reqs, 3);
    assert_eq!(chosen.len(), 3);

    // Under strict_preferred the restriction pins, even when short.
    engine.update_config(|c| c.strict_preferred = true);
    let chosen = engine.select(&f.registry.snapshot(), &reqs, 3);
    assert_eq!(chosen.len(), 1);
    assert_eq!(chosen[0].node_id, "n2");
}

#[test]
fn round_robin_rotates_deterministically() {
    let f = fleet();
    add_node(&f, "n1", 9001, &[]);
    add_node(&f, "n2", 9002, &[]);
    add_node(&f, "n3", 9003, &[]);

    let engine = engine(&f, PlacementAlgorithm::RoundRobin);
    let snapshot = f.registry.snapshot();
    let picks: Vec<String> = (0..6)
        .map(|_| engine.select(&snapshot, &requirements(&[]), 1)[0].node_id.clone())
        .collect();
    assert_eq!(picks, vec!["n1", "n2", "n3", "n1", "n2", "n3"]);
}

#[test]
fn weighted_round_robin_prefers_reliable_idle_nodes() {
    let f = fleet();
    add_node(&f, "busy", 9001, &[]);
    add_node(&f, "idle", 9002, &[]);
    f.registry
        .heartbeat(
            "busy",
            HeartbeatSample {
                resources: ResourceSample {
                    load_score: 0.9,
                    ..healthy_sample().resources
                },
                agents: None,
            },
        )
        .unwrap();

    let engine = engine(&f, PlacementAlgorithm::WeightedRoundRobin);
    let chosen = engine.select(&f.registry.snapshot(), &requirements(&[]), 1);
    assert_eq!(chosen[0].node_id, "idle");
}

#[test]
fn least_connections_prefers_unloaded_nodes() {
    let f = fleet();
    add_node(&f, "n1", 9001, &[]);
    add_node(&f, "n2", 9002, &[]);

    let engine = engine(&f, PlacementAlgorithm::LeastConnections);
    let mut snapshot = f.registry.snapshot();
    // Three assignments in flight on n1.
    snapshot
        .nodes
        .iter_mut()
        .find(|n| n.node_id == "n1")
        .unwrap()
        .active_tasks = 3;

    let chosen = engine.select(&snapshot, &requirements(&[]), 1);
    assert_eq!(chosen[0].node_id, "n2");
}

#[test]
fn resource_aware_prefers_headroom() {
    let f = fleet();
    add_node(&f, "hot", 9001, &[]);
    add_node(&f, "cool", 9002, &[]);
    f.registry
        .heartbeat(
            "hot",
            HeartbeatSample {
                resources: ResourceSample {
                    cpu_pct: 90.0,
                    memory_pct: 85.0,
                    gpu_pct: 70.0,
                    memory_free_mb: 8_192,
                    load_score: 0.8,
                },
                agents: None,
            },
        )
        .unwrap();

    let engine = engine(&f, PlacementAlgorithm::ResourceAware);
    let chosen = engine.select(&f.registry.snapshot(), &requirements(&[]), 1);
    assert_eq!(chosen[0].node_id, "cool");
}

#[test]
fn latency_optimized_follows_rtt_ewma() {
    let f = fleet();
    add_node(&f, "far", 9001, &[]);
    add_node(&f, "near", 9002, &[]);
    f.rtt.record("far", Duration::from_millis(250));
    f.rtt.record("near", Duration::from_millis(10));

    let engine = engine(&f, PlacementAlgorithm::LatencyOptimized);
    let chosen = engine.select(&f.registry.snapshot(), &requirements(&[]), 1);
    assert_eq!(chosen[0].node_id, "near");
}

#[test]
fn k_zero_behaves_as_one() {
    let f = fleet();
    add_node(&f, "n1", 9001, &[]);
    let engine = engine(&f, PlacementAlgorithm::WeightedRoundRobin);
    let chosen = engine.select(&f.registry.snapshot(), &requirements(&[]), 0);
    assert_eq!(chosen.len(), 1);
}

#[test]
fn ties_break_lexicographically() {
    let f = fleet();
    add_node(&f, "charlie", 9003, &[]);
    add_node(&f, "alpha", 9001, &[]);
    add_node(&f, "bravo", 9002, &[]);

    // least_connections with identical counts is a pure tie.
    let engine = engine(&f, PlacementAlgorithm::LeastConnections);
    let chosen = engine.select(&f.registry.snapshot(), &requirements(&[]), 3);
    let ids: Vec<&str> = chosen.iter().map(|n| n.node_id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "bravo", "charlie"]);
}

#[test]
fn heartbeat_is_idempotent_on_status() {
    let f = fleet();
    add_node(&f, "n1", 9001, &[]);
    let before = f.registry.get("n1").unwrap();
    f.clock.advance(Duration::from_secs(1));
    f.registry.heartbeat("n1", healthy_sample()).unwrap();
    f.registry.heartbeat("n1", healthy_sample()).unwrap();
    let after = f.registry.get("n1").unwrap();
    assert_eq!(before.status, after.status);
    assert!(after.last_heartbeat_ms >= before.last_heartbeat_ms);
    assert_eq!(before.tasks_completed, after.tasks_completed);
}
