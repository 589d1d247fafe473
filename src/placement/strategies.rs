//! Scoring strategy implementations.

use std::fmt;
use std::sync::Arc;

use crate::dispatch::RttTracker;
use crate::node::registry::NodeInfo;
use crate::placement::{PlacementAlgorithm, PlacementConfig, ResourceWeights};

/// Per-candidate scoring context.
#[derive(Debug, Clone, Copy)]
pub struct ScoreContext {
    /// Index of this node in the node_id-sorted candidate list.
    pub candidate_index: usize,
    pub candidate_count: usize,
    /// Per-engine rotating counter, bumped once per selection.
    pub rotation: u64,
}

/// A scoring strategy. Higher score places first.
pub trait PlacementStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn score(&self, node: &NodeInfo, ctx: &ScoreContext) -> f64;
}

pub(crate) fn for_algorithm(
    algorithm: PlacementAlgorithm,
    config: &PlacementConfig,
    rtt: Arc<RttTracker>,
) -> Box<dyn PlacementStrategy> {
    match algorithm {
        PlacementAlgorithm::RoundRobin => Box::new(RoundRobin),
        PlacementAlgorithm::WeightedRoundRobin => Box::new(WeightedRoundRobin),
        PlacementAlgorithm::LeastConnections => Box::new(LeastConnections),
        PlacementAlgorithm::ResourceAware => Box::new(ResourceAware {
            weights: config.weights,
        }),
        PlacementAlgorithm::LatencyOptimized => Box::new(LatencyOptimized { rtt }),
    }
}

/// Deterministic rotation: the candidate at `rotation % n` wins, the next
/// one is second, and so on around the ring.
#[derive(Debug)]
pub struct RoundRobin;

impl PlacementStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn score(&self, _node: &NodeInfo, ctx: &ScoreContext) -> f64 {
        let n = ctx.candidate_count.max(1) as u64;
        let start = ctx.rotation % n;
        let position = (ctx.candidate_index as u64 + n - start) % n;
        -(position as f64)
    }
}

/// Reliability-weighted idle capacity; the default algorithm. Ties rotate
/// in the engine so equally good nodes share the head of the ranking.
#[derive(Debug)]
pub struct WeightedRoundRobin;

impl PlacementStrategy for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn score(&self, node: &NodeInfo, _ctx: &ScoreContext) -> f64 {
        node.reliability_score * (1.0 - node.resources.load_score.clamp(0.0, 1.0))
    }
}

/// Fewest tasks currently assigned.
#[derive(Debug)]
pub struct LeastConnections;

impl PlacementStrategy for LeastConnections {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn score(&self, node: &NodeInfo, _ctx: &ScoreContext) -> f64 {
        -(node.active_tasks as f64)
    }
}

/// Weighted free CPU/memory/GPU headroom.
#[derive(Debug)]
pub struct ResourceAware {
    pub weights: ResourceWeights,
}

impl PlacementStrategy for ResourceAware {
    fn name(&self) -> &'static str {
        "resource_aware"
    }

    fn score(&self, node: &NodeInfo, _ctx: &ScoreContext) -> f64 {
        let r = &node.resources;
        self.weights.cpu * (1.0 - r.cpu_pct / 100.0)
            + self.weights.memory * (1.0 - r.memory_pct / 100.0)
            + self.weights.gpu * (1.0 - r.gpu_pct / 100.0)
    }
}

/// Lowest observed dispatch round-trip. Nodes with no samples yet score
/// as zero-latency so fresh nodes are not starved.
#[derive(Debug)]
pub struct LatencyOptimized {
    pub rtt: Arc<RttTracker>,
}

impl PlacementStrategy for LatencyOptimized {
    fn name(&self) -> &'static str {
        "latency_optimized"
    }

    fn score(&self, node: &NodeInfo, _ctx: &ScoreContext) -> f64 {
        -self.rtt.ewma_ms(&node.node_id).unwrap_or(0.0)
    }
}
