//! Node selection for task placement.
//!
//! Hard constraints filter the registry snapshot; a configurable scoring
//! strategy ranks the survivors. The engine returns up to `k` candidates,
//! highest score first, ties broken by `node_id` for determinism.

pub mod strategies;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::dispatch::RttTracker;
use crate::engine::task::TaskRequirements;
use crate::node::registry::{NodeInfo, NodeStatus, RegistrySnapshot};
use crate::utils::error::LatticeError;

pub use strategies::{PlacementStrategy, ScoreContext};

/// Load-balancing algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementAlgorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    ResourceAware,
    LatencyOptimized,
}

impl Default for PlacementAlgorithm {
    fn default() -> Self {
        PlacementAlgorithm::WeightedRoundRobin
    }
}

impl fmt::Display for PlacementAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlacementAlgorithm::RoundRobin => "round_robin",
            PlacementAlgorithm::WeightedRoundRobin => "weighted_round_robin",
            PlacementAlgorithm::LeastConnections => "least_connections",
            PlacementAlgorithm::ResourceAware => "resource_aware",
            PlacementAlgorithm::LatencyOptimized => "latency_optimized",
        };
        f.write_str(s)
    }
}

impl FromStr for PlacementAlgorithm {
    type Err = LatticeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(PlacementAlgorithm::RoundRobin),
            "weighted_round_robin" => Ok(PlacementAlgorithm::WeightedRoundRobin),
            "least_connections" => Ok(PlacementAlgorithm::LeastConnections),
            "resource_aware" => Ok(PlacementAlgorithm::ResourceAware),
            "latency_optimized" => Ok(PlacementAlgorithm::LatencyOptimized),
            other => Err(LatticeError::configuration(format!(
                "unknown load balance algorithm: {other}"
            ))),
        }
    }
}

/// Weights for the `resource_aware` score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceWeights {
    pub cpu: f64,
    pub memory: f64,
    pub gpu: f64,
}

impl Default for ResourceWeights {
    fn default() -> Self {
        Self {
            cpu: 0.4,
            memory: 0.3,
            gpu: 0.3,
        }
    }
}

/// Placement policy knobs, mutable at runtime through `update_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub algorithm: PlacementAlgorithm,
    /// Whether degraded nodes receive new tasks.
    pub allow_degraded: bool,
    /// When preferred nodes yield too few candidates, fail instead of
    /// expanding to the full filtered set.
    pub strict_preferred: bool,
    /// Fail a redundant task when fewer than `redundancy` candidates
    /// exist instead of proceeding with what is available.
    pub strict_redundancy: bool,
    pub weights: ResourceWeights,
    /// Minimum number of candidates to return beyond the redundancy need.
    pub top_n: usize,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            algorithm: PlacementAlgorithm::default(),
            allow_degraded: false,
            strict_preferred: false,
            strict_redundancy: false,
            weights: ResourceWeights::default(),
            top_n: 3,
        }
    }
}

/// Ranked placement engine over registry snapshots.
#[derive(Debug)]
pub struct PlacementEngine {
    config: RwLock<PlacementConfig>,
    rotation: AtomicU64,
    rtt: Arc<RttTracker>,
}

impl PlacementEngine {
    pub fn new(config: PlacementConfig, rtt: Arc<RttTracker>) -> Self {
        Self {
            config: RwLock::new(config),
            rotation: AtomicU64::new(0),
            rtt,
        }
    }

    pub fn config(&self) -> PlacementConfig {
        self.config.read().expect("placement config poisoned").clone()
    }

    pub fn update_config<F: FnOnce(&mut PlacementConfig)>(&self, apply: F) {
        let mut config = self.config.write().expect("placement config poisoned");
        apply(&mut config);
    }

    /// Select up to `k` nodes for the given requirements, best first.
    /// Returns an empty vector when no node passes the hard constraints.
    pub fn select(
        &self,
        snapshot: &RegistrySnapshot,
        requirements: &TaskRequirements,
        k: usize,
    ) -> Vec<NodeInfo> {
        let k = k.max(1);
        let config = self.config();

        let filtered: Vec<&NodeInfo> = snapshot
            .nodes
            .iter()
            .filter(|node| Self::passes_hard_constraints(node, requirements, &config))
            .collect();

        // Preferred nodes restrict first; expand when they come up short
        // unless strict_preferred pins the restriction.
        let mut candidates: Vec<&NodeInfo> = if requirements.preferred_nodes.is_empty() {
            filtered.clone()
        } else {
            let preferred: Vec<&NodeInfo> = filtered
                .iter()
                .copied()
                .filter(|n| requirements.preferred_nodes.contains(&n.node_id))
                .collect();
            if preferred.len() >= k || config.strict_preferred {
                preferred
            } else {
                filtered.clone()
            }
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let rotation = self.rotation.fetch_add(1, Ordering::Relaxed);
        let strategy = strategies::for_algorithm(config.algorithm, &config, self.rtt.clone());
        let candidate_count = candidates.len();

        // Stable pre-sort by node_id so candidate indices are deterministic.
        candidates.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        let mut scored: Vec<(f64, &NodeInfo)> = candidates
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let ctx = ScoreContext {
                    candidate_index: index,
                    candidate_count,
                    rotation,
                };
                (strategy.score(node, &ctx), *node)
            })
            .collect();
        scored.sort_by(|(score_a, node_a), (score_b, node_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| node_a.node_id.cmp(&node_b.node_id))
        });

        if config.algorithm == PlacementAlgorithm::WeightedRoundRobin {
            rotate_tied_leaders(&mut scored, rotation);
        }

        scored
            .into_iter()
            .take(k)
            .map(|(_, node)| node.clone())
            .collect()
    }

    fn passes_hard_constraints(
        node: &NodeInfo,
        requirements: &TaskRequirements,
        config: &PlacementConfig,
    ) -> bool {
        let status_ok = match node.status {
            NodeStatus::Active => true,
            NodeStatus::Degraded => config.allow_degraded,
            _ => false,
        };
        if !status_ok {
            return false;
        }
        if !requirements
            .required_capabilities
            .iter()
            .all(|cap| node.capabilities.contains(cap))
        {
            return false;
        }
        if node.resources.cpu_pct_free() < requirements.min_cpu_pct_free {
            return false;
        }
        if node.resources.memory_free_mb < requirements.min_memory_mb {
            return false;
        }
        if requirements.excluded_nodes.contains(&node.node_id) {
            return false;
        }
        true
    }
}

/// Rotate the leading group of score-tied candidates so repeated selects
/// spread load across equally good nodes.
fn rotate_tied_leaders(scored: &mut [(f64, &NodeInfo)], rotation: u64) {
    if scored.len() < 2 {
        return;
    }
    let top = scored[0].0;
    let tied = scored.iter().take_while(|(s, _)| *s == top).count();
    if tied > 1 {
        scored[..tied].rotate_left((rotation as usize) % tied);
    }
}
