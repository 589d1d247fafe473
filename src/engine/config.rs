use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::placement::{PlacementAlgorithm, ResourceWeights};
use crate::utils::error::LatticeError;

/// Top-level orchestrator configuration, loadable from YAML or TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub orchestrator: OrchestratorSection,
    pub network: NetworkSection,
    pub placement: PlacementSection,
    pub task: TaskSection,
    pub liveness: LivenessSection,
    pub queue: QueueSection,
    pub dispatch: DispatchSection,
    pub workers: WorkersSection,
    pub logging: LoggingSection,
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub heartbeat_interval_seconds: u64,
    pub task_default_timeout_seconds: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 30,
            task_default_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub max_nodes: usize,
    pub min_nodes: usize,
    pub load_balance_algorithm: PlacementAlgorithm,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            max_nodes: 1_000,
            min_nodes: 0,
            load_balance_algorithm: PlacementAlgorithm::WeightedRoundRobin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementSection {
    pub allow_degraded: bool,
    pub strict_preferred: bool,
    pub strict_redundancy: bool,
    pub weights: ResourceWeights,
    pub top_n: usize,
}

impl Default for PlacementSection {
    fn default() -> Self {
        Self {
            allow_degraded: false,
            strict_preferred: false,
            strict_redundancy: false,
            weights: ResourceWeights::default(),
            top_n: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSection {
    pub max_retries_default: u32,
    pub placement_grace_seconds: u64,
    pub history_limit: usize,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            max_retries_default: 3,
            placement_grace_seconds: 60,
            history_limit: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSection {
    pub degraded_factor: f64,
    pub offline_factor: f64,
    pub sweep_interval_seconds: u64,
    /// Remove nodes offline longer than this many seconds; absent keeps
    /// them queryable until unregistered.
    pub offline_retention_seconds: Option<u64>,
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self {
            degraded_factor: 1.5,
            offline_factor: 3.0,
            sweep_interval_seconds: 10,
            offline_retention_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_pending: usize,
    pub high_water_fraction: f64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_pending: 100_000,
            high_water_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub timeout_seconds: u64,
    pub retries: u32,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    /// Dispatch worker pool size; 0 means twice the CPU core count.
    pub dispatch_workers: usize,
    /// Deadline sweep cadence.
    pub deadline_tick_seconds: u64,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            dispatch_workers: 0,
            deadline_tick_seconds: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// Runtime-mutable subset of the configuration. Everything else requires
/// a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub load_balance_algorithm: Option<PlacementAlgorithm>,
    pub allow_degraded: Option<bool>,
    pub strict_preferred: Option<bool>,
    pub strict_redundancy: Option<bool>,
    pub weights: Option<ResourceWeights>,
    pub degraded_factor: Option<f64>,
    pub offline_factor: Option<f64>,
    pub placement_grace_seconds: Option<u64>,
    pub max_nodes: Option<usize>,
    pub min_nodes: Option<usize>,
}

impl OrchestratorConfig {
    pub fn from_yaml(path: &str) -> Result<Self, LatticeError> {
        let contents = fs::read_to_string(path)?;
        let config: OrchestratorConfig = serde_yaml::from_str(&contents)
            .map_err(|e| LatticeError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(path: &str) -> Result<Self, LatticeError> {
        let contents = fs::read_to_string(path)?;
        let config: OrchestratorConfig =
            toml::from_str(&contents).map_err(|e| LatticeError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn defaults() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), LatticeError> {
        if self.orchestrator.heartbeat_interval_seconds == 0 {
            return Err(LatticeError::configuration(
                "heartbeat_interval_seconds must be positive",
            ));
        }
        if self.liveness.degraded_factor >= self.liveness.offline_factor {
            return Err(LatticeError::configuration(
                "liveness.degraded_factor must be below offline_factor",
            ));
        }
        if !(0.0..=1.0).contains(&self.queue.high_water_fraction) {
            return Err(LatticeError::configuration(
                "queue.high_water_fraction must be in [0, 1]",
            ));
        }
        if self.network.min_nodes > self.network.max_nodes {
            return Err(LatticeError::configuration(
                "network.min_nodes must not exceed max_nodes",
            ));
        }
        Ok(())
    }

    /// Apply a runtime patch, validating the result.
    pub fn apply_patch(&mut self, patch: &ConfigPatch) -> Result<(), LatticeError> {
        let mut next = self.clone();
        if let Some(algorithm) = patch.load_balance_algorithm {
            next.network.load_balance_algorithm = algorithm;
        }
        if let Some(allow_degraded) = patch.allow_degraded {
            next.placement.allow_degraded = allow_degraded;
        }
        if let Some(strict_preferred) = patch.strict_preferred {
            next.placement.strict_preferred = strict_preferred;
        }
        if let Some(strict_redundancy) = patch.strict_redundancy {
            next.placement.strict_redundancy = strict_redundancy;
        }
        if let Some(weights) = patch.weights {
            next.placement.weights = weights;
        }
        if let Some(factor) = patch.degraded_factor {
            next.liveness.degraded_factor = factor;
        }
        if let Some(factor) = patch.offline_factor {
            next.liveness.offline_factor = factor;
        }
        if let Some(grace) = patch.placement_grace_seconds {
            next.task.placement_grace_seconds = grace;
        }
        if let Some(max_nodes) = patch.max_nodes {
            next.network.max_nodes = max_nodes;
        }
        if let Some(min_nodes) = patch.min_nodes {
            next.network.min_nodes = min_nodes;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator.heartbeat_interval_seconds)
    }

    pub fn placement_grace(&self) -> Duration {
        Duration::from_secs(self.task.placement_grace_seconds)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.timeout_seconds)
    }

    pub fn dispatch_worker_count(&self) -> usize {
        if self.workers.dispatch_workers > 0 {
            self.workers.dispatch_workers
        } else {
            2 * std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::defaults();
        assert!(config.validate().is_ok());
        assert_eq!(config.orchestrator.heartbeat_interval_seconds, 30);
        assert_eq!(config.task.history_limit, 10_000);
        assert_eq!(
            config.network.load_balance_algorithm,
            PlacementAlgorithm::WeightedRoundRobin
        );
    }

    #[test]
    fn patch_applies_and_validates() {
        let mut config = OrchestratorConfig::defaults();
        let patch = ConfigPatch {
            load_balance_algorithm: Some(PlacementAlgorithm::ResourceAware),
            allow_degraded: Some(true),
            max_nodes: Some(10),
            ..ConfigPatch::default()
        };
        config.apply_patch(&patch).unwrap();
        assert_eq!(
            config.network.load_balance_algorithm,
            PlacementAlgorithm::ResourceAware
        );
        assert!(config.placement.allow_degraded);

        // A patch breaking an invariant is rejected wholesale.
        let bad = ConfigPatch {
            min_nodes: Some(100),
            ..ConfigPatch::default()
        };
        assert!(config.apply_patch(&bad).is_err());
        assert_eq!(config.network.min_nodes, 0);
    }

    #[test]
    fn yaml_round_trip() {
        let config = OrchestratorConfig::defaults();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: OrchestratorConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            parsed.orchestrator.heartbeat_interval_seconds,
            config.orchestrator.heartbeat_interval_seconds
        );
    }
}
