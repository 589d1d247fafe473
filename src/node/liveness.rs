//! Heartbeat-age sweeps over the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::node::registry::{NodeRegistry, NodeStatus};

/// Liveness thresholds, expressed as multiples of the heartbeat interval.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub heartbeat_interval: Duration,
    /// `age >= degraded_factor * heartbeat_interval` marks a node degraded.
    pub degraded_factor: f64,
    /// `age >= offline_factor * heartbeat_interval` marks a node offline.
    pub offline_factor: f64,
    pub sweep_interval: Duration,
    /// Remove nodes that have been offline longer than this. `None`
    /// disables the sweep; offline nodes then stay queryable until an
    /// explicit unregister.
    pub offline_retention: Option<Duration>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            degraded_factor: 1.5,
            offline_factor: 3.0,
            sweep_interval: Duration::from_secs(10),
            offline_retention: None,
        }
    }
}

/// Result of one sweep: what changed, and which nodes need their assigned
/// tasks failed over.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub newly_offline: Vec<String>,
    pub newly_degraded: Vec<String>,
    pub healed: Vec<String>,
    pub removed: Vec<String>,
}

/// Periodically scans the registry and drives liveness transitions.
///
/// The monitor never fails the process: a sweep only reads heartbeat ages
/// and flips statuses. Task failover for newly offline nodes is the
/// caller's job (the orchestrator feeds the report to the task engine).
#[derive(Debug)]
pub struct LivenessMonitor {
    registry: Arc<NodeRegistry>,
    clock: SharedClock,
    config: std::sync::RwLock<LivenessConfig>,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<NodeRegistry>, clock: SharedClock, config: LivenessConfig) -> Self {
        Self {
            registry,
            clock,
            config: std::sync::RwLock::new(config),
        }
    }

    pub fn config(&self) -> LivenessConfig {
        self.config.read().expect("liveness config poisoned").clone()
    }

    /// Adjust thresholds at runtime (`update_config`).
    pub fn update_config<F: FnOnce(&mut LivenessConfig)>(&self, apply: F) {
        let mut config = self.config.write().expect("liveness config poisoned");
        apply(&mut config);
    }

    /// One pass over the fleet. Pure state transition, no I/O.
    pub fn sweep(&self) -> SweepReport {
        let config = self.config();
        let now_ms = self.clock.now_ms();
        let interval_ms = config.heartbeat_interval.as_millis() as f64;
        let degraded_ms = (interval_ms * config.degraded_factor) as u64;
        let offline_ms = (interval_ms * config.offline_factor) as u64;

        let mut report = SweepReport::default();
        for node in self.registry.snapshot().nodes {
            // Maintenance and error are operator-owned; never overridden.
            if matches!(node.status, NodeStatus::Maintenance | NodeStatus::Error) {
                continue;
            }
            let age_ms = now_ms.saturating_sub(node.last_heartbeat_ms);

            if age_ms >= offline_ms {
                if node.status != NodeStatus::Offline {
                    if self.registry.mark_offline(&node.node_id) {
                        warn!(node_id = %node.node_id, age_ms, "node heartbeat lost, marking offline");
                        report.newly_offline.push(node.node_id.clone());
                    }
                } else if let Some(retention) = config.offline_retention {
                    if age_ms >= offline_ms + retention.as_millis() as u64 {
                        info!(node_id = %node.node_id, "removing long-offline node");
                        let _ = self.registry.unregister(&node.node_id);
                        report.removed.push(node.node_id.clone());
                    }
                }
            } else if age_ms >= degraded_ms {
                if self.registry.mark_degraded(&node.node_id) {
                    warn!(node_id = %node.node_id, age_ms, "node heartbeat stale, marking degraded");
                    report.newly_degraded.push(node.node_id.clone());
                }
            } else if self.registry.heal_degraded(&node.node_id) {
                report.healed.push(node.node_id.clone());
            }
        }

        metrics::gauge!("lattice.liveness.offline_nodes")
            .set(self.registry.snapshot().count_by_status(NodeStatus::Offline) as f64);
        report
    }

    /// Ticker loop used in production; tests call [`Self::sweep`] directly
    /// with a manual clock.
    pub async fn run<F>(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, mut on_report: F)
    where
        F: FnMut(SweepReport) + Send,
    {
        let mut ticker = tokio::time::interval(self.config().sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    on_report(self.sweep());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventBus;
    use crate::node::registry::{Endpoint, HeartbeatSample, NodeDescriptor};

    fn setup() -> (Arc<ManualClock>, Arc<NodeRegistry>, LivenessMonitor) {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new());
        let registry = Arc::new(NodeRegistry::new(clock.clone(), EventBus::new(64)));
        let config = LivenessConfig {
            heartbeat_interval: Duration::from_secs(10),
            ..LivenessConfig::default()
        };
        let monitor = LivenessMonitor::new(registry.clone(), clock.clone(), config);
        (clock, registry, monitor)
    }

    fn register(registry: &NodeRegistry, id: &str) {
        registry
            .register(NodeDescriptor {
                node_id: id.to_string(),
                endpoint: Endpoint {
                    host: "127.0.0.1".into(),
                    port: 9000,
                },
                node_type: "worker".into(),
                capabilities: Default::default(),
                version: String::new(),
                location: None,
                metadata: serde_json::Value::Null,
                agents: vec![],
            })
            .unwrap();
    }

    #[test]
    fn sweep_degrades_then_offlines() {
        let (clock, registry, monitor) = setup();
        register(&registry, "n1");

        // Fresh heartbeat: nothing happens.
        let report = monitor.sweep();
        assert!(report.newly_degraded.is_empty() && report.newly_offline.is_empty());

        // Past 1.5x interval: degraded.
        clock.advance(Duration::from_secs(16));
        let report = monitor.sweep();
        assert_eq!(report.newly_degraded, vec!["n1".to_string()]);
        assert_eq!(registry.get("n1").unwrap().status, NodeStatus::Degraded);

        // Past 3x interval: offline.
        clock.advance(Duration::from_secs(15));
        let report = monitor.sweep();
        assert_eq!(report.newly_offline, vec!["n1".to_string()]);
        assert_eq!(registry.get("n1").unwrap().status, NodeStatus::Offline);
    }

    #[test]
    fn sweep_heals_degraded_after_fresh_heartbeat() {
        let (clock, registry, monitor) = setup();
        register(&registry, "n1");
        clock.advance(Duration::from_secs(16));
        monitor.sweep();
        assert_eq!(registry.get("n1").unwrap().status, NodeStatus::Degraded);

        registry.heartbeat("n1", HeartbeatSample::default()).unwrap();
        // Heartbeat already healed; a sweep right after keeps it active.
        let report = monitor.sweep();
        assert!(report.newly_degraded.is_empty());
        assert_eq!(registry.get("n1").unwrap().status, NodeStatus::Active);
    }

    #[test]
    fn maintenance_is_never_overridden() {
        let (clock, registry, monitor) = setup();
        register(&registry, "n1");
        registry.set_status("n1", NodeStatus::Maintenance).unwrap();
        clock.advance(Duration::from_secs(120));
        let report = monitor.sweep();
        assert!(report.newly_offline.is_empty());
        assert_eq!(registry.get("n1").unwrap().status, NodeStatus::Maintenance);
    }

    #[test]
    fn long_offline_nodes_are_swept_out() {
        let (clock, registry, monitor) = setup();
        monitor.update_config(|c| c.offline_retention = Some(Duration::from_secs(60)));
        register(&registry, "n1");
        clock.advance(Duration::from_secs(31));
        monitor.sweep();
        assert_eq!(registry.get("n1").unwrap().status, NodeStatus::Offline);

        clock.advance(Duration::from_secs(120));
        let report = monitor.sweep();
        assert_eq!(report.removed, vec!["n1".to_string()]);
        assert!(registry.get("n1").is_none());
    }
}
