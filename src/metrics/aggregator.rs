//! Sliding-window aggregation of task outcomes and fleet telemetry.
//!
//! Fed from the event bus, read by `get_metrics` and `get_status`. The
//! window is a ring of fixed-width buckets; expired buckets fall off as
//! the clock advances, so throughput and success rate always describe the
//! recent window, not process lifetime.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::warn;

use crate::clock::SharedClock;
use crate::engine::scheduler::TaskCounts;
use crate::events::Event;
use crate::node::registry::{NodeStatus, RegistrySnapshot};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub window: Duration,
    pub bucket: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            bucket: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    start_ms: u64,
    completed: u64,
    failed: u64,
    response_times_ms: Vec<u64>,
}

/// Network metrics snapshot exposed through the API.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkMetrics {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub degraded_nodes: usize,
    pub maintenance_nodes: usize,
    pub offline_nodes: usize,
    pub error_nodes: usize,
    pub tasks: TaskCounts,
    /// Completions per minute over the sliding window.
    pub throughput_per_min: f64,
    /// completed / (completed + failed) over the window; 1.0 when idle.
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    /// Mean load score of active nodes, in [0, 1].
    pub network_utilization: f64,
    pub window_seconds: u64,
    pub uptime_seconds: u64,
}

/// Folds per-task events into windowed rollups.
#[derive(Debug)]
pub struct MetricsAggregator {
    clock: SharedClock,
    config: AggregatorConfig,
    started_at_ms: u64,
    buckets: Mutex<VecDeque<Bucket>>,
}

impl MetricsAggregator {
    pub fn new(clock: SharedClock, config: AggregatorConfig) -> Self {
        let started_at_ms = clock.now_ms();
        Self {
            clock,
            config,
            started_at_ms,
            buckets: Mutex::new(VecDeque::new()),
        }
    }

    /// Fold one event into the current bucket.
    pub fn observe(&self, event: &Event) {
        match event {
            Event::TaskCompleted { elapsed_ms, .. } => {
                let now_ms = self.clock.now_ms();
                let mut buckets = self.buckets.lock().expect("aggregator poisoned");
                let bucket = self.current_bucket(&mut buckets, now_ms);
                bucket.completed += 1;
                bucket.response_times_ms.push(*elapsed_ms);
            }
            Event::TaskFailed { .. } => {
                let now_ms = self.clock.now_ms();
                let mut buckets = self.buckets.lock().expect("aggregator poisoned");
                self.current_bucket(&mut buckets, now_ms).failed += 1;
            }
            _ => {}
        }
    }

    /// Compute the rolled-up view against a registry snapshot and the
    /// engine's task counts.
    pub fn snapshot(&self, registry: &RegistrySnapshot, tasks: TaskCounts) -> NetworkMetrics {
        let now_ms = self.clock.now_ms();
        let window_ms = self.config.window.as_millis() as u64;

        let (completed, failed, mut response_times) = {
            let mut buckets = self.buckets.lock().expect("aggregator poisoned");
            Self::expire(&mut buckets, now_ms, window_ms);
            let mut completed = 0u64;
            let mut failed = 0u64;
            let mut response_times: Vec<u64> = Vec::new();
            for bucket in buckets.iter() {
                completed += bucket.completed;
                failed += bucket.failed;
                response_times.extend_from_slice(&bucket.response_times_ms);
            }
            (completed, failed, response_times)
        };

        let window_minutes = self.config.window.as_secs_f64() / 60.0;
        let throughput_per_min = if window_minutes > 0.0 {
            completed as f64 / window_minutes
        } else {
            0.0
        };
        let success_rate = if completed + failed > 0 {
            completed as f64 / (completed + failed) as f64
        } else {
            1.0
        };
        let avg_response_time_ms = if response_times.is_empty() {
            0.0
        } else {
            response_times.iter().sum::<u64>() as f64 / response_times.len() as f64
        };
        let p95_response_time_ms = percentile(&mut response_times, 0.95);

        let active: Vec<_> = registry
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Active)
            .collect();
        let network_utilization = if active.is_empty() {
            0.0
        } else {
            active
                .iter()
                .map(|n| n.resources.load_score.clamp(0.0, 1.0))
                .sum::<f64>()
                / active.len() as f64
        };

        NetworkMetrics {
            total_nodes: registry.nodes.len(),
            active_nodes: active.len(),
            degraded_nodes: registry.count_by_status(NodeStatus::Degraded),
            maintenance_nodes: registry.count_by_status(NodeStatus::Maintenance),
            offline_nodes: registry.count_by_status(NodeStatus::Offline),
            error_nodes: registry.count_by_status(NodeStatus::Error),
            tasks,
            throughput_per_min,
            success_rate,
            avg_response_time_ms,
            p95_response_time_ms,
            network_utilization,
            window_seconds: self.config.window.as_secs(),
            uptime_seconds: now_ms.saturating_sub(self.started_at_ms) / 1_000,
        }
    }

    /// Event bus consumer loop. Lagged subscriptions only cost windowed
    /// accuracy, never correctness of the task engine.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.observe(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "metrics aggregator lagged behind event bus");
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

    fn current_bucket<'a>(
        &self,
        buckets: &'a mut VecDeque<Bucket>,
        now_ms: u64,
    ) -> &'a mut Bucket {
        let bucket_ms = self.config.bucket.as_millis() as u64;
        let window_ms = self.config.window.as_millis() as u64;
        let start_ms = (now_ms / bucket_ms) * bucket_ms;
        Self::expire(buckets, now_ms, window_ms);
        let needs_new = buckets.back().map_or(true, |b| b.start_ms != start_ms);
        if needs_new {
            buckets.push_back(Bucket {
                start_ms,
                ..Bucket::default()
            });
        }
        buckets.back_mut().expect("bucket just pushed")
    }

    fn expire(buckets: &mut VecDeque<Bucket>, now_ms: u64, window_ms: u64) {
        while buckets
            .front()
            .map_or(false, |b| b.start_ms + window_ms <= now_ms)
        {
            buckets.pop_front();
        }
    }
}

fn percentile(samples: &mut [u64], q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.sort_unstable();
    let rank = ((samples.len() as f64 * q).ceil() as usize).clamp(1, samples.len());
    samples[rank - 1] as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::task::ErrorClass;

    fn aggregator() -> (Arc<ManualClock>, MetricsAggregator) {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new());
        let agg = MetricsAggregator::new(clock.clone(), AggregatorConfig::default());
        (clock, agg)
    }

    fn completed(elapsed_ms: u64) -> Event {
        Event::TaskCompleted {
            task_id: "t".into(),
            node_id: "n".into(),
            elapsed_ms,
            callback_url: None,
            at_ms: 0,
        }
    }

    fn empty_registry() -> RegistrySnapshot {
        RegistrySnapshot {
            nodes: Vec::new(),
            taken_at_ms: 0,
        }
    }

    #[test]
    fn success_rate_and_latency_roll_up() {
        let (_clock, agg) = aggregator();
        agg.observe(&completed(100));
        agg.observe(&completed(200));
        agg.observe(&Event::TaskFailed {
            task_id: "t".into(),
            class: ErrorClass::Timeout,
            message: "late".into(),
            callback_url: None,
            at_ms: 0,
        });

        let metrics = agg.snapshot(&empty_registry(), TaskCounts::default());
        assert!((metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.avg_response_time_ms - 150.0).abs() < 1e-9);
        assert_eq!(metrics.p95_response_time_ms, 200.0);
    }

    #[test]
    fn old_buckets_age_out_of_the_window() {
        let (clock, agg) = aggregator();
        agg.observe(&completed(100));
        clock.advance(Duration::from_secs(301));
        let metrics = agg.snapshot(&empty_registry(), TaskCounts::default());
        assert_eq!(metrics.throughput_per_min, 0.0);
        assert_eq!(metrics.success_rate, 1.0);
    }

    #[test]
    fn throughput_counts_window_completions() {
        let (clock, agg) = aggregator();
        for _ in 0..10 {
            agg.observe(&completed(50));
            clock.advance(Duration::from_secs(1));
        }
        let metrics = agg.snapshot(&empty_registry(), TaskCounts::default());
        // 10 completions over a 5 minute window.
        assert!((metrics.throughput_per_min - 2.0).abs() < 1e-9);
    }
}
