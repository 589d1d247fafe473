//! Network-wide rolling metrics.

pub mod aggregator;
pub mod exporter;

pub use aggregator::{AggregatorConfig, MetricsAggregator, NetworkMetrics};
pub use exporter::start_metrics_server;
