//! Lattice Orchestrator
//!
//! Control plane for a three-tier distributed compute fabric: an
//! orchestrator governs a fleet of nodes, each hosting one or more
//! agents that execute typed tasks.
//!
//! ## Core Concepts
//! - **Registry**: authoritative in-memory map of nodes and their agents
//! - **Task Engine**: the lifecycle state machine with retries, deadlines
//!   and redundancy
//! - **Placement**: filtered, scored node selection under five algorithms
//! - **Dispatcher**: delivery of placed tasks over a pluggable transport
//! - **Liveness Monitor**: heartbeat-age sweeps that drive failover
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use lattice::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(lattice::dispatch::LoopbackTransport::new());
//!     let orchestrator = Arc::new(Orchestrator::new(
//!         OrchestratorConfig::defaults(),
//!         transport,
//!     )?);
//!     orchestrator.start();
//!
//!     let task_id = orchestrator.submit_task(TaskSpec {
//!         task_id: String::new(),
//!         task_type: "ai_inference".into(),
//!         priority: TaskPriority::Normal,
//!         requirements: TaskRequirements::default(),
//!         input_data: serde_json::json!({"prompt": "hello"}),
//!         timeout_secs: 30,
//!         deadline_ms: None,
//!         max_retries: None,
//!         callback_url: None,
//!     })?;
//!     println!("submitted {task_id}");
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod metrics;
pub mod node;
pub mod placement;
pub mod store;
pub mod utils;

/// Current version of the lattice orchestrator.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use engine::{
    ConfigPatch, Orchestrator, OrchestratorConfig, OrchestratorStatus, RecoveryReport, RunState,
    TaskCounts, TaskEngine, TaskFilter, TaskPage,
};
pub use engine::task::{
    ErrorClass, Task, TaskOutcome, TaskPriority, TaskRequirements, TaskSpec, TaskState,
};
pub use node::{
    AgentInfo, Endpoint, HeartbeatSample, LivenessMonitor, NodeDescriptor, NodeInfo, NodeRegistry,
    NodeStatus, RegisterOutcome, ResourceSample,
};
pub use placement::{PlacementAlgorithm, PlacementEngine, ResourceWeights};
pub use dispatch::{DispatchPayload, Dispatcher, NodeTransport, TransportError};
pub use events::{Event, EventBus};
pub use utils::error::LatticeError;

pub mod prelude {
    pub use crate::engine::{Orchestrator, OrchestratorConfig, TaskFilter};
    pub use crate::engine::task::{
        ErrorClass, TaskOutcome, TaskPriority, TaskRequirements, TaskSpec, TaskState,
    };
    pub use crate::node::{
        Endpoint, HeartbeatSample, NodeDescriptor, NodeStatus, ResourceSample,
    };
    pub use crate::placement::PlacementAlgorithm;

    pub use std::time::Duration;
    pub use uuid::Uuid;
}
