pub mod liveness;
pub mod registry;

pub use liveness::{LivenessConfig, LivenessMonitor, SweepReport};
pub use registry::{
    AgentInfo, Endpoint, HeartbeatSample, NodeDescriptor, NodeInfo, NodeRegistry, NodeStatus,
    RegisterOutcome, RegistrySnapshot, ResourceSample,
};
