use serde::Serialize;

/// Orchestrator run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Running,
    Draining,
    Stopped,
}
