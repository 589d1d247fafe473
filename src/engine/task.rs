use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::error::LatticeError;

/// Task execution priorities. Lower value dispatches first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
    Background = 5,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 5] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
        TaskPriority::Background,
    ];

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(TaskPriority::Critical),
            2 => Some(TaskPriority::High),
            3 => Some(TaskPriority::Normal),
            4 => Some(TaskPriority::Low),
            5 => Some(TaskPriority::Background),
            _ => None,
        }
    }

    /// Index into per-priority structures.
    pub(crate) fn lane(self) -> usize {
        self as usize - 1
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
            TaskPriority::Background => "background",
        };
        f.write_str(s)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Valid edges of the lifecycle machine. Terminal states absorb.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        match (self, to) {
            (Pending, Scheduled) | (Pending, Failed) | (Pending, Cancelled) => true,
            (Scheduled, Running) | (Scheduled, Failed) | (Scheduled, Cancelled) => true,
            // A retry sends a scheduled/running task back to pending.
            (Scheduled, Pending) | (Running, Pending) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Scheduled => "scheduled",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure classification. Determines whether the task engine retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    InvalidInput,
    NoCandidates,
    InsufficientRedundancy,
    NetworkError,
    NodeFailure,
    NodeRejected,
    Timeout,
    TaskErrorPermanent,
    TaskErrorTransient,
}

impl ErrorClass {
    /// Transient infrastructure faults are retried; input errors and
    /// permanent task errors are not.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::NetworkError
                | ErrorClass::NodeFailure
                | ErrorClass::Timeout
                | ErrorClass::TaskErrorTransient
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::InvalidInput => "invalid_input",
            ErrorClass::NoCandidates => "no_candidates",
            ErrorClass::InsufficientRedundancy => "insufficient_redundancy",
            ErrorClass::NetworkError => "network_error",
            ErrorClass::NodeFailure => "node_failure",
            ErrorClass::NodeRejected => "node_rejected",
            ErrorClass::Timeout => "timeout",
            ErrorClass::TaskErrorPermanent => "task_error_permanent",
            ErrorClass::TaskErrorTransient => "task_error_transient",
        };
        f.write_str(s)
    }
}

/// Hard and soft placement constraints carried by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequirements {
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub min_cpu_pct_free: f64,
    #[serde(default)]
    pub min_memory_mb: u64,
    #[serde(default)]
    pub preferred_nodes: Vec<String>,
    #[serde(default)]
    pub excluded_nodes: BTreeSet<String>,
    /// Number of concurrent independent attempts; first completion wins.
    #[serde(default = "default_redundancy")]
    pub redundancy: u32,
    /// Uninterpreted requirement fields, passed through to nodes.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_redundancy() -> u32 {
    1
}

impl Default for TaskRequirements {
    fn default() -> Self {
        Self {
            required_capabilities: BTreeSet::new(),
            min_cpu_pct_free: 0.0,
            min_memory_mb: 0,
            preferred_nodes: Vec::new(),
            excluded_nodes: BTreeSet::new(),
            redundancy: 1,
            extra: serde_json::Map::new(),
        }
    }
}

/// Client-facing task submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Generated when empty.
    #[serde(default)]
    pub task_id: String,
    pub task_type: String,
    #[serde(default = "default_priority")]
    pub priority: TaskPriority,
    #[serde(default)]
    pub requirements: TaskRequirements,
    #[serde(default)]
    pub input_data: serde_json::Value,
    /// Per-attempt execution budget handed to the node.
    pub timeout_secs: u64,
    /// Absolute deadline; past it the task fails with `timeout`.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl TaskSpec {
    pub fn validate(&self) -> Result<(), LatticeError> {
        if self.task_type.is_empty() {
            return Err(LatticeError::invalid_input("task_type must not be empty"));
        }
        if self.timeout_secs == 0 {
            return Err(LatticeError::invalid_input("timeout must be positive"));
        }
        if self.requirements.redundancy < 1 {
            return Err(LatticeError::invalid_input("redundancy must be at least 1"));
        }
        Ok(())
    }
}

fn default_priority() -> TaskPriority {
    TaskPriority::Normal
}

/// Outcome reported by a node for a finished assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        #[serde(default)]
        result: serde_json::Value,
    },
    Failed {
        class: ErrorClass,
        message: String,
    },
}

/// Authoritative task record, mutated only by the task engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_type: String,
    pub priority: TaskPriority,
    pub requirements: TaskRequirements,
    pub input_data: serde_json::Value,
    pub timeout_secs: u64,
    pub deadline_ms: Option<u64>,
    pub max_retries: u32,
    pub retry_count: u32,
    /// Nodes chosen for the current attempt; more than one only when
    /// `requirements.redundancy > 1`.
    pub assigned_nodes: Vec<String>,
    pub state: TaskState,
    pub created_at_ms: u64,
    pub dispatched_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub callback_url: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_class: Option<ErrorClass>,

    // Per-attempt bookkeeping, reset on retry.
    #[serde(default)]
    pub(crate) acked_nodes: BTreeSet<String>,
    #[serde(default)]
    pub(crate) failed_nodes: BTreeSet<String>,
    /// First time placement found no candidates; starts the grace window.
    #[serde(default)]
    pub(crate) first_unplaceable_ms: Option<u64>,
    /// Exponential backoff for the next placement attempt.
    #[serde(default)]
    pub(crate) placement_backoff_ms: u64,
}

impl Task {
    pub fn from_spec(spec: TaskSpec, task_id: String, max_retries: u32, now_ms: u64) -> Self {
        Self {
            task_id,
            task_type: spec.task_type,
            priority: spec.priority,
            requirements: spec.requirements,
            input_data: spec.input_data,
            timeout_secs: spec.timeout_secs,
            deadline_ms: spec.deadline_ms,
            max_retries,
            retry_count: 0,
            assigned_nodes: Vec::new(),
            state: TaskState::Pending,
            created_at_ms: now_ms,
            dispatched_at_ms: None,
            completed_at_ms: None,
            callback_url: spec.callback_url,
            result: None,
            error_message: None,
            error_class: None,
            acked_nodes: BTreeSet::new(),
            failed_nodes: BTreeSet::new(),
            first_unplaceable_ms: None,
            placement_backoff_ms: 0,
        }
    }

    /// Drop payload fields, keeping only the summary. Applied when a
    /// record ages out of the full history tier.
    pub fn strip_payloads(&mut self) {
        self.input_data = serde_json::Value::Null;
        self.result = None;
        self.requirements.extra = serde_json::Map::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_round_trips_through_values() {
        for p in TaskPriority::ALL {
            assert_eq!(TaskPriority::from_value(p as u8), Some(p));
        }
        assert_eq!(TaskPriority::from_value(0), None);
        assert_eq!(TaskPriority::from_value(6), None);
    }

    #[test]
    fn terminal_states_absorb() {
        for terminal in [TaskState::Completed, TaskState::Failed, TaskState::Cancelled] {
            for to in [
                TaskState::Pending,
                TaskState::Scheduled,
                TaskState::Running,
                TaskState::Completed,
                TaskState::Failed,
                TaskState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(to), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn retryable_classes_match_policy() {
        assert!(ErrorClass::NetworkError.is_retryable());
        assert!(ErrorClass::NodeFailure.is_retryable());
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(ErrorClass::TaskErrorTransient.is_retryable());
        assert!(!ErrorClass::InvalidInput.is_retryable());
        assert!(!ErrorClass::TaskErrorPermanent.is_retryable());
        assert!(!ErrorClass::NodeRejected.is_retryable());
    }

    #[test]
    fn spec_validation_catches_bad_input() {
        let mut spec = TaskSpec {
            task_id: String::new(),
            task_type: "ai_inference".into(),
            priority: TaskPriority::Normal,
            requirements: TaskRequirements::default(),
            input_data: serde_json::Value::Null,
            timeout_secs: 30,
            deadline_ms: None,
            max_retries: None,
            callback_url: None,
        };
        assert!(spec.validate().is_ok());

        spec.timeout_secs = 0;
        assert!(spec.validate().is_err());
        spec.timeout_secs = 30;
        spec.requirements.redundancy = 0;
        assert!(spec.validate().is_err());
    }
}
