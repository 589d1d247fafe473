//! Task lifecycle state machine.
//!
//! Owns the pending queue, the live task table, and the terminal history.
//! Every observable state transition for a task id goes through one of
//! the methods here under the task's dashmap entry lock, so transitions
//! form a linear, monotone sequence ending at a terminal state. Late
//! messages for terminal tasks are dropped with a logged warning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::clock::{generate_task_id, SharedClock};
use crate::dispatch::DispatchPayload;
use crate::engine::history::TaskHistory;
use crate::engine::queue::{PendingQueue, QueueConfig};
use crate::engine::task::{ErrorClass, Task, TaskOutcome, TaskSpec, TaskState};
use crate::events::{Event, EventBus};
use crate::node::registry::{Endpoint, NodeRegistry};
use crate::placement::PlacementEngine;
use crate::store::Store;
use crate::utils::error::LatticeError;

/// Placement backoff: 1s doubling, capped at 30s.
const PLACEMENT_BACKOFF_BASE_MS: u64 = 1_000;
const PLACEMENT_BACKOFF_CAP_MS: u64 = 30_000;
/// Retry backoff: 1s * 2^retry_count, capped at 60s.
const RETRY_BACKOFF_BASE_MS: u64 = 1_000;
const RETRY_BACKOFF_CAP_MS: u64 = 60_000;

/// Engine-owned policy knobs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub placement_grace_ms: u64,
    pub default_max_retries: u32,
    pub history_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            placement_grace_ms: 60_000,
            default_max_retries: 3,
            history_limit: 10_000,
        }
    }
}

/// One node assignment of a dispatch plan.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub node_id: String,
    pub endpoint: Endpoint,
}

/// A placed task ready for delivery.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub payload: DispatchPayload,
    pub assignments: Vec<Assignment>,
}

/// Outstanding node-side work to cancel, produced by finalization.
#[derive(Debug, Clone)]
pub struct CancelTarget {
    pub node_id: String,
    pub endpoint: Endpoint,
    pub task_id: String,
}

/// Live task counts by state plus terminal totals.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub scheduled: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Query filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub node_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// One page of a task listing.
#[derive(Debug, Clone)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: usize,
}

/// The task lifecycle engine.
#[derive(Debug)]
pub struct TaskEngine {
    tasks: DashMap<String, Task>,
    queue: PendingQueue,
    history: TaskHistory,
    registry: Arc<NodeRegistry>,
    placement: Arc<PlacementEngine>,
    bus: EventBus,
    clock: SharedClock,
    store: Option<Arc<dyn Store>>,
    settings: EngineSettings,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    cancelled_total: AtomicU64,
}

impl TaskEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<NodeRegistry>,
        placement: Arc<PlacementEngine>,
        bus: EventBus,
        clock: SharedClock,
        queue_config: QueueConfig,
        settings: EngineSettings,
        store: Option<Arc<dyn Store>>,
    ) -> Self {
        let history = TaskHistory::new(settings.history_limit);
        Self {
            tasks: DashMap::new(),
            queue: PendingQueue::new(queue_config),
            history,
            registry,
            placement,
            bus,
            clock,
            store,
            settings,
            completed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            cancelled_total: AtomicU64::new(0),
        }
    }

    /// Accept a task for execution. Applies queue backpressure before the
    /// record is created; the returned id is immediately queryable.
    pub fn submit(&self, spec: TaskSpec) -> Result<String, LatticeError> {
        spec.validate()?;
        let task_id = if spec.task_id.is_empty() {
            generate_task_id()
        } else {
            spec.task_id.clone()
        };
        if self.tasks.contains_key(&task_id) {
            return Err(LatticeError::conflict(format!(
                "task {task_id} already submitted and not terminal"
            )));
        }
        let now_ms = self.clock.now_ms();
        let max_retries = spec.max_retries.unwrap_or(self.settings.default_max_retries);
        self.queue.enqueue(&task_id, spec.priority, now_ms, now_ms)?;

        let priority = spec.priority;
        let task = Task::from_spec(spec, task_id.clone(), max_retries, now_ms);
        self.persist(&task);
        self.tasks.insert(task_id.clone(), task);

        metrics::counter!("lattice.tasks.submitted_total").increment(1);
        self.bus.publish(Event::TaskSubmitted {
            task_id: task_id.clone(),
            priority,
            at_ms: now_ms,
        });
        info!(%task_id, %priority, "task submitted");
        Ok(task_id)
    }

    /// Pop one ready pending task, attempt placement, and if successful
    /// hand back a dispatch plan. Unplaceable tasks are re-queued with
    /// backoff or failed once the grace window closes; this keeps looping
    /// until a plan emerges or the ready queue drains.
    pub fn next_plan(&self) -> Option<DispatchPlan> {
        loop {
            let now_ms = self.clock.now_ms();
            let task_id = self.queue.pop_ready(now_ms)?;
            if let Some(plan) = self.try_place(&task_id, now_ms) {
                return Some(plan);
            }
        }
    }

    /// Drain every ready pending task once. Returns the produced plans;
    /// the async workers normally take them one at a time via
    /// [`Self::next_plan`].
    pub fn dispatch_tick(&self) -> Vec<DispatchPlan> {
        let mut plans = Vec::new();
        while let Some(plan) = self.next_plan() {
            plans.push(plan);
        }
        plans
    }

    fn try_place(&self, task_id: &str, now_ms: u64) -> Option<DispatchPlan> {
        let config = self.placement.config();
        let snapshot = self.registry.snapshot();

        let mut entry = self.tasks.get_mut(task_id)?;
        if entry.state != TaskState::Pending {
            warn!(task_id, state = %entry.state, "queued task no longer pending, dropping");
            return None;
        }
        let redundancy = entry.requirements.redundancy as usize;
        let k = redundancy.max(config.top_n);
        let candidates = self.placement.select(&snapshot, &entry.requirements, k);

        if candidates.is_empty() {
            let first = *entry.first_unplaceable_ms.get_or_insert(now_ms);
            let grace = self.settings.placement_grace_ms;
            if now_ms.saturating_sub(first) >= grace {
                drop(entry);
                self.finalize_failed(
                    task_id,
                    ErrorClass::NoCandidates,
                    "no suitable nodes within grace window".to_string(),
                    now_ms,
                );
                return None;
            }
            entry.placement_backoff_ms = if entry.placement_backoff_ms == 0 {
                PLACEMENT_BACKOFF_BASE_MS
            } else {
                (entry.placement_backoff_ms * 2).min(PLACEMENT_BACKOFF_CAP_MS)
            };
            // Never sleep past the end of the grace window.
            let ready_at = (now_ms + entry.placement_backoff_ms).min(first + grace);
            let (priority, created_at) = (entry.priority, entry.created_at_ms);
            drop(entry);
            if let Err(err) = self.queue.enqueue(task_id, priority, created_at, ready_at) {
                warn!(task_id, error = %err, "re-queue after placement miss failed");
                self.finalize_failed(
                    task_id,
                    ErrorClass::NoCandidates,
                    format!("re-queue failed: {err}"),
                    now_ms,
                );
            }
            return None;
        }

        if candidates.len() < redundancy && config.strict_redundancy {
            drop(entry);
            self.finalize_failed(
                task_id,
                ErrorClass::InsufficientRedundancy,
                format!(
                    "required {redundancy} distinct nodes, only {} available",
                    candidates.len()
                ),
                now_ms,
            );
            return None;
        }

        let chosen: Vec<_> = candidates.into_iter().take(redundancy.max(1)).collect();
        entry.state = TaskState::Scheduled;
        entry.assigned_nodes = chosen.iter().map(|n| n.node_id.clone()).collect();
        entry.acked_nodes.clear();
        entry.failed_nodes.clear();
        entry.first_unplaceable_ms = None;
        entry.placement_backoff_ms = 0;

        let payload = DispatchPayload {
            task_id: entry.task_id.clone(),
            task_type: entry.task_type.clone(),
            priority: entry.priority,
            requirements: entry.requirements.clone(),
            input_data: entry.input_data.clone(),
            timeout_secs: entry.timeout_secs,
            deadline_ms: entry.deadline_ms,
            attempt: entry.retry_count,
        };
        let assigned: Vec<String> = entry.assigned_nodes.clone();
        drop(entry);

        for node in &chosen {
            self.registry.record_dispatch(&node.node_id);
        }
        metrics::counter!("lattice.tasks.scheduled_total").increment(1);
        self.bus.publish(Event::TaskScheduled {
            task_id: task_id.to_string(),
            nodes: assigned,
            at_ms: now_ms,
        });

        Some(DispatchPlan {
            payload,
            assignments: chosen
                .into_iter()
                .map(|n| Assignment {
                    node_id: n.node_id,
                    endpoint: n.endpoint,
                })
                .collect(),
        })
    }

    /// A node accepted a dispatched assignment.
    pub fn on_node_ack(&self, task_id: &str, node_id: &str) -> Result<(), LatticeError> {
        let now_ms = self.clock.now_ms();
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            if self.history.contains(task_id) {
                warn!(task_id, node_id, "ack for terminal task dropped");
                return Ok(());
            }
            return Err(LatticeError::not_found(format!("unknown task {task_id}")));
        };
        if entry.state.is_terminal() {
            warn!(task_id, node_id, "ack for terminal task dropped");
            return Ok(());
        }
        if !entry.assigned_nodes.iter().any(|n| n == node_id) {
            warn!(task_id, node_id, "ack from unassigned node dropped");
            return Ok(());
        }
        entry.acked_nodes.insert(node_id.to_string());
        if entry.state == TaskState::Scheduled {
            entry.state = TaskState::Running;
            entry.dispatched_at_ms.get_or_insert(now_ms);
        }
        Ok(())
    }

    /// A transport-level delivery failure for one assignment, reported by
    /// the dispatcher after its inline retries were exhausted.
    pub fn on_dispatch_error(
        &self,
        task_id: &str,
        node_id: &str,
        class: ErrorClass,
        message: String,
    ) -> Vec<CancelTarget> {
        self.settle_assignment_failure(task_id, node_id, class, message)
    }

    /// A node pushed an outcome for an assignment. Returns best-effort
    /// cancels for redundant siblings when the first completion wins.
    pub fn on_node_result(
        &self,
        task_id: &str,
        node_id: &str,
        outcome: TaskOutcome,
    ) -> Result<Vec<CancelTarget>, LatticeError> {
        let now_ms = self.clock.now_ms();
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            if self.history.contains(task_id) {
                warn!(task_id, node_id, "result for terminal task dropped");
                return Ok(Vec::new());
            }
            return Err(LatticeError::not_found(format!("unknown task {task_id}")));
        };
        if entry.state.is_terminal() {
            warn!(task_id, node_id, "result for terminal task dropped");
            return Ok(Vec::new());
        }
        if !entry.assigned_nodes.iter().any(|n| n == node_id) {
            warn!(task_id, node_id, "result from unassigned node dropped");
            return Err(LatticeError::conflict(format!(
                "node {node_id} is not assigned to task {task_id}"
            )));
        }

        match outcome {
            TaskOutcome::Completed { result } => {
                // A result can arrive before the ack; treat it as implicit.
                if entry.state == TaskState::Scheduled {
                    entry.dispatched_at_ms.get_or_insert(now_ms);
                }
                entry.state = TaskState::Completed;
                entry.completed_at_ms = Some(now_ms);
                entry.result = Some(result);
                let siblings: Vec<String> = entry
                    .assigned_nodes
                    .iter()
                    .filter(|n| n.as_str() != node_id && !entry.failed_nodes.contains(*n))
                    .cloned()
                    .collect();
                drop(entry);

                self.registry.record_outcome(node_id, true);
                let cancels = self.cancel_targets(task_id, &siblings);
                for sibling in &siblings {
                    self.registry.release_assignment(sibling);
                }

                if let Some(task) = self.remove_to_history(task_id) {
                    let elapsed_ms = now_ms.saturating_sub(task.created_at_ms);
                    self.completed_total.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("lattice.tasks.completed_total").increment(1);
                    metrics::histogram!("lattice.tasks.response_time_ms")
                        .record(elapsed_ms as f64);
                    info!(task_id, node_id, elapsed_ms, "task completed");
                    self.bus.publish(Event::TaskCompleted {
                        task_id: task_id.to_string(),
                        node_id: node_id.to_string(),
                        elapsed_ms,
                        callback_url: task.callback_url.clone(),
                        at_ms: now_ms,
                    });
                }
                Ok(cancels)
            }
            TaskOutcome::Failed { class, message } => {
                if !entry.failed_nodes.insert(node_id.to_string()) {
                    // Duplicate failure report from the same node.
                    return Ok(Vec::new());
                }
                let all_failed = entry.failed_nodes.len() >= entry.assigned_nodes.len();
                drop(entry);
                self.registry.record_outcome(node_id, false);
                if all_failed {
                    self.conclude_failed_attempt(task_id, class, message, now_ms);
                }
                Ok(Vec::new())
            }
        }
    }

    /// Periodic deadline sweep. Any non-terminal task past its deadline
    /// takes the timeout failure path under the normal retry policy.
    pub fn tick_deadlines(&self) -> Vec<CancelTarget> {
        let now_ms = self.clock.now_ms();
        let expired: Vec<(String, TaskState, Vec<String>)> = self
            .tasks
            .iter()
            .filter(|t| t.deadline_ms.map_or(false, |d| now_ms >= d))
            .map(|t| {
                let outstanding: Vec<String> = t
                    .assigned_nodes
                    .iter()
                    .filter(|n| !t.failed_nodes.contains(*n))
                    .cloned()
                    .collect();
                (t.task_id.clone(), t.state, outstanding)
            })
            .collect();

        let mut cancels = Vec::new();
        for (task_id, state, outstanding) in expired {
            match state {
                TaskState::Pending => {
                    self.queue.remove(&task_id);
                    self.conclude_failed_attempt(
                        &task_id,
                        ErrorClass::Timeout,
                        "deadline passed while pending".to_string(),
                        now_ms,
                    );
                }
                TaskState::Scheduled | TaskState::Running => {
                    cancels.extend(self.cancel_targets(&task_id, &outstanding));
                    for node_id in &outstanding {
                        self.registry.release_assignment(node_id);
                    }
                    self.conclude_failed_attempt(
                        &task_id,
                        ErrorClass::Timeout,
                        "deadline passed while in flight".to_string(),
                        now_ms,
                    );
                }
                _ => {}
            }
        }
        cancels
    }

    /// Fail over every task assigned to a dead node. Invoked by the
    /// liveness monitor (offline transition) and by unregister.
    pub fn handle_node_failure(&self, node_id: &str) -> usize {
        let affected: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| {
                matches!(t.state, TaskState::Scheduled | TaskState::Running)
                    && t.assigned_nodes.iter().any(|n| n == node_id)
            })
            .map(|t| t.task_id.clone())
            .collect();

        for task_id in &affected {
            self.settle_assignment_failure(
                task_id,
                node_id,
                ErrorClass::NodeFailure,
                format!("node {node_id} went offline mid-flight"),
            );
        }
        if !affected.is_empty() {
            warn!(node_id, tasks = affected.len(), "failed over tasks from dead node");
        }
        affected.len()
    }

    /// Client cancel. Terminal tasks are a no-op error; pending tasks are
    /// dropped from the queue; in-flight tasks produce best-effort node
    /// cancels and are finalized locally regardless.
    pub fn cancel(&self, task_id: &str) -> Result<Vec<CancelTarget>, LatticeError> {
        let now_ms = self.clock.now_ms();
        let Some(entry) = self.tasks.get(task_id) else {
            if self.history.contains(task_id) {
                return Err(LatticeError::AlreadyTerminal(task_id.to_string()));
            }
            return Err(LatticeError::not_found(format!("unknown task {task_id}")));
        };
        let state = entry.state;
        let assigned = entry.assigned_nodes.clone();
        let failed = entry.failed_nodes.clone();
        drop(entry);
        if state.is_terminal() {
            return Err(LatticeError::AlreadyTerminal(task_id.to_string()));
        }

        let cancels = match state {
            TaskState::Pending => {
                self.queue.remove(task_id);
                Vec::new()
            }
            TaskState::Scheduled | TaskState::Running => {
                let outstanding: Vec<String> = assigned
                    .iter()
                    .filter(|n| !failed.contains(*n))
                    .cloned()
                    .collect();
                for node_id in &outstanding {
                    self.registry.release_assignment(node_id);
                }
                self.cancel_targets(task_id, &outstanding)
            }
            _ => Vec::new(),
        };

        if let Some(task) = self.finalize_with(task_id, |task| {
            task.state = TaskState::Cancelled;
            task.completed_at_ms = Some(now_ms);
        }) {
            self.cancelled_total.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("lattice.tasks.cancelled_total").increment(1);
            info!(task_id = %task.task_id, prior = %state, "task cancelled");
            self.bus.publish(Event::TaskCancelled {
                task_id: task_id.to_string(),
                callback_url: task.callback_url.clone(),
                at_ms: now_ms,
            });
        }
        Ok(cancels)
    }

    /// Look up a task, live or retained.
    pub fn get(&self, task_id: &str) -> Option<Task> {
        if let Some(entry) = self.tasks.get(task_id) {
            return Some(entry.value().clone());
        }
        self.history.get(task_id)
    }

    /// Filtered, paged listing over live tasks and recent history.
    pub fn list(&self, filter: &TaskFilter) -> TaskPage {
        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .map(|e| e.value().clone())
            .chain(self.history.recent(self.settings.history_limit))
            .filter(|t| filter.state.map_or(true, |s| t.state == s))
            .filter(|t| {
                filter
                    .node_id
                    .as_ref()
                    .map_or(true, |n| t.assigned_nodes.contains(n))
            })
            .collect();
        tasks.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        let total = tasks.len();
        let tasks = tasks
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect();
        TaskPage { tasks, total }
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts {
            completed: self.completed_total.load(Ordering::Relaxed),
            failed: self.failed_total.load(Ordering::Relaxed),
            cancelled: self.cancelled_total.load(Ordering::Relaxed),
            ..TaskCounts::default()
        };
        for entry in self.tasks.iter() {
            match entry.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Scheduled => counts.scheduled += 1,
                TaskState::Running => counts.running += 1,
                _ => {}
            }
        }
        counts
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Earliest wake deadline for idle dispatch workers.
    pub fn next_ready_at(&self) -> Option<u64> {
        self.queue.next_ready_at()
    }

    /// Re-surface persisted in-flight tasks as pending after a crash,
    /// preserving retry counts. Terminal records go straight to history.
    pub fn recover_tasks(&self, tasks: Vec<Task>) -> usize {
        let now_ms = self.clock.now_ms();
        let mut recovered = 0;
        for mut task in tasks {
            if task.state.is_terminal() {
                self.history.insert(task);
                continue;
            }
            task.state = TaskState::Pending;
            task.assigned_nodes.clear();
            task.acked_nodes.clear();
            task.failed_nodes.clear();
            task.first_unplaceable_ms = None;
            task.placement_backoff_ms = 0;
            let task_id = task.task_id.clone();
            if self
                .queue
                .enqueue(&task_id, task.priority, task.created_at_ms, now_ms)
                .is_ok()
            {
                self.tasks.insert(task_id, task);
                recovered += 1;
            }
        }
        recovered
    }

    // ---- internals ----

    /// Mark one assignment failed; when the last sibling fails, run the
    /// retry policy. Validates before touching node counters so invalid
    /// or duplicate reports change nothing.
    fn settle_assignment_failure(
        &self,
        task_id: &str,
        node_id: &str,
        class: ErrorClass,
        message: String,
    ) -> Vec<CancelTarget> {
        let now_ms = self.clock.now_ms();
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            warn!(task_id, node_id, "failure report for unknown or terminal task dropped");
            return Vec::new();
        };
        if entry.state.is_terminal() || entry.state == TaskState::Pending {
            return Vec::new();
        }
        if !entry.assigned_nodes.iter().any(|n| n == node_id) {
            warn!(task_id, node_id, "failure report from unassigned node dropped");
            return Vec::new();
        }
        if !entry.failed_nodes.insert(node_id.to_string()) {
            return Vec::new();
        }
        let all_failed = entry.failed_nodes.len() >= entry.assigned_nodes.len();
        drop(entry);

        self.registry.record_outcome(node_id, false);
        if all_failed {
            self.conclude_failed_attempt(task_id, class, message, now_ms);
        }
        Vec::new()
    }

    /// Retry-or-finalize decision after an attempt failed as a whole.
    fn conclude_failed_attempt(
        &self,
        task_id: &str,
        class: ErrorClass,
        message: String,
        now_ms: u64,
    ) {
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            return;
        };
        if entry.state.is_terminal() {
            return;
        }
        let retryable = class.is_retryable() && entry.retry_count < entry.max_retries;
        if !retryable {
            drop(entry);
            self.finalize_failed(task_id, class, message, now_ms);
            return;
        }

        entry.retry_count += 1;
        let failing: Vec<String> = entry.assigned_nodes.drain(..).collect();
        for node_id in failing {
            entry.requirements.excluded_nodes.insert(node_id);
        }
        entry.acked_nodes.clear();
        entry.failed_nodes.clear();
        entry.state = TaskState::Pending;
        entry.first_unplaceable_ms = None;
        entry.placement_backoff_ms = 0;
        entry.dispatched_at_ms = None;
        let backoff_ms =
            (RETRY_BACKOFF_BASE_MS << entry.retry_count.min(10)).min(RETRY_BACKOFF_CAP_MS);
        let (priority, created_at, retry_count) =
            (entry.priority, entry.created_at_ms, entry.retry_count);
        drop(entry);

        metrics::counter!("lattice.tasks.retried_total").increment(1);
        info!(task_id, retry_count, %class, backoff_ms, "retrying task");
        if let Err(err) = self
            .queue
            .enqueue(task_id, priority, created_at, now_ms + backoff_ms)
        {
            warn!(task_id, error = %err, "retry enqueue failed, failing task");
            self.finalize_failed(task_id, class, format!("retry enqueue failed: {err}"), now_ms);
        }
    }

    fn finalize_failed(&self, task_id: &str, class: ErrorClass, message: String, now_ms: u64) {
        if let Some(task) = self.finalize_with(task_id, |task| {
            task.state = TaskState::Failed;
            task.error_class = Some(class);
            task.error_message = Some(message.clone());
            task.completed_at_ms = Some(now_ms);
        }) {
            self.failed_total.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("lattice.tasks.failed_total").increment(1);
            warn!(task_id = %task.task_id, %class, %message, "task failed");
            self.bus.publish(Event::TaskFailed {
                task_id: task_id.to_string(),
                class,
                message,
                callback_url: task.callback_url.clone(),
                at_ms: now_ms,
            });
        }
    }

    /// Remove a live task, apply the terminal mutation, retain in history
    /// and write through to the store.
    fn finalize_with<F: FnOnce(&mut Task)>(&self, task_id: &str, mutate: F) -> Option<Task> {
        let (_, mut task) = self.tasks.remove(task_id)?;
        mutate(&mut task);
        debug_assert!(task.state.is_terminal());
        self.persist(&task);
        self.history.insert(task.clone());
        Some(task)
    }

    fn remove_to_history(&self, task_id: &str) -> Option<Task> {
        let (_, task) = self.tasks.remove(task_id)?;
        self.persist(&task);
        self.history.insert(task.clone());
        Some(task)
    }

    fn cancel_targets(&self, task_id: &str, node_ids: &[String]) -> Vec<CancelTarget> {
        node_ids
            .iter()
            .filter_map(|node_id| {
                self.registry.get(node_id).map(|node| CancelTarget {
                    node_id: node_id.clone(),
                    endpoint: node.endpoint,
                    task_id: task_id.to_string(),
                })
            })
            .collect()
    }

    fn persist(&self, task: &Task) {
        if let Some(store) = &self.store {
            if let Err(err) = store.put_task(task) {
                warn!(task_id = %task.task_id, error = %err, "task write-through failed");
            }
        }
    }
}
