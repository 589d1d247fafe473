use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use crate::engine::task::TaskPriority;
use crate::utils::error::LatticeError;

/// Queue limits and backpressure policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_pending: usize,
    /// Above `max_pending * high_water_fraction`, Low and Background
    /// submissions are rejected while higher priorities still enter.
    pub high_water_fraction: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: 100_000,
            high_water_fraction: 0.5,
        }
    }
}

/// Entry awaiting placement.
#[derive(Debug, Clone)]
struct PendingEntry {
    task_id: String,
    /// Not eligible for dispatch before this instant (placement backoff,
    /// retry backoff).
    ready_at_ms: u64,
    created_at_ms: u64,
    seq: u64,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id
    }
}
impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest-ready,
        // oldest-submitted entry pops first.
        other
            .ready_at_ms
            .cmp(&self.ready_at_ms)
            .then_with(|| other.created_at_ms.cmp(&self.created_at_ms))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    /// One heap per priority lane, drained in priority order.
    lanes: [BinaryHeap<PendingEntry>; 5],
    /// Live entries by id, mapped to the seq of their current heap entry.
    /// Heap entries with a different seq are stale and skipped on pop.
    ids: HashMap<String, u64>,
    seq: u64,
}

/// Thread-safe bounded priority queue of tasks awaiting placement.
///
/// Holds task ids only; the task records live in the engine's task table.
/// Coordination point for the dispatch worker pool.
#[derive(Debug)]
pub struct PendingQueue {
    inner: Mutex<QueueInner>,
    config: QueueConfig,
}

impl PendingQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            config,
        }
    }

    /// Enqueue a task for placement. Applies capacity and high-water
    /// backpressure.
    pub fn enqueue(
        &self,
        task_id: &str,
        priority: TaskPriority,
        created_at_ms: u64,
        ready_at_ms: u64,
    ) -> Result<(), LatticeError> {
        let mut inner = self.inner.lock().expect("pending queue poisoned");

        if inner.ids.len() >= self.config.max_pending {
            metrics::counter!("lattice.queue.rejected_total").increment(1);
            return Err(LatticeError::overloaded(format!(
                "pending queue full ({} tasks)",
                self.config.max_pending
            )));
        }
        let high_water =
            (self.config.max_pending as f64 * self.config.high_water_fraction) as usize;
        if inner.ids.len() > high_water
            && matches!(priority, TaskPriority::Low | TaskPriority::Background)
        {
            metrics::counter!("lattice.queue.rejected_total").increment(1);
            return Err(LatticeError::overloaded(
                "pending queue above high water, low-priority submissions rejected",
            ));
        }
        if inner.ids.contains_key(task_id) {
            return Err(LatticeError::conflict(format!(
                "task {task_id} already pending"
            )));
        }

        inner.seq += 1;
        let seq = inner.seq;
        inner.ids.insert(task_id.to_string(), seq);
        let entry = PendingEntry {
            task_id: task_id.to_string(),
            ready_at_ms,
            created_at_ms,
            seq,
        };
        inner.lanes[priority.lane()].push(entry);
        metrics::gauge!("lattice.queue.pending").set(inner.ids.len() as f64);
        Ok(())
    }

    /// Pop the highest-priority entry that is ready at `now_ms`.
    pub fn pop_ready(&self, now_ms: u64) -> Option<String> {
        let mut inner = self.inner.lock().expect("pending queue poisoned");
        for lane in 0..inner.lanes.len() {
            loop {
                let ready = match inner.lanes[lane].peek() {
                    Some(top) => top.ready_at_ms <= now_ms,
                    None => false,
                };
                if !ready {
                    break;
                }
                let entry = inner.lanes[lane].pop().expect("peeked entry vanished");
                // Stale entries linger after a remove or re-enqueue;
                // drain past anything whose seq no longer matches.
                if inner.ids.get(&entry.task_id) == Some(&entry.seq) {
                    inner.ids.remove(&entry.task_id);
                    metrics::gauge!("lattice.queue.pending").set(inner.ids.len() as f64);
                    return Some(entry.task_id);
                }
            }
        }
        None
    }

    /// Remove a task from the queue (cancellation). Lazy: the heap entry
    /// stays behind and is skipped when popped.
    pub fn remove(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("pending queue poisoned");
        let removed = inner.ids.remove(task_id).is_some();
        if removed {
            metrics::gauge!("lattice.queue.pending").set(inner.ids.len() as f64);
        }
        removed
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.inner
            .lock()
            .expect("pending queue poisoned")
            .ids
            .contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending queue poisoned").ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest instant at which any queued entry becomes ready, for
    /// worker idle waits.
    pub fn next_ready_at(&self) -> Option<u64> {
        let inner = self.inner.lock().expect("pending queue poisoned");
        inner
            .lanes
            .iter()
            .filter_map(|lane| lane.peek().map(|e| e.ready_at_ms))
            .min()
    }
}
