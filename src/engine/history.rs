use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::engine::task::Task;

/// Bounded LRU retention of terminal task records.
///
/// Two tiers: full records up to `capacity`, and an equally bounded ring
/// of payload-stripped summaries for records that aged out of the full
/// tier. A `get` refreshes recency in the full tier.
#[derive(Debug)]
pub struct TaskHistory {
    inner: Mutex<HistoryInner>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct HistoryInner {
    full: HashMap<String, Task>,
    full_order: VecDeque<String>,
    summaries: HashMap<String, Task>,
    summary_order: VecDeque<String>,
}

impl TaskHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HistoryInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Retain a terminal task record, evicting the least recently used
    /// full record into the summary tier when over capacity.
    pub fn insert(&self, task: Task) {
        debug_assert!(task.state.is_terminal());
        let mut inner = self.inner.lock().expect("task history poisoned");
        let task_id = task.task_id.clone();

        if inner.full.insert(task_id.clone(), task).is_none() {
            inner.full_order.push_back(task_id);
        } else {
            touch(&mut inner.full_order, &task_id);
        }

        while inner.full.len() > self.capacity {
            let Some(evicted_id) = inner.full_order.pop_front() else {
                break;
            };
            if let Some(mut evicted) = inner.full.remove(&evicted_id) {
                evicted.strip_payloads();
                if inner.summaries.insert(evicted_id.clone(), evicted).is_none() {
                    inner.summary_order.push_back(evicted_id);
                }
            }
        }
        while inner.summaries.len() > self.capacity {
            let Some(oldest) = inner.summary_order.pop_front() else {
                break;
            };
            inner.summaries.remove(&oldest);
        }
        metrics::gauge!("lattice.history.retained").set(inner.full.len() as f64);
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        let mut inner = self.inner.lock().expect("task history poisoned");
        if let Some(task) = inner.full.get(task_id).cloned() {
            touch(&mut inner.full_order, task_id);
            return Some(task);
        }
        inner.summaries.get(task_id).cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        let inner = self.inner.lock().expect("task history poisoned");
        inner.full.contains_key(task_id) || inner.summaries.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("task history poisoned").full.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of retained full records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Task> {
        let inner = self.inner.lock().expect("task history poisoned");
        inner
            .full_order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| inner.full.get(id).cloned())
            .collect()
    }
}

fn touch(order: &mut VecDeque<String>, task_id: &str) {
    if let Some(pos) = order.iter().position(|id| id == task_id) {
        order.remove(pos);
        order.push_back(task_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::{TaskPriority, TaskRequirements, TaskSpec};

    fn terminal_task(id: &str) -> Task {
        let spec = TaskSpec {
            task_id: id.to_string(),
            task_type: "compute".into(),
            priority: TaskPriority::Normal,
            requirements: TaskRequirements::default(),
            input_data: serde_json::json!({"payload": "large"}),
            timeout_secs: 30,
            deadline_ms: None,
            max_retries: None,
            callback_url: None,
        };
        let mut task = Task::from_spec(spec, id.to_string(), 3, 0);
        task.state = crate::engine::task::TaskState::Completed;
        task.result = Some(serde_json::json!({"answer": 42}));
        task.completed_at_ms = Some(10);
        task
    }

    #[test]
    fn eviction_strips_payloads_but_keeps_summary() {
        let history = TaskHistory::new(2);
        history.insert(terminal_task("t1"));
        history.insert(terminal_task("t2"));
        history.insert(terminal_task("t3"));

        // t1 aged out of the full tier into the summary tier.
        let summary = history.get("t1").expect("summary retained");
        assert!(summary.result.is_none());
        assert!(summary.input_data.is_null());
        assert_eq!(summary.completed_at_ms, Some(10));

        let full = history.get("t3").expect("full record retained");
        assert!(full.result.is_some());
    }

    #[test]
    fn get_refreshes_recency() {
        let history = TaskHistory::new(2);
        history.insert(terminal_task("t1"));
        history.insert(terminal_task("t2"));
        // Touch t1 so t2 is the LRU victim.
        history.get("t1");
        history.insert(terminal_task("t3"));

        assert!(history.get("t1").unwrap().result.is_some());
        assert!(history.get("t2").unwrap().result.is_none());
    }
}
