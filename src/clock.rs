//! Monotonic time source and id generation.
//!
//! All timestamps in the control plane are milliseconds on a [`Clock`],
//! never wall-clock reads scattered through the code. Background sweeps
//! (liveness, deadlines, placement backoff) are driven by explicit ticks,
//! so tests swap in a [`ManualClock`] and advance it instead of sleeping.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Monotonic millisecond clock.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds elapsed since the clock's epoch.
    fn now_ms(&self) -> u64;
}

pub type SharedClock = Arc<dyn Clock>;

/// Process clock backed by [`Instant`].
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Test clock advanced by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Generate a task id of the form `task_1a2b3c4d`.
pub fn generate_task_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("task_{}", &hex[..8])
}

/// Generate an orchestrator id of the form `orch_1a2b3c4d`.
pub fn generate_orchestrator_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("orch_{}", &hex[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now_ms(), 5_000);
        clock.set_ms(100);
        assert_eq!(clock.now_ms(), 100);
    }

    #[test]
    fn generated_ids_have_prefix() {
        let id = generate_task_id();
        assert!(id.starts_with("task_"));
        assert_eq!(id.len(), "task_".len() + 8);
        assert_ne!(generate_task_id(), generate_task_id());
    }
}
