//! Per-worker bookkeeping.

use std::time::{Duration, Instant};

use serde::Serialize;

use super::unit::ExecutionUnit;

pub(crate) struct WorkerSlot {
    pub(crate) id: usize,
    pub(crate) unit: Box<dyn ExecutionUnit>,
    /// Task the unit is running. A worker is busy exactly when this is set.
    pub(crate) current_task: Option<String>,
    pub(crate) restarts: u32,
    pub(crate) generation: u64,
    pub(crate) last_used: Instant,
}

impl WorkerSlot {
    pub(crate) fn new(id: usize, unit: Box<dyn ExecutionUnit>, restarts: u32, generation: u64) -> Self {
        Self {
            id,
            unit,
            current_task: None,
            restarts,
            generation,
            last_used: Instant::now(),
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.current_task.is_some()
    }

    pub(crate) fn assign(&mut self, task_id: &str) {
        self.current_task = Some(task_id.to_string());
        self.last_used = Instant::now();
    }

    pub(crate) fn release(&mut self) -> Option<String> {
        self.last_used = Instant::now();
        self.current_task.take()
    }

    pub(crate) fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            busy: self.is_busy(),
            restarts: self.restarts,
            current_task: self.current_task.clone(),
            idle_for: if self.is_busy() {
                Duration::ZERO
            } else {
                self.last_used.elapsed()
            },
        }
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub busy: bool,
    pub restarts: u32,
    pub current_task: Option<String>,
    /// Time since the worker last took or finished a task; zero while busy.
    pub idle_for: Duration,
}
