//! The seam between the pool and whatever actually runs tasks.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::ipc::{ReplyMessage, TaskMessage};

/// One isolated execution unit: a thread, a subprocess, ...
///
/// Units only exchange messages with the pool. Replies and failures are reported through
/// the [`UnitEvents`] handed to [`WorkerBackend::spawn`].
#[async_trait]
pub trait ExecutionUnit: Send {
    /// Queue a task on the unit without waiting for it to run.
    fn post(&mut self, message: TaskMessage) -> Result<()>;

    /// Stop the unit. Anything it reports afterwards is ignored by the pool.
    async fn terminate(&mut self) -> Result<()>;
}

/// Creates execution units for the pool.
pub trait WorkerBackend: Send + Sync {
    fn spawn(&self, worker_id: usize, events: UnitEvents) -> Result<Box<dyn ExecutionUnit>>;
}

/// Something a unit reported.
#[derive(Debug)]
pub enum UnitEvent {
    Reply(ReplyMessage),
    /// The unit hit an uncaught error and is no longer usable.
    Crashed(String),
    /// The unit stopped on its own, with an exit code if it has one.
    Exited(Option<i32>),
}

#[derive(Debug)]
pub(crate) enum PoolEvent {
    Unit {
        worker_id: usize,
        generation: u64,
        event: UnitEvent,
    },
    Timeout {
        task_id: String,
    },
}

/// Channel a unit uses to report back to its pool.
///
/// Events are tagged with the unit's worker id and generation, so reports from a unit that
/// has since been replaced are recognised as stale.
#[derive(Debug, Clone)]
pub struct UnitEvents {
    worker_id: usize,
    generation: u64,
    tx: mpsc::UnboundedSender<PoolEvent>,
}

impl UnitEvents {
    pub(crate) fn new(worker_id: usize, generation: u64, tx: mpsc::UnboundedSender<PoolEvent>) -> Self {
        Self {
            worker_id,
            generation,
            tx,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn reply(&self, reply: ReplyMessage) {
        self.send(UnitEvent::Reply(reply));
    }

    pub fn crashed(&self, message: impl Into<String>) {
        self.send(UnitEvent::Crashed(message.into()));
    }

    pub fn exited(&self, code: Option<i32>) {
        self.send(UnitEvent::Exited(code));
    }

    fn send(&self, event: UnitEvent) {
        // The pool is gone; nobody is waiting for this event.
        let _ = self.tx.send(PoolEvent::Unit {
            worker_id: self.worker_id,
            generation: self.generation,
            event,
        });
    }
}
