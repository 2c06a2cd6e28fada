//! Worker pool: a fixed set of isolated execution units fed from a bounded FIFO queue.

mod config;
mod coordinator;
mod task;
mod thread;
mod unit;
mod worker;

pub use config::PoolConfig;
pub use coordinator::{PoolStats, WorkerPool};
pub use task::TaskHandle;
pub use thread::{TaskHandler, ThreadBackend};
pub use unit::{ExecutionUnit, UnitEvent, UnitEvents, WorkerBackend};
pub use worker::WorkerSnapshot;
