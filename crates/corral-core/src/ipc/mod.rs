//! Inter-process communication for corral workers.
//!
//! This module provides the wire format, the framing used on worker byte streams, and
//! the subprocess backend that runs tasks in `corral-worker` processes.

pub mod protocol;
mod wire;
mod worker;

pub use protocol::{
    read_frame, read_frame_async, run_task, write_frame, write_frame_async, Encoding,
    ReplyMessage, TaskMessage, MAX_FRAME_LEN,
};
pub use wire::{Payload, WireValue};
pub use worker::{find_worker_binary, ProcessBackend};
