//! Execution units backed by OS threads.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

use super::unit::{ExecutionUnit, UnitEvents, WorkerBackend};
use crate::error::{Error, Result};
use crate::ipc::{run_task, TaskMessage};
use crate::serialize::{MessageSerializer, SerializerConfig};
use crate::value::Value;

/// Work run by a thread unit. The error side is the thrown value.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, data: Value) -> std::result::Result<Value, Value>;
}

impl<F> TaskHandler for F
where
    F: Fn(Value) -> std::result::Result<Value, Value> + Send + Sync + 'static,
{
    fn handle(&self, data: Value) -> std::result::Result<Value, Value> {
        self(data)
    }
}

/// Spawns one named thread per worker, each running the same handler.
///
/// A panicking handler crashes its unit.
pub struct ThreadBackend {
    handler: Arc<dyn TaskHandler>,
    serializer: MessageSerializer,
}

impl ThreadBackend {
    pub fn new(handler: impl TaskHandler) -> Self {
        Self::with_serializer(handler, MessageSerializer::new(SerializerConfig::default()))
    }

    /// Use `serializer` on the worker side to decode payloads and encode results.
    pub fn with_serializer(handler: impl TaskHandler, serializer: MessageSerializer) -> Self {
        Self {
            handler: Arc::new(handler),
            serializer,
        }
    }
}

impl WorkerBackend for ThreadBackend {
    fn spawn(&self, worker_id: usize, events: UnitEvents) -> Result<Box<dyn ExecutionUnit>> {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::clone(&self.handler);
        let mut serializer = self.serializer.clone();

        thread::Builder::new()
            .name(format!("corral-worker-{worker_id}"))
            .spawn(move || {
                while let Some(command) = rx.blocking_recv() {
                    let message = match command {
                        Command::Run(message) => message,
                        Command::Stop => break,
                    };
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        run_task(message, &mut serializer, |data| handler.handle(data))
                    }));
                    match outcome {
                        Ok(reply) => events.reply(reply),
                        Err(panic) => {
                            events.crashed(panic_message(panic.as_ref()));
                            return;
                        }
                    }
                }
                debug!("Worker thread {} stopped", worker_id);
            })
            .map_err(|e| Error::Spawn(format!("failed to spawn worker thread: {e}")))?;

        Ok(Box::new(ThreadUnit { commands }))
    }
}

enum Command {
    Run(TaskMessage),
    Stop,
}

struct ThreadUnit {
    commands: UnboundedSender<Command>,
}

#[async_trait]
impl ExecutionUnit for ThreadUnit {
    fn post(&mut self, message: TaskMessage) -> Result<()> {
        self.commands
            .send(Command::Run(message))
            .map_err(|_| Error::Ipc("worker thread has stopped".to_string()))
    }

    /// Ask the thread to stop after its current task. Does not wait for it.
    async fn terminate(&mut self) -> Result<()> {
        // Already gone after a crash.
        let _ = self.commands.send(Command::Stop);
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}
