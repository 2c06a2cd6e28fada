//! Submitted tasks and the handles callers await.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::{Error, Result};
use crate::value::Value;

/// A task owned by the coordinator from submission until it settles.
pub(crate) struct Task {
    pub(crate) id: String,
    pub(crate) data: Value,
    pub(crate) timeout: Duration,
    pub(crate) enqueued_at: Instant,
    timer: AbortHandle,
    reply: oneshot::Sender<Result<Value>>,
}

impl Task {
    pub(crate) fn new(
        id: String,
        data: Value,
        timeout: Duration,
        timer: AbortHandle,
    ) -> (Self, TaskHandle) {
        let (reply, rx) = oneshot::channel();
        let task = Self {
            id: id.clone(),
            data,
            timeout,
            enqueued_at: Instant::now(),
            timer,
            reply,
        };
        (task, TaskHandle { id, rx })
    }

    /// Stop the deadline timer and deliver the outcome.
    pub(crate) fn settle(self, result: Result<Value>) {
        self.timer.abort();
        // The caller dropped its handle.
        let _ = self.reply.send(result);
    }
}

/// Resolves with the outcome of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    id: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for TaskHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Disconnected)))
    }
}
