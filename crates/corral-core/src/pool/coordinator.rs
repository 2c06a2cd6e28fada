//! The worker pool coordinator.
//!
//! All state lives in one [`PoolState`] behind a mutex. Every transition (submission, a unit
//! event, a deadline firing, shutdown) takes the lock, mutates, re-runs dispatch and
//! releases it without awaiting. Unit events and deadlines arrive over one channel drained
//! by an event loop that only holds a weak reference to the pool.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::PoolConfig;
use super::task::{Task, TaskHandle};
use super::unit::{ExecutionUnit, PoolEvent, UnitEvent, UnitEvents, WorkerBackend};
use super::worker::{WorkerSlot, WorkerSnapshot};
use crate::error::{Error, Result};
use crate::ipc::{Payload, ReplyMessage, TaskMessage};
use crate::serialize::{ErrorSerializer, MessageSerializer, SerializerConfig};
use crate::value::Value;

/// Read-only snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_workers: usize,
    pub available_workers: usize,
    pub busy_workers: usize,
    pub queued_tasks: usize,
    pub is_shutting_down: bool,
}

struct PoolState {
    workers: BTreeMap<usize, WorkerSlot>,
    /// Idle workers in the order they became idle.
    available: VecDeque<usize>,
    /// Dispatched tasks and the worker running each.
    in_flight: FxHashMap<String, (Task, usize)>,
    queue: VecDeque<Task>,
    serializer: MessageSerializer,
    shutting_down: bool,
}

struct PoolShared {
    config: PoolConfig,
    backend: Arc<dyn WorkerBackend>,
    events: mpsc::UnboundedSender<PoolEvent>,
    runtime: Handle,
    state: Mutex<PoolState>,
}

/// Fixed-capacity pool of isolated workers.
///
/// Must be created inside a tokio runtime.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Create a pool whose payloads travel without type information.
    pub fn new(config: PoolConfig, backend: impl WorkerBackend + 'static) -> Result<Self> {
        Self::with_serializer(
            config,
            backend,
            MessageSerializer::new(SerializerConfig::default()),
        )
    }

    /// Create a pool using `serializer` for outbound payloads and inbound results.
    pub fn with_serializer(
        config: PoolConfig,
        backend: impl WorkerBackend + 'static,
        serializer: MessageSerializer,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| Error::Spawn("worker pool requires a tokio runtime".to_string()))?;
        let backend: Arc<dyn WorkerBackend> = Arc::new(backend);
        let (events, rx) = mpsc::unbounded_channel();

        let mut workers = BTreeMap::new();
        let mut available = VecDeque::with_capacity(config.pool_size);
        for id in 0..config.pool_size {
            let unit = backend.spawn(id, UnitEvents::new(id, 0, events.clone()))?;
            workers.insert(id, WorkerSlot::new(id, unit, 0, 0));
            available.push_back(id);
        }

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                workers,
                available,
                in_flight: FxHashMap::default(),
                queue: VecDeque::with_capacity(config.max_queue_size),
                serializer,
                shutting_down: false,
            }),
            config,
            backend,
            events,
            runtime,
        });
        shared
            .runtime
            .spawn(run_events(Arc::downgrade(&shared), rx));

        info!(
            "Worker pool started with {} workers (queue capacity {})",
            shared.config.pool_size, shared.config.max_queue_size
        );
        Ok(Self { shared })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Submit a task.
    ///
    /// Fails immediately with [`Error::QueueFull`] or [`Error::PoolShuttingDown`]. Every
    /// other outcome, including timeouts and crashes, arrives through the handle.
    /// `timeout` defaults to the configured worker timeout and counts from now.
    pub fn execute(&self, data: Value, timeout: Option<Duration>) -> Result<TaskHandle> {
        let shared = &self.shared;
        let mut state = shared.lock();

        if state.shutting_down {
            return Err(Error::PoolShuttingDown);
        }
        if state.queue.len() >= shared.config.max_queue_size {
            debug!("Rejecting task: queue full ({} queued)", state.queue.len());
            return Err(Error::QueueFull {
                capacity: shared.config.max_queue_size,
            });
        }

        let id = Uuid::new_v4().to_string();
        let timeout = timeout.unwrap_or(shared.config.worker_timeout);
        let timer = {
            let events = shared.events.clone();
            let task_id = id.clone();
            shared
                .runtime
                .spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = events.send(PoolEvent::Timeout { task_id });
                })
                .abort_handle()
        };

        let (task, handle) = Task::new(id, data, timeout, timer);
        debug!("Queued task {}", task.id);
        state.queue.push_back(task);
        shared.process_queue(&mut state);
        Ok(handle)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            total_workers: state.workers.len(),
            available_workers: state.available.len(),
            busy_workers: state.workers.values().filter(|w| w.is_busy()).count(),
            queued_tasks: state.queue.len(),
            is_shutting_down: state.shutting_down,
        }
    }

    /// Per-worker view, ordered by worker id.
    pub fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        self.shared
            .lock()
            .workers
            .values()
            .map(WorkerSlot::snapshot)
            .collect()
    }

    /// Stop accepting work and terminate every worker.
    ///
    /// Queued and in-flight tasks are rejected with [`Error::PoolShuttingDown`]. Resolves
    /// once every unit has been terminated; termination errors are only logged.
    pub async fn shutdown(&self) {
        let units: Vec<Box<dyn ExecutionUnit>> = {
            let mut state = self.shared.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;

            let queued = state.queue.len();
            let in_flight = state.in_flight.len();
            for task in state.queue.drain(..) {
                task.settle(Err(Error::PoolShuttingDown));
            }
            for (_, (task, _)) in state.in_flight.drain() {
                task.settle(Err(Error::PoolShuttingDown));
            }
            state.available.clear();
            info!(
                "Shutting down worker pool ({} queued, {} in flight rejected)",
                queued, in_flight
            );

            std::mem::take(&mut state.workers)
                .into_values()
                .map(|slot| slot.unit)
                .collect()
        };

        join_all(units.into_iter().map(|mut unit| async move {
            if let Err(e) = unit.terminate().await {
                debug!("Ignoring worker termination error: {}", e);
            }
        }))
        .await;
        info!("Worker pool shut down");
    }
}

async fn run_events(pool: Weak<PoolShared>, mut rx: mpsc::UnboundedReceiver<PoolEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(shared) = pool.upgrade() else {
            break;
        };
        shared.handle_event(event);
    }
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand queued tasks to idle workers in submission order.
    fn process_queue(&self, state: &mut PoolState) {
        while !state.queue.is_empty() {
            let Some(worker_id) = state.available.pop_front() else {
                break;
            };
            let Some(task) = state.queue.pop_front() else {
                break;
            };

            let payload = match Payload::encode(&mut state.serializer, &task.data) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!("Task {} payload rejected: {}", task.id, e);
                    state.available.push_front(worker_id);
                    task.settle(Err(e));
                    continue;
                }
            };

            let posted = match state.workers.get_mut(&worker_id) {
                Some(slot) => {
                    slot.assign(&task.id);
                    slot.unit.post(TaskMessage {
                        task_id: task.id.clone(),
                        data: payload,
                    })
                }
                None => Err(Error::Ipc(format!("worker {worker_id} is gone"))),
            };

            match posted {
                Ok(()) => {
                    debug!(
                        "Dispatched task {} to worker {} after {:?} in queue",
                        task.id,
                        worker_id,
                        task.enqueued_at.elapsed()
                    );
                    state.in_flight.insert(task.id.clone(), (task, worker_id));
                }
                Err(e) => {
                    warn!("Failed to post task {} to worker {}: {}", task.id, worker_id, e);
                    if let Some(slot) = state.workers.get_mut(&worker_id) {
                        slot.release();
                    }
                    task.settle(Err(Error::WorkerCrash {
                        worker_id,
                        message: e.to_string(),
                    }));
                    self.recover_worker(state, worker_id);
                }
            }
        }
    }

    fn handle_event(&self, event: PoolEvent) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }

        match event {
            PoolEvent::Timeout { task_id } => self.on_timeout(&mut state, &task_id),
            PoolEvent::Unit {
                worker_id,
                generation,
                event,
            } => {
                let current = state.workers.get(&worker_id).map(|w| w.generation);
                if current != Some(generation) {
                    debug!(
                        "Ignoring event from replaced unit {} (generation {})",
                        worker_id, generation
                    );
                    return;
                }
                match event {
                    UnitEvent::Reply(reply) => self.on_reply(&mut state, reply),
                    UnitEvent::Crashed(message) => self.on_crash(&mut state, worker_id, message),
                    UnitEvent::Exited(code) => {
                        let message = match code {
                            Some(code) => format!("worker exited unexpectedly with code {code}"),
                            None => "worker exited unexpectedly".to_string(),
                        };
                        self.on_crash(&mut state, worker_id, message)
                    }
                }
            }
        }

        self.process_queue(&mut state);
    }

    fn on_reply(&self, state: &mut PoolState, reply: ReplyMessage) {
        let Some((task, worker_id)) = state.in_flight.remove(&reply.task_id) else {
            debug!("Discarding stale reply for task {}", reply.task_id);
            return;
        };

        if let Some(slot) = state.workers.get_mut(&worker_id) {
            slot.release();
        }
        state.available.push_back(worker_id);

        let result = if reply.success {
            match reply.result {
                Some(payload) => payload.decode(&state.serializer),
                None => Ok(Value::Undefined),
            }
        } else {
            let error = reply.error.as_deref().unwrap_or("Unknown error");
            Err(Error::TaskFailed(ErrorSerializer::from_reply(error)))
        };
        debug!(
            "Task {} settled by worker {} (success: {})",
            task.id, worker_id, reply.success
        );
        task.settle(result);
    }

    fn on_timeout(&self, state: &mut PoolState, task_id: &str) {
        let task = if let Some((task, worker_id)) = state.in_flight.remove(task_id) {
            // The unit keeps running the task; its reply will be discarded.
            if let Some(slot) = state.workers.get_mut(&worker_id) {
                slot.release();
            }
            state.available.push_back(worker_id);
            task
        } else if let Some(pos) = state.queue.iter().position(|t| t.id == task_id) {
            match state.queue.remove(pos) {
                Some(task) => task,
                None => return,
            }
        } else {
            return;
        };

        warn!("Task {} timed out after {:?}", task.id, task.timeout);
        let error = Error::TaskTimeout {
            task_id: task.id.clone(),
            timeout: task.timeout,
        };
        task.settle(Err(error));
    }

    fn on_crash(&self, state: &mut PoolState, worker_id: usize, message: String) {
        warn!("Worker {} crashed: {}", worker_id, message);

        let current = state
            .workers
            .get_mut(&worker_id)
            .and_then(WorkerSlot::release);
        if let Some((task, _)) = current.and_then(|task_id| state.in_flight.remove(&task_id)) {
            task.settle(Err(Error::WorkerCrash { worker_id, message }));
        }

        self.recover_worker(state, worker_id);
    }

    /// Replace a failed worker under the same id, or drop it once its restarts run out.
    fn recover_worker(&self, state: &mut PoolState, worker_id: usize) {
        state.available.retain(|id| *id != worker_id);
        let Some(old) = state.workers.remove(&worker_id) else {
            return;
        };
        let WorkerSlot {
            unit,
            restarts,
            generation,
            ..
        } = old;
        self.terminate_in_background(unit);

        if !self.config.restart_on_error || restarts >= self.config.max_restarts {
            warn!(
                "Removing worker {} after {} restarts ({} workers left)",
                worker_id,
                restarts,
                state.workers.len()
            );
            return;
        }

        let generation = generation + 1;
        let events = UnitEvents::new(worker_id, generation, self.events.clone());
        match self.backend.spawn(worker_id, events) {
            Ok(unit) => {
                info!("Restarted worker {} (restart {})", worker_id, restarts + 1);
                state.workers.insert(
                    worker_id,
                    WorkerSlot::new(worker_id, unit, restarts + 1, generation),
                );
                state.available.push_back(worker_id);
            }
            Err(e) => {
                warn!("Failed to restart worker {}, removing it: {}", worker_id, e);
            }
        }
    }

    fn terminate_in_background(&self, mut unit: Box<dyn ExecutionUnit>) {
        self.runtime.spawn(async move {
            if let Err(e) = unit.terminate().await {
                debug!("Ignoring worker termination error: {}", e);
            }
        });
    }
}
