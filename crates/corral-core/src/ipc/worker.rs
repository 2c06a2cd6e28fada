//! Worker process management for corral tasks.
//!
//! Provides `ProcessBackend`, which runs each execution unit as a `corral-worker`
//! subprocess and talks to it over framed stdin/stdout.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::protocol::{read_frame_async, write_frame_async, Encoding, ReplyMessage, TaskMessage};
use crate::error::{Error, Result};
use crate::pool::{ExecutionUnit, UnitEvents, WorkerBackend};

const WORKER_NAME: &str = if cfg!(windows) {
    "corral-worker.exe"
} else {
    "corral-worker"
};

/// Find the corral-worker binary path.
///
/// Looks in the following order:
/// 1. `CORRAL_WORKER_PATH` environment variable
/// 2. Same directory as the current executable (and its parent, for test binaries)
/// 3. System PATH
/// 4. `target/debug` or `target/release` of this workspace
pub fn find_worker_binary() -> Result<PathBuf> {
    // 1. Check environment variable
    if let Ok(path) = std::env::var("CORRAL_WORKER_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    // 2. Look next to current executable
    if let Ok(exe_path) = std::env::current_exe() {
        for dir in exe_path.ancestors().skip(1).take(2) {
            let worker_path = dir.join(WORKER_NAME);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    // 3. Try system PATH via which
    if let Ok(path) = which::which(WORKER_NAME) {
        return Ok(path);
    }

    // 4. For development: try target/debug or target/release
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    for profile in ["debug", "release"] {
        let path = manifest_dir
            .join("..")
            .join("..")
            .join("target")
            .join(profile)
            .join(WORKER_NAME);
        if path.exists() {
            return Ok(path.canonicalize().unwrap_or(path));
        }
    }

    Err(Error::Spawn(
        "Could not find corral-worker binary. Set CORRAL_WORKER_PATH or ensure it's in PATH."
            .to_string(),
    ))
}

/// Runs each execution unit as a `corral-worker` subprocess.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    binary: PathBuf,
    encoding: Encoding,
    args: Vec<String>,
    runtime: Handle,
}

impl ProcessBackend {
    /// Locate the worker binary with [`find_worker_binary`].
    ///
    /// Must be called inside a tokio runtime.
    pub fn new() -> Result<Self> {
        Self::with_binary(find_worker_binary()?)
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| Error::Spawn("process backend requires a tokio runtime".to_string()))?;
        Ok(Self {
            binary: binary.into(),
            encoding: Encoding::default(),
            args: Vec::new(),
            runtime,
        })
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Ask workers to rebuild special types from type information.
    pub fn preserve_types(self) -> Self {
        self.arg("--preserve-types").arg("--include-type-info")
    }

    /// Pass an extra command-line argument to every worker.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }
}

impl WorkerBackend for ProcessBackend {
    fn spawn(&self, worker_id: usize, events: UnitEvents) -> Result<Box<dyn ExecutionUnit>> {
        let _guard = self.runtime.enter();

        let mut child = Command::new(&self.binary)
            .arg("--encoding")
            .arg(self.encoding.as_str())
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let worker stderr pass through for debugging
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Spawn(format!(
                    "Failed to spawn worker process '{}': {}",
                    self.binary.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;
        debug!("Spawned worker {} (pid {:?})", worker_id, child.id());

        let encoding = self.encoding;
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<TaskMessage>();
        let (kill, kill_rx) = oneshot::channel();
        let (done_tx, done) = oneshot::channel();

        self.runtime.spawn(async move {
            let mut stdin = stdin;
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write_frame_async(&mut stdin, encoding, &message).await {
                    // The exit is reported by the supervisor.
                    debug!("Worker {} stdin closed: {}", worker_id, e);
                    break;
                }
            }
        });

        let reader_events = events.clone();
        self.runtime.spawn(async move {
            loop {
                match read_frame_async::<_, ReplyMessage>(&mut stdout, encoding).await {
                    Ok(Some(reply)) => reader_events.reply(reply),
                    Ok(None) => break,
                    Err(e) => {
                        reader_events.crashed(format!("unreadable reply: {e}"));
                        break;
                    }
                }
            }
        });

        self.runtime
            .spawn(supervise(child, worker_id, events, kill_rx, done_tx));

        Ok(Box::new(ProcessUnit {
            outbound,
            kill: Some(kill),
            done: Some(done),
        }))
    }
}

/// Report an exit nobody asked for, or kill the child on request.
async fn supervise(
    mut child: Child,
    worker_id: usize,
    events: UnitEvents,
    kill_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<()>,
) {
    let killed = tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for worker {}: {}", worker_id, e);
                    None
                }
            };
            events.exited(code);
            false
        }
        // Either an explicit kill or the unit was dropped.
        _ = kill_rx => true,
    };

    if killed {
        if let Err(e) = child.kill().await {
            debug!("Failed to kill worker {}: {}", worker_id, e);
        }
    }
    let _ = done_tx.send(());
}

struct ProcessUnit {
    outbound: mpsc::UnboundedSender<TaskMessage>,
    kill: Option<oneshot::Sender<()>>,
    done: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl ExecutionUnit for ProcessUnit {
    fn post(&mut self, message: TaskMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| Error::Ipc("worker process has exited".to_string()))
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if let Some(done) = self.done.take() {
            done.await
                .map_err(|_| Error::Ipc("worker supervisor went away".to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require the corral-worker binary to be built.
    // Run `cargo build -p corral-worker` first.

    #[test]
    #[ignore = "Requires corral-worker binary"]
    fn test_find_worker_binary() {
        let path = find_worker_binary().unwrap();
        assert!(path.ends_with(WORKER_NAME));
    }

    #[test]
    fn test_backend_needs_runtime() {
        assert!(matches!(
            ProcessBackend::with_binary("corral-worker"),
            Err(Error::Spawn(_))
        ));
    }
}
