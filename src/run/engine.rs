use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long a cancelled run waits for the output reader to hit EOF before
/// escalating to SIGKILL on the whole process group.
const CANCEL_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Immutable description of one task invocation, composed by the
/// coordinator at start time.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub interpreter: String,
    pub script: PathBuf,
    pub input_files: Vec<PathBuf>,
    /// Working directory for the child; the task's own directory.
    pub working_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Parameter values already realized to environment entries
    /// (upper-cased names, stringified values).
    pub env_overlay: BTreeMap<String, String>,
}

/// The single terminal result delivered exactly once per started run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Success,
    Failed { code: Option<i32>, message: String },
    Cancelled,
}

impl RunOutcome {
    pub fn message(&self) -> String {
        match self {
            RunOutcome::Success => "Task completed successfully".to_string(),
            RunOutcome::Failed { message, .. } => message.clone(),
            RunOutcome::Cancelled => "Task cancelled".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}

/// Events on a run's channel: output lines in the exact order the child
/// produced them, then one terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Line(String),
    Terminated(RunOutcome),
}

/// A spawned child plus the read end of its output pipe.
pub struct SpawnedTask {
    pub child: Child,
    pub output: os_pipe::PipeReader,
}

/// Launch seam, so tests can substitute how children come to life.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, request: &RunRequest) -> anyhow::Result<SpawnedTask>;
}

/// Spawns the interpreter as a local child process with the prepared
/// environment: a snapshot of the host environment taken at launch,
/// overlaid with OUTPUT_DIR and the realized parameter entries.
///
/// Both stdout and stderr are wired to the write end of one shared pipe, so
/// lines from the two streams interleave in exactly the order the child
/// wrote them. The child is made leader of its own process group, so a
/// termination signal also reaches any subprocesses it spawned.
pub struct LocalSpawner;

#[async_trait]
impl Spawner for LocalSpawner {
    async fn spawn(&self, request: &RunRequest) -> anyhow::Result<SpawnedTask> {
        let (reader, writer) = os_pipe::pipe().context("failed to create output pipe")?;
        let writer_clone = writer
            .try_clone()
            .context("failed to clone output pipe writer")?;

        let mut cmd = Command::new(&request.interpreter);
        cmd.arg(&request.script);
        for file in &request.input_files {
            cmd.arg(file);
        }
        cmd.current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(writer_clone)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        // Explicit snapshot: later mutations of the host environment must
        // not leak into an already-launched child.
        cmd.env_clear();
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("OUTPUT_DIR", &request.output_dir);
        for (key, value) in &request.env_overlay {
            cmd.env(key, value);
        }

        let child = cmd.spawn().with_context(|| {
            format!(
                "failed to launch {} {:?}",
                request.interpreter, request.script
            )
        })?;
        // `cmd` drops here, closing the parent's copies of the write end;
        // EOF on the read end then means every writer has exited.
        Ok(SpawnedTask {
            child,
            output: reader,
        })
    }
}

/// Control handle for one started run.
#[derive(Clone)]
pub struct RunHandle {
    id: Uuid,
    cancel_requested: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    finished: Arc<AtomicBool>,
}

impl RunHandle {
    /// Request cooperative cancellation: halts further line delivery and
    /// asks the child to terminate gracefully. The terminal Cancelled
    /// event still arrives on the channel. No-op once the run has
    /// already terminated, and idempotent while it is running.
    pub fn stop(&self) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(run = %self.id, "cancellation requested");
        self.cancel_notify.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Launches task runs and streams their merged output.
///
/// Each run owns a dedicated tokio task, its own child process and its own
/// event channel; concurrent runs share nothing. The channel is unbounded:
/// task output is operator-scale text and the consumer is expected to keep
/// draining, so lines are never dropped.
pub struct ExecutionEngine {
    spawner: Arc<dyn Spawner>,
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionEngine {
    pub fn new() -> Self {
        Self {
            spawner: Arc::new(LocalSpawner),
        }
    }

    pub fn with_spawner(spawner: Arc<dyn Spawner>) -> Self {
        Self { spawner }
    }

    /// Start a run. All reads happen on the run's own task, which pushes
    /// output lines through the returned channel followed by exactly one
    /// `Terminated`. The caller is never blocked on the child.
    pub fn start(&self, request: RunRequest) -> (RunHandle, UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RunHandle {
            id: Uuid::new_v4(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            cancel_notify: Arc::new(Notify::new()),
            finished: Arc::new(AtomicBool::new(false)),
        };

        let spawner = Arc::clone(&self.spawner);
        let driver = handle.clone();
        tokio::spawn(async move {
            let outcome = drive_run(spawner, request, &driver, &tx).await;
            driver.finished.store(true, Ordering::SeqCst);
            debug!(run = %driver.id, ?outcome, "run terminated");
            // The receiver may already be gone; the run is over either way.
            let _ = tx.send(EngineEvent::Terminated(outcome));
        });

        (handle, rx)
    }
}

/// Run the child to completion. Never returns an error: every failure
/// mode becomes a terminal outcome instead.
async fn drive_run(
    spawner: Arc<dyn Spawner>,
    request: RunRequest,
    handle: &RunHandle,
    tx: &UnboundedSender<EngineEvent>,
) -> RunOutcome {
    let SpawnedTask { mut child, output } = match spawner.spawn(&request).await {
        Ok(spawned) => spawned,
        Err(e) => {
            warn!(run = %handle.id, "spawn failed: {:#}", e);
            return RunOutcome::Failed {
                code: None,
                message: format!("Error running task: {:#}", e),
            };
        }
    };

    // child.id() is gone once the child has been reaped; keep the group id.
    let pid = child.id();

    // One pipe, one reader: pipe reads are blocking, so the loop runs on
    // the blocking pool and feeds the channel from there.
    let mut reader = tokio::task::spawn_blocking({
        let tx = tx.clone();
        let cancel = Arc::clone(&handle.cancel_requested);
        move || pump_lines(output, tx, cancel)
    });

    let status = tokio::select! {
        status = child.wait() => status,
        _ = handle.cancel_notify.notified() => {
            terminate(&mut child, pid);
            child.wait().await
        }
    };

    // A cancel that raced a natural exit still reports Cancelled, so the
    // handle never yields a success after stop().
    if handle.cancel_requested.load(Ordering::SeqCst) {
        // The group signal closes the write ends held by any grandchildren.
        // A survivor that ignores it must not withhold the terminal event:
        // give the reader a bounded grace, then SIGKILL the group.
        if timeout(CANCEL_DRAIN_GRACE, &mut reader).await.is_err() {
            kill_group(pid);
            let _ = timeout(CANCEL_DRAIN_GRACE, &mut reader).await;
        }
        return RunOutcome::Cancelled;
    }

    // Drain the reader so every produced line precedes the terminal event.
    let _ = reader.await;

    match status {
        Ok(status) if status.success() => RunOutcome::Success,
        Ok(status) => match status.code() {
            Some(code) => RunOutcome::Failed {
                code: Some(code),
                message: format!("Task failed with exit code {}", code),
            },
            None => RunOutcome::Failed {
                code: None,
                message: "Task terminated by signal".to_string(),
            },
        },
        Err(e) => RunOutcome::Failed {
            code: None,
            message: format!("Error waiting for task: {}", e),
        },
    }
}

/// Read loop for the shared output pipe, delivering whole lines as they
/// are produced. Halts early once cancellation is requested; EOF arrives
/// when the last holder of the write end has exited.
fn pump_lines(
    output: os_pipe::PipeReader,
    tx: UnboundedSender<EngineEvent>,
    cancel: Arc<AtomicBool>,
) {
    for line in BufReader::new(output).lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        if tx.send(EngineEvent::Line(line)).is_err() {
            break;
        }
    }
}

/// Graceful termination request: SIGTERM to the child's process group on
/// Unix (reaching its subprocesses too), plain kill elsewhere.
#[cfg(unix)]
fn terminate(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM) {
            warn!("failed to signal process group {}: {}", pid, e);
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

/// Last resort for a group that survived SIGTERM.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let _ = kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}
