//! Sandbox backends
//!
//! A sandbox is an isolated execution context in which the commands of one
//! job (or of a pipeline's sidecar) run. Two backends implement the same
//! contract:
//! - `ContainerBackend`: one long-lived container per sandbox, driven through
//!   a container engine CLI (podman or docker)
//! - `ProcessBackend`: bare host processes, with a bookkeeping handle only
//!
//! Everything above this module talks to `dyn SandboxBackend` and never
//! knows which variant it is using.

mod container;
mod process;

pub use container::ContainerBackend;
pub use process::ProcessBackend;

use async_trait::async_trait;
use sluice_core::domain::auth::AuthConfigs;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors raised by sandbox operations
///
/// `NonZeroExit` is the only variant describing a failure of the sandboxed
/// command itself; every other variant is an infrastructure failure.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The command ran and exited with a code greater than zero
    #[error("command exited with code {code}")]
    NonZeroExit { code: i32 },

    /// The caller canceled the operation
    #[error("operation canceled")]
    Canceled,

    /// The backend or engine failed
    #[error("sandbox engine error: {0}")]
    Engine(String),

    /// Spawning or talking to a process failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// True when the sandboxed command itself failed
    pub fn is_command_failure(&self) -> bool {
        matches!(self, SandboxError::NonZeroExit { .. })
    }
}

/// Result type for sandbox operations
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Consumer receiving command output one line at a time
pub type OutputFn = Box<dyn FnMut(&str) + Send>;

/// Borrowed line consumer used while preparing images
pub type LineSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Host directory exposed inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub source: PathBuf,
    pub target: String,
}

impl Volume {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A command to run inside a sandbox
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

impl ExecRequest {
    /// Runs `cmd` with both output streams attached
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            attach_stdout: true,
            attach_stderr: true,
            ..Default::default()
        }
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

/// Handle to a live sandbox
///
/// Cheap to clone. Tracks the commands currently running in it so that
/// destroying the sandbox can stop them.
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<SandboxInner>,
}

struct SandboxInner {
    id: String,
    name: String,
    running: Mutex<HashMap<u64, Tracked>>,
    next_command: AtomicU64,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Sandbox {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SandboxInner {
                id: id.into(),
                name: name.into(),
                running: Mutex::new(HashMap::new()),
                next_command: AtomicU64::new(0),
            }),
        }
    }

    /// Backend-assigned identity
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of commands currently running in the sandbox
    #[cfg(test)]
    pub fn running_commands(&self) -> usize {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Registers a running command; the registration ends when the guard drops
    ///
    /// `group` is the id of the process group the command leads, if any.
    fn track(&self, group: Option<u32>) -> RunningCommand {
        let key = self.inner.next_command.fetch_add(1, Ordering::Relaxed);
        let kill = CancellationToken::new();
        self.inner
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                key,
                Tracked {
                    kill: kill.clone(),
                    group,
                },
            );

        RunningCommand {
            sandbox: self.clone(),
            key,
            kill,
            group,
            finished: false,
        }
    }

    /// Stops every running command together with its descendants
    fn kill_all(&self) {
        let running = self.inner.running.lock().unwrap_or_else(|e| e.into_inner());
        for tracked in running.values() {
            tracked.kill.cancel();
            if let Some(group) = tracked.group {
                kill_process_group(group);
            }
        }
    }
}

struct Tracked {
    kill: CancellationToken,
    group: Option<u32>,
}

/// Registration of one running command in its sandbox
///
/// Dropping it before `finish` kills the command's whole process group.
struct RunningCommand {
    sandbox: Sandbox,
    key: u64,
    kill: CancellationToken,
    group: Option<u32>,
    finished: bool,
}

impl RunningCommand {
    /// Marks the command as exited and reaped
    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for RunningCommand {
    fn drop(&mut self) {
        if !self.finished
            && let Some(group) = self.group
        {
            kill_process_group(group);
        }
        self.sandbox
            .inner
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Sends SIGKILL to every process in the group led by `group`
#[cfg(unix)]
fn kill_process_group(group: u32) {
    let Ok(group) = libc::pid_t::try_from(group) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let _ = unsafe { libc::kill(-group, libc::SIGKILL) };
}

#[cfg(not(unix))]
fn kill_process_group(_group: u32) {}

/// Capability set every sandbox backend provides
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short backend name for logs ("container", "process")
    fn name(&self) -> &'static str;

    /// Whether volume targets are distinct paths inside the sandbox
    ///
    /// When false, sandboxes see the host filesystem and callers must use
    /// host paths directly.
    fn isolates_filesystem(&self) -> bool;

    /// Allocates and starts an isolated execution context
    async fn create(&self, name: &str, image: &str, volumes: &[Volume]) -> SandboxResult<Sandbox>;

    /// Destroys a sandbox, stopping anything still running in it
    ///
    /// Idempotent: destroying an already destroyed sandbox succeeds.
    async fn destroy(&self, sandbox: &Sandbox) -> SandboxResult<()>;

    /// Makes sure the image (or runtime) is available locally
    ///
    /// Pull progress goes to `output`; a final "using image" line goes to
    /// `info`. `pull_configs` is ordered by increasing precedence.
    async fn prepare(
        &self,
        image: &str,
        output: LineSink<'_>,
        info: LineSink<'_>,
        pull_configs: &[AuthConfigs],
    ) -> SandboxResult<()>;

    /// Runs a command, streaming combined output line by line to `output`
    ///
    /// Returns `NonZeroExit` when the command exits with a code greater than
    /// zero and `Canceled` as soon as `cancel` fires.
    async fn exec(
        &self,
        sandbox: &Sandbox,
        request: ExecRequest,
        output: OutputFn,
        cancel: CancellationToken,
    ) -> SandboxResult<()>;

    /// Destroys every sandbox left behind by a previous run of this runner
    async fn cleanup(&self) -> SandboxResult<()>;
}

/// Spawns `command` and streams its output until it exits
///
/// Shared by both backends. The command leads its own process group; the
/// group is killed when `cancel` fires, when the sandbox it belongs to is
/// destroyed, or when this future is dropped early.
async fn stream_command(
    mut command: Command,
    sandbox: &Sandbox,
    attach_stdout: bool,
    attach_stderr: bool,
    mut output: OutputFn,
    cancel: &CancellationToken,
) -> SandboxResult<()> {
    let piped = |attach: bool| if attach { Stdio::piped() } else { Stdio::null() };
    command
        .stdin(Stdio::null())
        .stdout(piped(attach_stdout))
        .stderr(piped(attach_stderr))
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    // Declared after `child` so the group is signalled before the leader is
    // reaped on drop.
    let mut running = sandbox.track(child.id());

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx.clone()));
    }
    drop(tx);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                return Err(SandboxError::Canceled);
            }
            _ = running.kill.cancelled() => {
                let _ = child.start_kill();
                return Err(SandboxError::Engine(format!(
                    "sandbox {} was destroyed while the command was running",
                    sandbox.name()
                )));
            }
            line = rx.recv() => match line {
                Some(line) => output(&line),
                None => break,
            },
        }
    }

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            return Err(SandboxError::Canceled);
        }
        status = child.wait() => status?,
    };
    running.finish();

    match status.code() {
        Some(0) => Ok(()),
        Some(code) if code > 0 => Err(SandboxError::NonZeroExit { code }),
        Some(code) => Err(SandboxError::Engine(format!("unexpected exit code {code}"))),
        None => Err(SandboxError::Engine(
            "command was terminated by a signal".to_string(),
        )),
    }
}

/// Forwards every line of `reader` (without its terminator) to `tx`
async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    break;
                }
            }
        }
    }
}

/// Collects output lines into a shared vector
#[cfg(test)]
pub(crate) fn collect_lines() -> (OutputFn, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    (
        Box::new(move |line: &str| sink.lock().unwrap().push(line.to_string())),
        lines,
    )
}
