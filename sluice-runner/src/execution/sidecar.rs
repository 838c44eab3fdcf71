//! Pipeline sidecar
//!
//! One helper sandbox per pipeline. It owns the git checkout and runs the
//! ssh-agent whose socket every job sandbox of the pipeline mounts. Both
//! live under `<work_dir>/<pipeline_id>` on the host:
//!
//! ```text
//! <work_dir>/<pipeline_id>/src   checkout          (/ci/src in sandboxes)
//! <work_dir>/<pipeline_id>/ssh   agent socket dir  (/ci/ssh in sandboxes)
//! ```
//!
//! Backends that do not isolate the filesystem see the host paths directly.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sluice_core::domain::auth::AuthConfigs;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ExecutionOptions, JobError};
use crate::sandbox::{ExecRequest, LineSink, OutputFn, Sandbox, SandboxBackend, Volume};

/// Mount point of the pipeline directory inside isolated sandboxes
const SANDBOX_ROOT: &str = "/ci";

/// Marker printed by ssh-agent once its socket is listening
const AGENT_READY_MARKER: &str = "SSH_AUTH_SOCK=";

const AGENT_SOCKET: &str = "agent.sock";

/// Adds the key to the agent and writes an ssh config disabling strict
/// host key checking. Secrets arrive through the environment only.
const AGENT_SETUP_SCRIPT: &str = r#"set -e
if [ -n "$SSH_PRIVATE_KEY" ]; then
  printf '%s\n' "$SSH_PRIVATE_KEY" | ssh-add - >/dev/null
fi
if [ -n "$SSH_KNOWN_HOSTS" ]; then
  printf '%s\n' "$SSH_KNOWN_HOSTS" > "$SSH_DIR/known_hosts"
fi
printf 'Host *\n  StrictHostKeyChecking no\n  UserKnownHostsFile %s/known_hosts\n' "$SSH_DIR" > "$SSH_DIR/config"
"#;

/// Sidecar of one pipeline
pub struct Sidecar {
    backend: Arc<dyn SandboxBackend>,
    sandbox: Sandbox,
    host_dir: PathBuf,
    root: String,
    isolated: bool,
    agent_cancel: CancellationToken,
    agent_task: Mutex<Option<JoinHandle<()>>>,
}

impl Sidecar {
    /// Prepares the sidecar image, creates the sandbox and starts the
    /// credential agent
    ///
    /// `ssh_key` and `known_hosts` are handed to the agent setup through the
    /// environment. On failure everything created so far is torn down.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        backend: Arc<dyn SandboxBackend>,
        options: &ExecutionOptions,
        pipeline_id: Uuid,
        pull_configs: &[AuthConfigs],
        ssh_key: Option<&str>,
        known_hosts: &str,
        log: LineSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<Self, JobError> {
        let image = &options.sidecar_image;
        let mut info = |line: &str| debug!(pipeline_id = %pipeline_id, "{}", line);
        tokio::select! {
            _ = cancel.cancelled() => return Err(JobError::Canceled),
            result = backend.prepare(image, &mut *log, &mut info, pull_configs) => result?,
        }

        let host_dir = options.work_dir.join(pipeline_id.to_string());
        tokio::fs::create_dir_all(&host_dir)
            .await
            .map_err(|e| JobError::Setup(format!("cannot create {}: {}", host_dir.display(), e)))?;

        let isolated = backend.isolates_filesystem();
        let (root, volumes) = if isolated {
            (
                SANDBOX_ROOT.to_string(),
                vec![Volume::new(host_dir.clone(), SANDBOX_ROOT)],
            )
        } else {
            (host_dir.display().to_string(), Vec::new())
        };

        let name = format!("sluice-sidecar-{}", pipeline_id);
        let sandbox = match backend.create(&name, image, &volumes).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&host_dir).await;
                return Err(e.into());
            }
        };

        let sidecar = Self {
            backend,
            sandbox,
            host_dir,
            root,
            isolated,
            agent_cancel: CancellationToken::new(),
            agent_task: Mutex::new(None),
        };

        let started = sidecar
            .start_agent(options, ssh_key, known_hosts, cancel)
            .await;
        if let Err(e) = started {
            if let Err(cleanup) = sidecar.destroy().await {
                warn!("Failed to clean up sidecar {}: {}", name, cleanup);
            }
            return Err(e);
        }

        Ok(sidecar)
    }

    /// Creates the checkout and socket directories, starts ssh-agent and
    /// loads the key
    async fn start_agent(
        &self,
        options: &ExecutionOptions,
        ssh_key: Option<&str>,
        known_hosts: &str,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let dirs = [self.git_dir(), self.ssh_dir()];
        let mkdir = ExecRequest::new(["mkdir", "-p", dirs[0].as_str(), dirs[1].as_str()]);
        self.backend
            .exec(&self.sandbox, mkdir, Box::new(|_: &str| {}), cancel.child_token())
            .await?;

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let mut ready_tx = Some(ready_tx);
        let watch_ready: OutputFn = Box::new(move |line| {
            if line.contains(AGENT_READY_MARKER)
                && let Some(tx) = ready_tx.take()
            {
                let _ = tx.send(());
            }
        });

        let socket = self.credential_socket_path();
        let agent = ExecRequest::new(["ssh-agent", "-D", "-a", socket.as_str()]);
        let backend = self.backend.clone();
        let sandbox = self.sandbox.clone();
        let agent_cancel = self.agent_cancel.clone();
        let task = tokio::spawn(async move {
            match backend.exec(&sandbox, agent, watch_ready, agent_cancel).await {
                Ok(()) => debug!("ssh-agent in {} exited", sandbox.name()),
                Err(e) => debug!("ssh-agent in {} stopped: {}", sandbox.name(), e),
            }
        });
        *self.agent_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        let ready = tokio::time::timeout(options.agent_ready_timeout, async {
            tokio::select! {
                _ = cancel.cancelled() => Err(JobError::Canceled),
                ready = ready_rx => ready.map_err(|_| {
                    JobError::Setup("ssh-agent exited before it was ready".to_string())
                }),
            }
        })
        .await;
        match ready {
            Ok(result) => result?,
            Err(_) => {
                return Err(JobError::Setup(format!(
                    "ssh-agent was not ready after {:?}",
                    options.agent_ready_timeout
                )));
            }
        }

        let mut env = BTreeMap::new();
        env.insert("SSH_AUTH_SOCK".to_string(), self.credential_socket_path());
        env.insert("SSH_DIR".to_string(), self.ssh_dir());
        env.insert("SSH_KNOWN_HOSTS".to_string(), known_hosts.to_string());
        if let Some(key) = ssh_key {
            env.insert("SSH_PRIVATE_KEY".to_string(), key.to_string());
        }

        let setup = ExecRequest::new(["sh", "-c", AGENT_SETUP_SCRIPT]).env(env);
        let (collect, lines) = collector();
        match self
            .backend
            .exec(&self.sandbox, setup, collect, cancel.child_token())
            .await
        {
            Ok(()) => {}
            Err(crate::sandbox::SandboxError::Canceled) => return Err(JobError::Canceled),
            Err(e) => {
                let output = lines.lock().unwrap_or_else(|e| e.into_inner()).join("; ");
                return Err(JobError::Setup(format!(
                    "loading ssh key failed: {} {}",
                    e, output
                )));
            }
        }

        Ok(())
    }

    /// Clones the repository recursively and checks out `commit`
    ///
    /// Each command line goes to `prompt` before it runs; command output
    /// goes to the consumers built by `output`.
    pub async fn clone_repository(
        &self,
        url: &str,
        commit: &str,
        prompt: LineSink<'_>,
        output: &(dyn Fn() -> OutputFn + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let git_dir = self.git_dir();
        let clone = vec!["git", "clone", "--recursive", url, git_dir.as_str()];
        let checkout = vec!["git", "-C", git_dir.as_str(), "checkout", "-q", commit];

        for cmd in [clone, checkout] {
            prompt(&format!("$ {}", cmd.join(" ")));
            let request = ExecRequest::new(cmd).env(self.git_env());
            self.backend
                .exec(&self.sandbox, request, output(), cancel.child_token())
                .await?;
        }

        Ok(())
    }

    /// Reads a file of the checkout through the sidecar
    pub async fn read_file(
        &self,
        workdir: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<String, JobError> {
        let (collect, lines) = collector();
        let mut request = ExecRequest::new(["cat", path]).workdir(workdir);
        request.attach_stderr = false;

        self.backend
            .exec(&self.sandbox, request, collect, cancel.child_token())
            .await
            .map_err(|e| match e {
                crate::sandbox::SandboxError::Canceled => JobError::Canceled,
                e if e.is_command_failure() => {
                    JobError::Config(format!("cannot read {}: {}", path, e))
                }
                e => JobError::Sandbox(e),
            })?;

        let lines = lines.lock().unwrap_or_else(|e| e.into_inner());
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        Ok(content)
    }

    /// Checkout directory as seen by job sandboxes
    pub fn git_dir(&self) -> String {
        format!("{}/src", self.root)
    }

    /// Credential agent socket as seen by job sandboxes
    pub fn credential_socket_path(&self) -> String {
        format!("{}/{}", self.ssh_dir(), AGENT_SOCKET)
    }

    /// Volumes a job sandbox mounts to share the checkout and the agent
    pub fn container_volumes(&self) -> Vec<Volume> {
        if !self.isolated {
            return Vec::new();
        }
        vec![
            Volume::new(self.host_dir.join("src"), self.git_dir()),
            Volume::new(self.host_dir.join("ssh"), self.ssh_dir()),
        ]
    }

    /// Removes the pipeline directory, destroys the sandbox and waits for the
    /// agent task to exit
    pub async fn destroy(&self) -> Result<(), JobError> {
        let dirs = [self.git_dir(), self.ssh_dir()];
        let remove = ExecRequest::new(["rm", "-rf", dirs[0].as_str(), dirs[1].as_str()]);
        if let Err(e) = self
            .backend
            .exec(&self.sandbox, remove, Box::new(|_: &str| {}), CancellationToken::new())
            .await
        {
            warn!("Failed to clear {} in {}: {}", self.root, self.sandbox.name(), e);
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.host_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove {}: {}", self.host_dir.display(), e);
        }

        let destroyed = self.backend.destroy(&self.sandbox).await;

        self.agent_cancel.cancel();
        let task = self
            .agent_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        destroyed.map_err(JobError::from)
    }

    fn ssh_dir(&self) -> String {
        format!("{}/ssh", self.root)
    }

    fn git_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("SSH_AUTH_SOCK".to_string(), self.credential_socket_path());
        env.insert(
            "GIT_SSH_COMMAND".to_string(),
            format!("ssh -F {}/config", self.ssh_dir()),
        );
        env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        env
    }
}

/// Output consumer collecting lines for later inspection
fn collector() -> (OutputFn, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let collect: OutputFn = Box::new(move |line| {
        sink.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.to_string());
    });
    (collect, lines)
}
