//! In-memory fakes for the gate and the sandbox backend

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use sluice_core::domain::auth::{self, AuthConfigs};
use sluice_core::domain::job::PipelineJob;
use sluice_core::domain::pipeline::{Pipeline, RefType, Variable};
use sluice_core::domain::status::Status;
use sluice_core::domain::task::{PipelineRun, Task};
use sluice_core::dto::status::StatusUpdate;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::execution::ExecutionOptions;
use crate::repository::GateRepository;
use crate::sandbox::{
    ExecRequest, LineSink, OutputFn, Sandbox, SandboxBackend, SandboxError, SandboxResult, Volume,
};

/// Gate recording every call and serving a scripted task queue
#[derive(Default)]
pub struct RecordingGate {
    pub tasks: Mutex<VecDeque<Task>>,
    pub polls: Mutex<Vec<(Vec<Uuid>, bool)>>,
    pub pipeline_updates: Mutex<Vec<(Uuid, Status)>>,
    pub job_updates: Mutex<Vec<(Uuid, Status)>>,
    pub logs: Mutex<HashMap<Uuid, String>>,
    pub heartbeats: AtomicUsize,
    /// Makes every pipeline status update fail
    pub reject_pipeline_updates: AtomicBool,
}

impl RecordingGate {
    pub fn push_task(&self, task: Task) {
        self.tasks.lock().unwrap().push_back(task);
    }

    pub fn pipeline_statuses(&self, pipeline_id: Uuid) -> Vec<Status> {
        self.pipeline_updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == pipeline_id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn job_statuses(&self, job_id: Uuid) -> Vec<Status> {
        self.job_updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn log_of(&self, job_id: Uuid) -> String {
        self.logs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl GateRepository for RecordingGate {
    async fn next_task(&self, running: &[Uuid], query_pipeline: bool) -> Result<Task> {
        self.polls
            .lock()
            .unwrap()
            .push((running.to_vec(), query_pipeline));
        Ok(self.tasks.lock().unwrap().pop_front().unwrap_or(Task::None))
    }

    async fn heartbeat(&self) -> Result<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_pipeline(&self, pipeline_id: Uuid, update: StatusUpdate) -> Result<()> {
        if self.reject_pipeline_updates.load(Ordering::SeqCst) {
            bail!("gate unavailable");
        }
        self.pipeline_updates
            .lock()
            .unwrap()
            .push((pipeline_id, update.status));
        Ok(())
    }

    async fn update_job(
        &self,
        _pipeline_id: Uuid,
        job_id: Uuid,
        update: StatusUpdate,
    ) -> Result<()> {
        self.job_updates.lock().unwrap().push((job_id, update.status));
        Ok(())
    }

    async fn push_logs(&self, _pipeline_id: Uuid, job_id: Uuid, data: String) -> Result<()> {
        self.logs
            .lock()
            .unwrap()
            .entry(job_id)
            .or_default()
            .push_str(&data);
        Ok(())
    }
}

/// Scripted answer to an exec request
#[derive(Debug, Clone)]
pub enum Reply {
    /// Prints the lines and succeeds
    Lines(Vec<String>),
    /// Prints the lines and exits with `code`
    Fail(Vec<String>, i32),
    /// Prints the lines and runs until canceled or destroyed
    Block(Vec<String>),
    Panic(String),
}

impl Reply {
    pub fn lines(lines: &[&str]) -> Self {
        Reply::Lines(lines.iter().map(|l| l.to_string()).collect())
    }
}

/// Backend answering exec requests from a list of rules
///
/// A rule matches when its pattern is a substring of the space-joined
/// command; the most recently added matching rule wins. Unmatched commands
/// succeed silently.
pub struct ScriptedBackend {
    rules: Mutex<Vec<(String, Reply)>>,
    pub execs: Mutex<Vec<(String, String)>>,
    pub prepared: Mutex<Vec<String>>,
    /// User each prepared image would be pulled as
    pub pulled_as: Mutex<Vec<Option<String>>>,
    pub created: Mutex<Vec<String>>,
    pub destroyed: Mutex<Vec<String>>,
    pub cleanups: AtomicUsize,
    /// Execs, blocking exec endings and destroys in the order they happened
    pub events: Mutex<Vec<String>>,
    live: Mutex<HashMap<String, CancellationToken>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        let backend = Self {
            rules: Mutex::new(Vec::new()),
            execs: Mutex::new(Vec::new()),
            prepared: Mutex::new(Vec::new()),
            pulled_as: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            cleanups: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            live: Mutex::new(HashMap::new()),
        };
        backend.on(
            "ssh-agent -D",
            Reply::Block(vec![
                "SSH_AUTH_SOCK=/ci/ssh/agent.sock; export SSH_AUTH_SOCK;".to_string(),
            ]),
        );
        backend
    }

    /// Serves `config` as the content of every `cat`
    pub fn with_config(config: &str) -> Self {
        let backend = Self::new();
        backend.on("cat ", Reply::Lines(config.lines().map(String::from).collect()));
        backend
    }

    pub fn on(&self, pattern: &str, reply: Reply) -> &Self {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), reply));
        self
    }

    /// Position of the first event containing `pattern`
    pub fn event_index(&self, pattern: &str) -> Option<usize> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .position(|event| event.contains(pattern))
    }

    /// Commands executed so far containing `pattern`
    pub fn execs_matching(&self, pattern: &str) -> usize {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, cmd)| cmd.contains(pattern))
            .count()
    }

    fn reply_for(&self, cmd: &str) -> Reply {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(pattern, _)| cmd.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or(Reply::Lines(Vec::new()))
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn isolates_filesystem(&self) -> bool {
        true
    }

    async fn create(&self, name: &str, _image: &str, _volumes: &[Volume]) -> SandboxResult<Sandbox> {
        self.created.lock().unwrap().push(name.to_string());
        self.live
            .lock()
            .unwrap()
            .insert(name.to_string(), CancellationToken::new());
        Ok(Sandbox::new(format!("id-{}", name), name))
    }

    async fn destroy(&self, sandbox: &Sandbox) -> SandboxResult<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("destroy {}", sandbox.name()));
        if let Some(token) = self.live.lock().unwrap().remove(sandbox.name()) {
            token.cancel();
        }
        self.destroyed
            .lock()
            .unwrap()
            .push(sandbox.name().to_string());
        Ok(())
    }

    async fn prepare(
        &self,
        image: &str,
        _output: LineSink<'_>,
        info: LineSink<'_>,
        pull_configs: &[AuthConfigs],
    ) -> SandboxResult<()> {
        self.prepared.lock().unwrap().push(image.to_string());
        let credential = auth::resolve(&auth::registry_of(image), pull_configs);
        self.pulled_as
            .lock()
            .unwrap()
            .push(credential.map(|c| c.username.clone()));
        info(&format!("Using image {}", image));
        Ok(())
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        request: ExecRequest,
        mut output: OutputFn,
        cancel: CancellationToken,
    ) -> SandboxResult<()> {
        let cmd = request.cmd.join(" ");
        self.execs
            .lock()
            .unwrap()
            .push((sandbox.name().to_string(), cmd.clone()));
        self.events.lock().unwrap().push(format!("exec {}", cmd));

        if cancel.is_cancelled() {
            return Err(SandboxError::Canceled);
        }
        let destroyed = self
            .live
            .lock()
            .unwrap()
            .get(sandbox.name())
            .cloned()
            .ok_or_else(|| SandboxError::Engine(format!("no sandbox {}", sandbox.name())))?;

        match self.reply_for(&cmd) {
            Reply::Lines(lines) => {
                lines.iter().for_each(|line| output(line));
                Ok(())
            }
            Reply::Fail(lines, code) => {
                lines.iter().for_each(|line| output(line));
                Err(SandboxError::NonZeroExit { code })
            }
            Reply::Block(lines) => {
                lines.iter().for_each(|line| output(line));
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(SandboxError::Canceled),
                    _ = destroyed.cancelled() => Err(SandboxError::Engine("sandbox destroyed".to_string())),
                };
                self.events.lock().unwrap().push(format!("ended {}", cmd));
                result
            }
            Reply::Panic(message) => panic!("{}", message),
        }
    }

    async fn cleanup(&self) -> SandboxResult<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn job(stage: &str, name: &str) -> PipelineJob {
    PipelineJob {
        id: Uuid::new_v4(),
        stage: stage.to_string(),
        name: name.to_string(),
        status: Status::Pending,
    }
}

/// A pipeline run over `jobs`, reading its configuration from `.sluice.yml`
pub fn pipeline_run(jobs: Vec<PipelineJob>) -> PipelineRun {
    PipelineRun {
        pipeline: Pipeline {
            id: Uuid::new_v4(),
            commit: "0123456789abcdef".to_string(),
            from_commit: String::new(),
            ref_type: RefType::Branch,
            ref_display_id: "main".to_string(),
            pull_request: None,
            runner_id: Uuid::new_v4(),
            repository_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            project_name: "demo".to_string(),
            clone_url: "https://git.example.com/demo.git".to_string(),
            ssh_clone_url: "git@git.example.com:demo.git".to_string(),
            config_file: ".sluice.yml".to_string(),
        },
        jobs,
        env: Vec::new(),
        clone_url: "git@git.example.com:demo.git".to_string(),
        known_hosts: String::new(),
        ssh_private_key: Some("-----BEGIN KEY-----\nc2VjcmV0\n-----END KEY-----".to_string()),
    }
}

pub fn variable(key: &str, value: &str, masked: bool) -> Variable {
    Variable {
        key: key.to_string(),
        value: value.to_string(),
        masked,
    }
}

pub fn execution_options(work_dir: &std::path::Path) -> ExecutionOptions {
    ExecutionOptions {
        work_dir: work_dir.to_path_buf(),
        default_image: "docker.io/library/alpine:latest".to_string(),
        sidecar_image: "docker.io/alpine/git:latest".to_string(),
        log_buffer_size: 1024,
        log_flush_timeout: Duration::from_millis(50),
        agent_ready_timeout: Duration::from_secs(5),
        runner_version: "test".to_string(),
    }
}

/// Polls `check` until it holds, failing the test after a few seconds
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
