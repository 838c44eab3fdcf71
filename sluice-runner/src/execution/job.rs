//! Job executor
//!
//! Runs one job: resolve its configuration and environment, prepare the
//! image, create the sandbox, detect the shell, then run every command in
//! order. The first failing command ends the job.

use std::sync::{Arc, Mutex};

use sluice_core::domain::auth::AuthConfigs;
use sluice_core::domain::job::PipelineJob;
use sluice_core::domain::task::PipelineRun;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Bootstrap, ExecutionOptions, JobError};
use crate::sandbox::{ExecRequest, OutputFn, Sandbox, SandboxBackend, SandboxError};
use crate::service::JobLog;
use crate::service::env::{self, EnvContext};

/// Prints the first `bash` found on `$PATH`
const DETECT_SHELL_SCRIPT: &str = r#"IFS=:
for dir in $PATH; do
  if [ -x "$dir/bash" ]; then
    echo "$dir/bash"
    exit 0
  fi
done
"#;

const FALLBACK_SHELL: &str = "sh";

/// Credentials of the sources above the job, by increasing precedence
#[derive(Debug, Clone, Default)]
pub struct InheritedAuths {
    pub runner: Arc<AuthConfigs>,
    pub environment: Arc<AuthConfigs>,
}

/// Executor of one job
pub struct JobExecutor {
    backend: Arc<dyn SandboxBackend>,
    options: Arc<ExecutionOptions>,
    run: Arc<PipelineRun>,
    job: PipelineJob,
    auths: InheritedAuths,
    log: Arc<JobLog>,
    sandbox: Mutex<Option<Sandbox>>,
    reclaim: mpsc::UnboundedSender<Sandbox>,
}

impl JobExecutor {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        options: Arc<ExecutionOptions>,
        run: Arc<PipelineRun>,
        job: PipelineJob,
        auths: InheritedAuths,
        log: Arc<JobLog>,
        reclaim: mpsc::UnboundedSender<Sandbox>,
    ) -> Self {
        Self {
            backend,
            options,
            run,
            job,
            auths,
            log,
            sandbox: Mutex::new(None),
            reclaim,
        }
    }

    pub fn log(&self) -> &Arc<JobLog> {
        &self.log
    }

    /// Runs the job to completion
    ///
    /// Failures other than cancellation are also written to the job log.
    pub async fn run(
        &self,
        bootstrap: &Bootstrap,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let result = self.execute(bootstrap, cancel).await;
        match &result {
            Err(JobError::Canceled) | Err(JobError::MissingJob(_)) | Ok(()) => {}
            Err(e) => self.log.masked_line(&format!("ERROR: {}", e)),
        }
        result
    }

    async fn execute(
        &self,
        bootstrap: &Bootstrap,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let Some(job_config) = bootstrap.config.job(&self.job.name) else {
            let err = JobError::MissingJob(self.job.name.clone());
            self.log.direct_line(&format!("ERROR: {}", err));
            return Err(err);
        };
        let job_auths = AuthConfigs::parse_optional(job_config.docker_auth_config.as_deref())?;

        let sidecar = &bootstrap.sidecar;
        let ctx = EnvContext {
            project_dir: sidecar.git_dir(),
            ssh_auth_sock: sidecar.credential_socket_path(),
            runner_version: self.options.runner_version.clone(),
        };
        let job_env = env::job_env(&self.run, &self.job, &bootstrap.config, job_config, &ctx);
        let secrets = env::secret_names(&self.run);
        self.log.enable_masking(&secrets, |name| {
            env::secret_value(&self.run, &job_env, name)
        });

        let image = job_config
            .image
            .as_deref()
            .filter(|i| !i.is_empty())
            .or(Some(bootstrap.config.image.as_str()).filter(|i| !i.is_empty()))
            .unwrap_or(&self.options.default_image);
        let image = env::expand(image, &job_env);

        let pull_configs = [
            (*self.auths.runner).clone(),
            (*self.auths.environment).clone(),
            bootstrap.pipeline_auths.clone(),
            job_auths,
        ];
        let log = &self.log;
        let mut progress = |line: &str| log.masked_line(line);
        let mut info = |line: &str| log.masked_line(line);
        tokio::select! {
            _ = cancel.cancelled() => return Err(JobError::Canceled),
            result = self.backend.prepare(&image, &mut progress, &mut info, &pull_configs) => result?,
        }

        let name = format!("sluice-job-{}", self.job.id);
        let volumes = sidecar.container_volumes();
        let sandbox = tokio::select! {
            _ = cancel.cancelled() => return Err(JobError::Canceled),
            result = self.backend.create(&name, &image, &volumes) => result?,
        };
        *self.sandbox.lock().unwrap_or_else(|e| e.into_inner()) = Some(sandbox.clone());

        let shell = match bootstrap
            .config
            .shell
            .clone()
            .or_else(|| job_config.shell.clone())
        {
            Some(shell) => shell,
            None => self.detect_shell(&sandbox, cancel).await?,
        };
        debug!(job_id = %self.job.id, "Using shell {}", shell);

        let workdir = sidecar.git_dir();
        for command in &job_config.commands {
            self.log.masked_line(&format!("$ {}", command));
            let request = ExecRequest::new([shell.as_str(), "-c", command.as_str()])
                .env(job_env.clone())
                .workdir(workdir.clone());
            self.run_command(&sandbox, request, self.log.masked_output(), cancel)
                .await?;
        }

        Ok(())
    }

    /// Runs one command on a separate task and returns as soon as either the
    /// command finishes or `cancel` fires
    async fn run_command(
        &self,
        sandbox: &Sandbox,
        request: ExecRequest,
        output: OutputFn,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let backend = self.backend.clone();
        let sandbox = sandbox.clone();
        let token = cancel.child_token();
        let mut task =
            tokio::spawn(async move { backend.exec(&sandbox, request, output, token).await });

        tokio::select! {
            _ = cancel.cancelled() => Err(JobError::Canceled),
            joined = &mut task => match joined {
                Ok(result) => result.map_err(JobError::from),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => Err(JobError::Sandbox(SandboxError::Engine(e.to_string()))),
            },
        }
    }

    /// Looks for bash on the sandbox `$PATH`, falling back to `sh`
    async fn detect_shell(
        &self,
        sandbox: &Sandbox,
        cancel: &CancellationToken,
    ) -> Result<String, JobError> {
        let found: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let sink = found.clone();
        let output: OutputFn = Box::new(move |line| {
            let line = line.trim();
            if !line.is_empty() {
                *sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(line.to_string());
            }
        });

        let mut request = ExecRequest::new(["sh", "-c", DETECT_SHELL_SCRIPT]);
        request.attach_stderr = false;

        match self.run_command(sandbox, request, output, cancel).await {
            Ok(()) => {}
            Err(JobError::Canceled) => return Err(JobError::Canceled),
            Err(e) => {
                warn!(job_id = %self.job.id, "Shell detection failed: {}", e);
            }
        }

        let shell = found.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(shell.unwrap_or_else(|| FALLBACK_SHELL.to_string()))
    }

    /// Hands the sandbox over for reclamation and completes the log stream
    ///
    /// The sandbox must not be used after this call.
    pub async fn destroy(&self) {
        let sandbox = self
            .sandbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sandbox) = sandbox
            && self.reclaim.send(sandbox).is_err()
        {
            warn!(job_id = %self.job.id, "Reclamation channel closed; sandbox leaked");
        }

        self.log.close().await;
    }
}
