//! Pipeline executor
//!
//! Runs the jobs of one pipeline stage by stage. Jobs of a stage run
//! concurrently; a stage starts only once every job of the previous stage
//! has finished. The first job of the first stage bootstraps the pipeline
//! (sidecar, checkout, configuration) and every other job waits for it.
//!
//! The first job that does not succeed aborts the pipeline: the pipeline
//! status is reported once and every job of a later stage is marked
//! SKIPPED. Jobs of the failing stage that are still running finish on
//! their own and report their own status.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use sluice_core::domain::auth::AuthConfigs;
use sluice_core::domain::config::PipelineConfig;
use sluice_core::domain::job::{PipelineJob, group_stages};
use sluice_core::domain::status::Status;
use sluice_core::domain::task::PipelineRun;
use sluice_core::dto::status::StatusUpdate;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::condition::{Condition, ConditionGuard};
use super::job::{InheritedAuths, JobExecutor};
use super::{Bootstrap, ExecutionOptions, JobError, Sidecar};
use crate::repository::GateRepository;
use crate::sandbox::{Sandbox, SandboxBackend};
use crate::service::{JobLog, RemoteLogSink};

/// Line written to interrupted jobs when the runner stops
pub const SHUTDOWN_MESSAGE: &str = "runner is shutting down";

/// Task variable carrying environment-level registry credentials
pub const ENV_AUTH_VARIABLE: &str = "DOCKER_AUTH_CONFIG";

/// Executor shared by every pipeline of the runner
#[derive(Clone)]
pub struct PipelineExecutor {
    gate: Arc<dyn GateRepository>,
    backend: Arc<dyn SandboxBackend>,
    options: Arc<ExecutionOptions>,
    runner_auths: Arc<AuthConfigs>,
    reclaim: mpsc::UnboundedSender<Sandbox>,
}

/// State of one pipeline run
struct RunState {
    run: Arc<PipelineRun>,
    stages: Vec<Vec<PipelineJob>>,
    auths: InheritedAuths,
    bootstrap: Arc<Condition<Bootstrap>>,
    sidecar: OnceLock<Arc<Sidecar>>,
    /// Pipeline outcome, set by the first job that did not succeed
    aborted: OnceLock<Status>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl RunState {
    fn pipeline_id(&self) -> Uuid {
        self.run.pipeline.id
    }

    /// Status of a pipeline interrupted by its token
    fn interrupted_status(&self) -> Status {
        if self.shutdown.is_cancelled() {
            Status::Failed
        } else {
            Status::Canceled
        }
    }
}

impl PipelineExecutor {
    pub fn new(
        gate: Arc<dyn GateRepository>,
        backend: Arc<dyn SandboxBackend>,
        options: ExecutionOptions,
        runner_auths: AuthConfigs,
        reclaim: mpsc::UnboundedSender<Sandbox>,
    ) -> Self {
        Self {
            gate,
            backend,
            options: Arc::new(options),
            runner_auths: Arc::new(runner_auths),
            reclaim,
        }
    }

    /// Runs a pipeline to completion and returns its final status
    ///
    /// `cancel` stops this pipeline only; `shutdown` is the runner-wide token
    /// `cancel` was derived from, used to tell a server cancel from a
    /// runner shutdown.
    pub async fn run(
        &self,
        run: PipelineRun,
        cancel: CancellationToken,
        shutdown: CancellationToken,
    ) -> Status {
        let pipeline_id = run.pipeline.id;

        if let Err(e) = self
            .gate
            .update_pipeline(pipeline_id, StatusUpdate::started())
            .await
        {
            error!(pipeline_id = %pipeline_id, "Cannot start pipeline: {:#}", e);
            return Status::Failed;
        }

        let env_auths = AuthConfigs::parse_optional(run.variable(ENV_AUTH_VARIABLE));
        let (env_auths, auth_error) = match env_auths {
            Ok(auths) => (auths, None),
            Err(e) => (AuthConfigs::default(), Some(e)),
        };

        let state = Arc::new(RunState {
            stages: group_stages(&run.jobs),
            run: Arc::new(run),
            auths: InheritedAuths {
                runner: self.runner_auths.clone(),
                environment: Arc::new(env_auths),
            },
            bootstrap: Arc::new(Condition::new()),
            sidecar: OnceLock::new(),
            aborted: OnceLock::new(),
            cancel,
            shutdown,
        });

        if let Some(e) = auth_error {
            self.reject(&state, format!("{} is invalid: {}", ENV_AUTH_VARIABLE, e))
                .await;
        } else {
            self.run_stages(&state).await;
        }

        if let Some(sidecar) = state.sidecar.get()
            && let Err(e) = sidecar.destroy().await
        {
            warn!(pipeline_id = %pipeline_id, "Failed to destroy sidecar: {}", e);
        }

        match state.aborted.get() {
            Some(status) => *status,
            None => {
                if let Err(e) = self
                    .gate
                    .update_pipeline(pipeline_id, StatusUpdate::finished(Status::Success))
                    .await
                {
                    warn!(pipeline_id = %pipeline_id, "{:#}", e);
                }
                Status::Success
            }
        }
    }

    async fn run_stages(&self, state: &Arc<RunState>) {
        for (index, stage) in state.stages.iter().enumerate() {
            if state.aborted.get().is_some() {
                break;
            }
            if state.cancel.is_cancelled() {
                self.abort(state, index, None, state.interrupted_status())
                    .await;
                break;
            }

            debug!(
                pipeline_id = %state.pipeline_id(),
                "Starting stage '{}' with {} job(s)",
                stage[0].stage,
                stage.len()
            );

            let handles: Vec<_> = stage
                .iter()
                .enumerate()
                .map(|(position, job)| {
                    let bootstraps = index == 0 && position == 0;
                    tokio::spawn(self.clone().run_job(
                        state.clone(),
                        index,
                        job.clone(),
                        bootstraps,
                    ))
                })
                .collect();

            for handle in handles {
                if let Err(e) = handle.await {
                    error!(pipeline_id = %state.pipeline_id(), "Job task failed: {}", e);
                }
            }
        }
    }

    /// Runs one job and reports its final status
    async fn run_job(
        self,
        state: Arc<RunState>,
        stage_index: usize,
        job: PipelineJob,
        bootstraps: bool,
    ) {
        let pipeline_id = state.pipeline_id();
        let log = Arc::new(self.job_log(pipeline_id, job.id));

        if let Err(e) = self
            .gate
            .update_job(pipeline_id, job.id, StatusUpdate::started())
            .await
        {
            warn!(job_id = %job.id, "{:#}", e);
        }

        let guard = bootstraps
            .then(|| state.bootstrap.guard("pipeline bootstrap did not complete"));
        let executor = Arc::new(JobExecutor::new(
            self.backend.clone(),
            self.options.clone(),
            state.run.clone(),
            job.clone(),
            state.auths.clone(),
            log.clone(),
            self.reclaim.clone(),
        ));

        let task = {
            let this = self.clone();
            let state = state.clone();
            let executor = executor.clone();
            tokio::spawn(async move { this.drive_job(&state, &executor, guard).await })
        };

        let result = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(
                    pipeline_id = %pipeline_id,
                    job_id = %job.id,
                    "Job '{}' panicked: {}",
                    job.name,
                    message
                );
                Err(JobError::Panicked(message))
            }
            Err(e) => Err(JobError::Setup(e.to_string())),
        };

        let status = match &result {
            Ok(()) => Status::Success,
            Err(JobError::Canceled) if state.shutdown.is_cancelled() => {
                log.direct_line(SHUTDOWN_MESSAGE);
                Status::Failed
            }
            Err(JobError::Canceled) => {
                log.direct_line("Job canceled");
                Status::Canceled
            }
            Err(e @ JobError::Panicked(_)) => {
                log.direct_line(&format!("ERROR: internal error: {}", e));
                Status::Failed
            }
            Err(_) => Status::Failed,
        };

        executor.destroy().await;

        info!(
            pipeline_id = %pipeline_id,
            job_id = %job.id,
            "Job '{}' finished: {}",
            job.name,
            status
        );
        if let Err(e) = self
            .gate
            .update_job(pipeline_id, job.id, StatusUpdate::finished(status))
            .await
        {
            warn!(job_id = %job.id, "{:#}", e);
        }

        if status != Status::Success {
            let pipeline_status = match status {
                Status::Canceled => Status::Canceled,
                _ => Status::Failed,
            };
            self.abort(&state, stage_index + 1, None, pipeline_status)
                .await;
        }
    }

    /// Obtains the pipeline bootstrap (building it when `guard` is held) and
    /// runs the job
    async fn drive_job(
        &self,
        state: &RunState,
        executor: &JobExecutor,
        guard: Option<ConditionGuard<Bootstrap>>,
    ) -> Result<(), JobError> {
        let log = executor.log();

        let bootstrap = match guard {
            Some(guard) => match self.bootstrap(state, log).await {
                Ok(bootstrap) => {
                    let bootstrap = Arc::new(bootstrap);
                    guard.satisfy(Ok(bootstrap.clone()));
                    bootstrap
                }
                Err(e) => {
                    if !matches!(e, JobError::Canceled) {
                        log.direct_line(&format!("ERROR: {}", e));
                    }
                    guard.satisfy(Err(e.to_string()));
                    return Err(e);
                }
            },
            None => {
                let outcome = tokio::select! {
                    _ = state.cancel.cancelled() => return Err(JobError::Canceled),
                    outcome = state.bootstrap.wait() => outcome,
                };
                match outcome {
                    Ok(bootstrap) => bootstrap,
                    Err(message) => {
                        let err =
                            JobError::Setup(format!("pipeline bootstrap failed: {}", message));
                        log.direct_line(&format!("ERROR: {}", err));
                        return Err(err);
                    }
                }
            }
        };

        executor.run(&bootstrap, &state.cancel).await
    }

    /// Starts the sidecar, checks the repository out and decodes the
    /// pipeline configuration; all output goes to the direct channel
    async fn bootstrap(
        &self,
        state: &RunState,
        log: &Arc<JobLog>,
    ) -> Result<Bootstrap, JobError> {
        let run = &state.run;
        let mut direct = |line: &str| log.direct_line(line);
        let pull_configs = [
            (*state.auths.runner).clone(),
            (*state.auths.environment).clone(),
        ];

        let sidecar = Sidecar::start(
            self.backend.clone(),
            &self.options,
            run.pipeline.id,
            &pull_configs,
            run.ssh_private_key.as_deref(),
            &run.known_hosts,
            &mut direct,
            &state.cancel,
        )
        .await?;
        let sidecar = Arc::new(sidecar);
        let _ = state.sidecar.set(sidecar.clone());

        let output = {
            let log = log.clone();
            move || log.direct_output()
        };
        sidecar
            .clone_repository(
                &run.clone_url,
                &run.pipeline.commit,
                &mut direct,
                &output,
                &state.cancel,
            )
            .await?;

        let source = sidecar
            .read_file(&sidecar.git_dir(), &run.pipeline.config_file, &state.cancel)
            .await?;
        let config = PipelineConfig::parse(&source)?;
        let pipeline_auths = AuthConfigs::parse_optional(config.docker_auth_config.as_deref())?;

        Ok(Bootstrap {
            sidecar,
            config,
            pipeline_auths,
        })
    }

    /// Fails a pipeline before any job started
    ///
    /// The error is written to the first job's log and that job is marked
    /// FAILED; every other job is skipped.
    async fn reject(&self, state: &RunState, message: String) {
        let pipeline_id = state.pipeline_id();
        error!(pipeline_id = %pipeline_id, "{}", message);

        let first = state.stages.first().and_then(|stage| stage.first());
        if let Some(job) = first {
            let log = self.job_log(pipeline_id, job.id);
            log.direct_line(&format!("ERROR: {}", message));
            log.close().await;
            if let Err(e) = self
                .gate
                .update_job(pipeline_id, job.id, StatusUpdate::finished(Status::Failed))
                .await
            {
                warn!(job_id = %job.id, "{:#}", e);
            }
        }

        self.abort(state, 0, first.map(|job| job.id), Status::Failed)
            .await;
    }

    /// Records the pipeline outcome and skips every job from stage
    /// `skip_from` on, except `keep`
    ///
    /// Only the first call has any effect.
    async fn abort(
        &self,
        state: &RunState,
        skip_from: usize,
        keep: Option<Uuid>,
        status: Status,
    ) {
        if state.aborted.set(status).is_err() {
            return;
        }
        let pipeline_id = state.pipeline_id();
        info!(pipeline_id = %pipeline_id, "Pipeline aborted: {}", status);

        if let Err(e) = self
            .gate
            .update_pipeline(pipeline_id, StatusUpdate::finished(status))
            .await
        {
            warn!(pipeline_id = %pipeline_id, "{:#}", e);
        }

        let skipped = state
            .stages
            .iter()
            .skip(skip_from)
            .flatten()
            .filter(|job| Some(job.id) != keep);
        for job in skipped {
            if let Err(e) = self
                .gate
                .update_job(pipeline_id, job.id, StatusUpdate::finished(Status::Skipped))
                .await
            {
                warn!(job_id = %job.id, "{:#}", e);
            }
        }
    }

    fn job_log(&self, pipeline_id: Uuid, job_id: Uuid) -> JobLog {
        let sink = Arc::new(RemoteLogSink::new(self.gate.clone(), pipeline_id, job_id));
        JobLog::new(
            sink,
            self.options.log_buffer_size,
            self.options.log_flush_timeout,
        )
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
