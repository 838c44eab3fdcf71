//! Execution layer
//!
//! Drives pipelines once the scheduler has accepted them:
//! - `pipeline`: stage ordering, fail-fast/skip bookkeeping, status reporting
//! - `job`: one job from image preparation to its last command
//! - `sidecar`: per-pipeline checkout and credential agent
//! - `condition`: the one-shot latch gating jobs on the pipeline bootstrap

pub mod condition;
pub mod job;
pub mod pipeline;
pub mod sidecar;

pub use condition::Condition;
pub use job::JobExecutor;
pub use pipeline::PipelineExecutor;
pub use sidecar::Sidecar;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sluice_core::domain::auth::AuthConfigs;
use sluice_core::domain::config::PipelineConfig;
use thiserror::Error;

use crate::config::Config;
use crate::sandbox::SandboxError;

/// Errors ending a job
#[derive(Debug, Error)]
pub enum JobError {
    /// The pipeline configuration has no entry for the job
    #[error("job '{0}' is not defined in the pipeline configuration")]
    MissingJob(String),

    /// Sidecar or checkout setup failed
    #[error("setup failed: {0}")]
    Setup(String),

    /// Pipeline configuration or credentials could not be decoded
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Sandbox(SandboxError),

    /// The job's pipeline was canceled
    #[error("job canceled")]
    Canceled,

    /// The job panicked; the payload message is kept for diagnostics
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl From<SandboxError> for JobError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Canceled => JobError::Canceled,
            other => JobError::Sandbox(other),
        }
    }
}

impl From<sluice_core::Error> for JobError {
    fn from(err: sluice_core::Error) -> Self {
        JobError::Config(err.to_string())
    }
}

/// Runner settings the execution layer needs
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub work_dir: PathBuf,
    pub default_image: String,
    pub sidecar_image: String,
    pub log_buffer_size: usize,
    pub log_flush_timeout: Duration,
    pub agent_ready_timeout: Duration,
    pub runner_version: String,
}

impl ExecutionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            default_image: config.default_image.clone(),
            sidecar_image: config.sidecar_image.clone(),
            log_buffer_size: config.log_buffer_size,
            log_flush_timeout: config.log_flush_timeout,
            agent_ready_timeout: config.agent_ready_timeout,
            runner_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Everything the first job of a pipeline produces for the others
pub struct Bootstrap {
    pub sidecar: Arc<Sidecar>,
    pub config: PipelineConfig,
    /// Credentials from the pipeline configuration document
    pub pipeline_auths: AuthConfigs,
}
