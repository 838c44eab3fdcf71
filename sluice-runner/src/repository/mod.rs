//! Repository layer
//!
//! The gate is the only remote the runner talks to. Everything the execution
//! layer needs from it goes through [`GateRepository`], so pipelines can be
//! driven against an in-memory gate in tests.

mod gate;

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::domain::task::Task;
use sluice_core::dto::status::StatusUpdate;
use uuid::Uuid;

pub use gate::HttpGateRepository;

/// Operations the runner performs against the gate
#[async_trait]
pub trait GateRepository: Send + Sync {
    /// Polls for the next task
    ///
    /// `running` lists the pipelines currently executing on this runner;
    /// `query_pipeline` tells the gate whether a new pipeline may be handed out.
    async fn next_task(&self, running: &[Uuid], query_pipeline: bool) -> Result<Task>;

    async fn heartbeat(&self) -> Result<()>;

    async fn update_pipeline(&self, pipeline_id: Uuid, update: StatusUpdate) -> Result<()>;

    async fn update_job(&self, pipeline_id: Uuid, job_id: Uuid, update: StatusUpdate)
    -> Result<()>;

    /// Appends a chunk of (already masked) output to a job log
    async fn push_logs(&self, pipeline_id: Uuid, job_id: Uuid, data: String) -> Result<()>;
}
