//! HTTP gate repository
//!
//! Thin adapter from [`GateClient`] to [`GateRepository`]: decodes task
//! envelopes and attaches context to transport errors.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sluice_client::GateClient;
use sluice_core::domain::task::Task;
use sluice_core::dto::status::StatusUpdate;
use uuid::Uuid;

use super::GateRepository;

/// HTTP implementation of GateRepository
pub struct HttpGateRepository {
    client: GateClient,
}

impl HttpGateRepository {
    /// Wraps an already registered client
    pub fn new(client: GateClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GateRepository for HttpGateRepository {
    async fn next_task(&self, running: &[Uuid], query_pipeline: bool) -> Result<Task> {
        let envelope = self
            .client
            .next_task(running, query_pipeline)
            .await
            .context("Failed to poll for tasks")?;

        Task::decode(&envelope.kind, envelope.data)
            .with_context(|| format!("Failed to decode task of kind '{}'", envelope.kind))
    }

    async fn heartbeat(&self) -> Result<()> {
        self.client
            .heartbeat()
            .await
            .context("Failed to send heartbeat")
    }

    async fn update_pipeline(&self, pipeline_id: Uuid, update: StatusUpdate) -> Result<()> {
        self.client
            .update_pipeline(pipeline_id, &update)
            .await
            .with_context(|| format!("Failed to set pipeline {} to {}", pipeline_id, update.status))
    }

    async fn update_job(
        &self,
        pipeline_id: Uuid,
        job_id: Uuid,
        update: StatusUpdate,
    ) -> Result<()> {
        self.client
            .update_job(pipeline_id, job_id, &update)
            .await
            .with_context(|| format!("Failed to set job {} to {}", job_id, update.status))
    }

    async fn push_logs(&self, pipeline_id: Uuid, job_id: Uuid, data: String) -> Result<()> {
        self.client
            .push_logs(pipeline_id, job_id, data)
            .await
            .with_context(|| format!("Failed to push logs for job {}", job_id))
    }
}
