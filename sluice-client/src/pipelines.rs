//! Pipeline and job status / log endpoints

use crate::GateClient;
use crate::error::Result;
use sluice_core::dto::log::LogChunk;
use sluice_core::dto::status::StatusUpdate;
use uuid::Uuid;

impl GateClient {
    // =============================================================================
    // Status Transitions
    // =============================================================================

    /// Update the status of a pipeline
    pub async fn update_pipeline(&self, pipeline_id: Uuid, update: &StatusUpdate) -> Result<()> {
        let url = self.url(&format!("/pipelines/{}", pipeline_id));
        let response = self
            .authorized(self.client.put(&url))
            .json(update)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Update the status of one job of a pipeline
    pub async fn update_job(
        &self,
        pipeline_id: Uuid,
        job_id: Uuid,
        update: &StatusUpdate,
    ) -> Result<()> {
        let url = self.url(&format!("/pipelines/{}/jobs/{}", pipeline_id, job_id));
        let response = self
            .authorized(self.client.put(&url))
            .json(update)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Job Logs
    // =============================================================================

    /// Append a chunk of output to a job's log
    pub async fn push_logs(&self, pipeline_id: Uuid, job_id: Uuid, data: String) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let url = self.url(&format!("/pipelines/{}/jobs/{}/logs", pipeline_id, job_id));
        let response = self
            .authorized(self.client.post(&url))
            .json(&LogChunk { data })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}
