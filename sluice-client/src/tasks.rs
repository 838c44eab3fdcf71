//! Task polling endpoint

use crate::GateClient;
use crate::error::Result;
use sluice_core::dto::task::{TaskEnvelope, TaskRequest};
use uuid::Uuid;

impl GateClient {
    /// Poll for the next task
    ///
    /// # Arguments
    /// * `running_pipelines` - Pipelines currently executing on this runner
    /// * `query_pipeline` - Whether this runner can accept another pipeline
    ///
    /// # Returns
    /// The raw task envelope; an empty `kind` means no work is available
    pub async fn next_task(
        &self,
        running_pipelines: &[Uuid],
        query_pipeline: bool,
    ) -> Result<TaskEnvelope> {
        let url = self.url("/task");
        let response = self
            .authorized(self.client.post(&url))
            .json(&TaskRequest {
                running_pipelines: running_pipelines.to_vec(),
                query_pipeline,
            })
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(TaskEnvelope::default());
        }

        self.handle_response(response).await
    }
}
