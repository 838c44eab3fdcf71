//! Runner registration & liveness endpoints

use crate::GateClient;
use crate::error::Result;
use sluice_core::dto::runner::{RegisterRunner, Registration};
use tracing::debug;

impl GateClient {
    // =============================================================================
    // Runner Registration & Lifecycle
    // =============================================================================

    /// Register this runner with the gate
    ///
    /// On success the returned access token is stored in the client and used
    /// for every later call.
    ///
    /// # Arguments
    /// * `name` - Human-readable runner name
    /// * `token` - Registration secret issued by the server
    /// * `version` - Runner version string
    pub async fn register(&self, name: &str, token: &str, version: &str) -> Result<Registration> {
        let url = self.url("/register");
        let response = self
            .client
            .post(&url)
            .json(&RegisterRunner {
                name: name.to_string(),
                token: token.to_string(),
                version: version.to_string(),
            })
            .send()
            .await?;

        let registration: Registration = self.handle_response(response).await?;
        self.set_access_token(registration.access_token.clone());
        debug!("Registered as runner {}", registration.runner_id);

        Ok(registration)
    }

    /// Send a heartbeat to the gate
    ///
    /// Keeps the runner marked as alive. Should be called periodically.
    pub async fn heartbeat(&self) -> Result<()> {
        let url = self.url("/heartbeat");
        let response = self.authorized(self.client.post(&url)).send().await?;

        self.handle_empty_response(response).await
    }
}
