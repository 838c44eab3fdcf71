//! Runner DTOs
//!
//! Registration and identity of the runner.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to register a runner with the gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRunner {
    /// Human-readable runner name
    pub name: String,

    /// Registration secret issued by the server
    pub token: String,

    /// Runner version, reported back in job environments
    pub version: String,
}

/// Response to a successful registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    /// Identity assigned to this runner
    pub runner_id: Uuid,

    /// Bearer token for every subsequent request
    pub access_token: String,
}
