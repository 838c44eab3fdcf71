//! Task polling DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Poll request for the next task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Pipelines this runner is currently executing, for the gate to validate
    pub running_pipelines: Vec<Uuid>,

    /// Whether the runner has capacity for another pipeline
    pub query_pipeline: bool,
}

/// Raw task envelope; decoded with `domain::task::Task::decode`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}
