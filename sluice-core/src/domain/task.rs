//! Tasks handed out by the gate
//!
//! The gate answers a poll with a `(kind, data)` envelope. An empty kind means
//! there is no work; any kind other than the ones below is an error.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::PipelineJob;
use crate::domain::pipeline::{Pipeline, Variable};
use crate::error::{Error, Result};

pub const PIPELINE_RUN: &str = "PipelineRun";
pub const PIPELINE_CANCEL: &str = "PipelineCancel";

/// Decoded unit of work
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// Nothing to do right now
    None,
    PipelineRun(Box<PipelineRun>),
    PipelineCancel(PipelineCancel),
}

/// Request to run every job of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub pipeline: Pipeline,
    pub jobs: Vec<PipelineJob>,
    #[serde(default)]
    pub env: Vec<Variable>,
    pub clone_url: String,
    #[serde(default)]
    pub known_hosts: String,
    /// Deploy key loaded into the credential agent
    #[serde(default)]
    pub ssh_private_key: Option<String>,
}

/// Request to stop in-flight pipelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCancel {
    pub pipeline_ids: Vec<Uuid>,
}

impl Task {
    /// Decodes a task envelope
    pub fn decode(kind: &str, data: serde_json::Value) -> Result<Self> {
        match kind {
            "" => Ok(Task::None),
            PIPELINE_RUN => serde_json::from_value(data)
                .map(|run| Task::PipelineRun(Box::new(run)))
                .map_err(|source| Error::MalformedTask {
                    kind: kind.to_string(),
                    source,
                }),
            PIPELINE_CANCEL => serde_json::from_value(data)
                .map(Task::PipelineCancel)
                .map_err(|source| Error::MalformedTask {
                    kind: kind.to_string(),
                    source,
                }),
            other => Err(Error::UnknownTaskKind(other.to_string())),
        }
    }
}

impl PipelineRun {
    /// Looks up a task-provided variable
    pub fn variable(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|v| v.key == key)
            .map(|v| v.value.as_str())
    }
}
