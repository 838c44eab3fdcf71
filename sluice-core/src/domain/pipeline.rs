//! Pipeline domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pipeline run as described by the gate
///
/// Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    /// Commit the pipeline builds
    pub commit: String,
    /// Previous head of the ref, empty for new refs
    #[serde(default)]
    pub from_commit: String,
    pub ref_type: RefType,
    /// Branch or tag name without the `refs/...` prefix
    pub ref_display_id: String,
    #[serde(default)]
    pub pull_request: Option<PullRequest>,
    pub runner_id: Uuid,
    pub repository_id: Uuid,
    pub project_id: Uuid,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub clone_url: String,
    #[serde(default)]
    pub ssh_clone_url: String,
    /// Path of the pipeline configuration file inside the repository
    pub config_file: String,
}

/// Kind of ref a pipeline was triggered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    Branch,
    Tag,
}

/// Pull request metadata attached to a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    pub source_branch: String,
    pub target_branch: String,
}

/// A pipeline-environment variable provided with the task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    pub value: String,
    /// Masked variables never appear in job logs
    #[serde(default)]
    pub masked: bool,
}
