//! Pipeline and job status

use serde::{Deserialize, Serialize};

/// Execution status shared by pipelines and jobs
///
/// Transitions only ever move a job from a non-terminal status to a
/// terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    #[serde(other)]
    Unknown,
}

impl Status {
    /// Returns true once no further transition is allowed
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failed | Status::Canceled | Status::Skipped
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Pending => "PENDING",
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Success => "SUCCESS",
            Status::Failed => "FAILED",
            Status::Canceled => "CANCELED",
            Status::Skipped => "SKIPPED",
            Status::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}
