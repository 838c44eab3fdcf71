//! Status transition DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::status::Status;

/// Status transition for a pipeline or a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// Transition into RUNNING, stamped now
    pub fn started() -> Self {
        Self {
            status: Status::Running,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    /// Transition into a terminal status, stamped now
    pub fn finished(status: Status) -> Self {
        Self {
            status,
            started_at: None,
            finished_at: Some(Utc::now()),
        }
    }
}
