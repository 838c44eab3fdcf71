//! Log DTOs

use serde::{Deserialize, Serialize};

/// A chunk of job output appended to the job's log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub data: String,
}
