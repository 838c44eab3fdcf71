//! Job domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::status::Status;

/// One job of a pipeline, as handed out by the gate
///
/// The stage is a free-form name. Stage order is not stored; it is derived
/// from the order in which stage names first appear in the job list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: Uuid,
    pub stage: String,
    pub name: String,
    pub status: Status,
}

/// Groups jobs into stages, ordered by first appearance of each stage name
///
/// Jobs keep their relative order inside a stage.
pub fn group_stages(jobs: &[PipelineJob]) -> Vec<Vec<PipelineJob>> {
    let mut order: Vec<&str> = Vec::new();
    let mut stages: Vec<Vec<PipelineJob>> = Vec::new();

    for job in jobs {
        match order.iter().position(|name| *name == job.stage) {
            Some(idx) => stages[idx].push(job.clone()),
            None => {
                order.push(&job.stage);
                stages.push(vec![job.clone()]);
            }
        }
    }

    stages
}
