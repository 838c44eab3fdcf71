//! Running pipeline registry
//!
//! Maps each executing pipeline to the token that cancels it. Entries are
//! inserted when a pipeline is launched and removed when its run returns,
//! whatever the outcome.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pipeline; returns false if it is already registered
    pub fn insert(&self, pipeline_id: Uuid, cancel: CancellationToken) -> bool {
        let mut pipelines = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        if pipelines.contains_key(&pipeline_id) {
            return false;
        }
        pipelines.insert(pipeline_id, cancel);
        true
    }

    pub fn remove(&self, pipeline_id: Uuid) {
        self.pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pipeline_id);
    }

    /// Cancels a pipeline; returns false if it is not running here
    pub fn cancel(&self, pipeline_id: Uuid) -> bool {
        let pipelines = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        match pipelines.get(&pipeline_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of every registered pipeline
    pub fn ids(&self) -> Vec<Uuid> {
        self.pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
