//! Task poller
//!
//! Polls the gate for tasks and dispatches them: `PipelineRun` tasks start a
//! pipeline if the concurrency ceiling allows it, `PipelineCancel` tasks
//! cancel pipelines running here. Every poll reports the running pipelines
//! and whether another one would be accepted.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::domain::status::Status;
use sluice_core::domain::task::{PipelineRun, Task};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::registry::PipelineRegistry;
use crate::execution::PipelineExecutor;
use crate::repository::GateRepository;

/// Starts pipeline runs on behalf of the poller
#[async_trait]
pub trait PipelineLauncher: Send + Sync {
    /// Runs a pipeline to completion
    async fn launch(
        &self,
        run: PipelineRun,
        cancel: CancellationToken,
        shutdown: CancellationToken,
    ) -> Status;
}

#[async_trait]
impl PipelineLauncher for PipelineExecutor {
    async fn launch(
        &self,
        run: PipelineRun,
        cancel: CancellationToken,
        shutdown: CancellationToken,
    ) -> Status {
        self.run(run, cancel, shutdown).await
    }
}

/// Outcome of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The gate had nothing for us
    Idle,
    Launched,
    /// A run arrived while at capacity or already running
    Rejected,
    Canceled,
}

/// Polling loop with a ceiling on concurrently running pipelines
pub struct TaskPoller {
    gate: Arc<dyn GateRepository>,
    launcher: Arc<dyn PipelineLauncher>,
    registry: Arc<PipelineRegistry>,
    running: Arc<AtomicUsize>,
    max_parallel: usize,
    poll_interval: Duration,
    tracker: TaskTracker,
}

impl TaskPoller {
    pub fn new(
        gate: Arc<dyn GateRepository>,
        launcher: Arc<dyn PipelineLauncher>,
        max_parallel: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            gate,
            launcher,
            registry: Arc::new(PipelineRegistry::new()),
            running: Arc::new(AtomicUsize::new(0)),
            max_parallel,
            poll_interval,
            tracker: TaskTracker::new(),
        }
    }

    /// Number of pipelines currently executing
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Polls until `shutdown` fires, then waits for running pipelines
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting task poller (interval: {:?}, max parallel pipelines: {})",
            self.poll_interval, self.max_parallel
        );

        while !shutdown.is_cancelled() {
            // Only a launch polls again without waiting.
            let launched = match self.poll_once(&shutdown).await {
                Ok(dispatch) => dispatch == Dispatch::Launched,
                Err(e) => {
                    error!("Error during poll cycle: {:#}", e);
                    false
                }
            };

            if !launched {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!("Stopped polling; waiting for {} running pipeline(s)", self.running());
        self.tracker.close();
        self.tracker.wait().await;
        info!("All pipelines finished");

        Ok(())
    }

    /// Performs a single poll and dispatches its task
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Result<Dispatch> {
        let running = self.registry.ids();
        let has_capacity = self.running() < self.max_parallel;

        let task = self.gate.next_task(&running, has_capacity).await?;

        Ok(match task {
            Task::None => {
                debug!("No task available");
                Dispatch::Idle
            }
            Task::PipelineRun(run) => {
                if self.launch(*run, shutdown) {
                    Dispatch::Launched
                } else {
                    Dispatch::Rejected
                }
            }
            Task::PipelineCancel(cancel) => {
                for pipeline_id in cancel.pipeline_ids {
                    if self.registry.cancel(pipeline_id) {
                        info!(pipeline_id = %pipeline_id, "Canceling pipeline");
                    } else {
                        warn!(
                            pipeline_id = %pipeline_id,
                            "Cancel requested for a pipeline that is not running here"
                        );
                    }
                }
                Dispatch::Canceled
            }
        })
    }

    /// Starts a pipeline if a slot is free
    fn launch(&self, run: PipelineRun, shutdown: &CancellationToken) -> bool {
        let pipeline_id = run.pipeline.id;
        let max = self.max_parallel;

        if self
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            warn!(pipeline_id = %pipeline_id, "At capacity; not starting pipeline");
            return false;
        }

        let cancel = shutdown.child_token();
        if !self.registry.insert(pipeline_id, cancel.clone()) {
            self.running.fetch_sub(1, Ordering::SeqCst);
            warn!(pipeline_id = %pipeline_id, "Pipeline is already running");
            return false;
        }

        let slot = Slot {
            pipeline_id,
            registry: self.registry.clone(),
            running: self.running.clone(),
        };
        let launcher = self.launcher.clone();
        let shutdown = shutdown.clone();

        info!(pipeline_id = %pipeline_id, "Starting pipeline");
        self.tracker.spawn(async move {
            let _slot = slot;
            let status = launcher.launch(run, cancel, shutdown).await;
            info!(pipeline_id = %pipeline_id, "Pipeline finished: {}", status);
        });

        true
    }
}

/// Occupied pipeline slot, released on drop
struct Slot {
    pipeline_id: Uuid,
    registry: Arc<PipelineRegistry>,
    running: Arc<AtomicUsize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.registry.remove(self.pipeline_id);
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}
