//! Scheduler layer for the runner
//!
//! Polls the gate for work, keeps the number of running pipelines under the
//! configured ceiling, routes cancel requests to running pipelines, and
//! destroys sandboxes once their jobs are done with them.

pub mod heartbeat;
pub mod poller;
pub mod reclaimer;
pub mod registry;

pub use heartbeat::heartbeat_loop;
pub use poller::{PipelineLauncher, TaskPoller};
pub use reclaimer::reclaim_sandboxes;
