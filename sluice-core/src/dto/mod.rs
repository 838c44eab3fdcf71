//! Data Transfer Objects for the gate protocol
//!
//! Request and response bodies exchanged between the runner and the gate.

pub mod log;
pub mod runner;
pub mod status;
pub mod task;
