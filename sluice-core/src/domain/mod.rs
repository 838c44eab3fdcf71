//! Core domain types
//!
//! This module contains the domain structures the runner receives from the
//! gate (pipelines, jobs, tasks) and the documents it decodes while running
//! them (pipeline configuration, registry credentials).

pub mod auth;
pub mod config;
pub mod job;
pub mod pipeline;
pub mod status;
pub mod task;
