//! Sluice Core
//!
//! Core types shared by the Sluice runner and its gate client.
//!
//! This crate contains:
//! - Domain types: pipelines, jobs, statuses, tasks, pipeline configuration
//!   and registry credentials
//! - DTOs: request/response bodies of the gate protocol

pub mod domain;
pub mod dto;
pub mod error;

pub use error::{Error, Result};
