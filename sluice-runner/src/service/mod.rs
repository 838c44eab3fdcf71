//! Service layer
//!
//! Building blocks shared by the execution layer: the buffered and masked
//! job log pipeline and the job environment projection.

pub mod env;
pub mod job_log;
pub mod log_buffer;
pub mod masker;

pub use job_log::{JobLog, RemoteLogSink};
pub use log_buffer::{Bufferer, ChunkSink, LogWriter};
pub use masker::Masker;
