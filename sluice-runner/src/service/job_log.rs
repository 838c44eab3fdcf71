//! Per-job log stream
//!
//! Each job owns one buffered stream to the gate, reachable through two
//! channels: the direct channel writes text as-is and is used before the
//! job's secrets are known (checkout, config fetch, internal errors); the
//! masked channel runs everything through a [`Masker`] once `enable_masking`
//! has been called.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use super::log_buffer::{Bufferer, ChunkSink, LogWriter};
use super::masker::Masker;
use crate::repository::GateRepository;
use crate::sandbox::OutputFn;

/// Sink pushing flushed chunks to the gate's job log endpoint
pub struct RemoteLogSink {
    gate: Arc<dyn GateRepository>,
    pipeline_id: Uuid,
    job_id: Uuid,
}

impl RemoteLogSink {
    pub fn new(gate: Arc<dyn GateRepository>, pipeline_id: Uuid, job_id: Uuid) -> Self {
        Self {
            gate,
            pipeline_id,
            job_id,
        }
    }
}

#[async_trait]
impl ChunkSink for RemoteLogSink {
    async fn flush(&self, chunk: Vec<u8>) {
        let data = String::from_utf8_lossy(&chunk).into_owned();
        if let Err(e) = self.gate.push_logs(self.pipeline_id, self.job_id, data).await {
            warn!(job_id = %self.job_id, "Dropping log chunk: {:#}", e);
        }
    }
}

/// Log stream of one job
pub struct JobLog {
    direct: Arc<Bufferer>,
    masked: OnceLock<Masker<Arc<Bufferer>>>,
}

impl JobLog {
    pub fn new(sink: Arc<dyn ChunkSink>, buffer_size: usize, flush_timeout: Duration) -> Self {
        Self {
            direct: Arc::new(Bufferer::with_options(sink, buffer_size, flush_timeout)),
            masked: OnceLock::new(),
        }
    }

    /// Installs the masker; later calls are ignored
    pub fn enable_masking(
        &self,
        names: &[String],
        lookup: impl Fn(&str) -> Option<String>,
    ) {
        let _ = self
            .masked
            .set(Masker::new(self.direct.clone(), names, lookup));
    }

    /// Installs a masker built from a fully resolved secret map
    #[cfg(test)]
    pub fn enable_masking_with(&self, secrets: &std::collections::BTreeMap<String, String>) {
        let names: Vec<String> = secrets.keys().cloned().collect();
        self.enable_masking(&names, |name| secrets.get(name).cloned());
    }

    #[cfg(test)]
    pub fn is_masking(&self) -> bool {
        self.masked.get().is_some()
    }

    /// Writes one unmasked line
    pub fn direct_line(&self, line: &str) {
        let _ = self.direct.write(terminated(line).as_bytes());
    }

    /// Writes one line through the masker, or directly if masking is not
    /// enabled yet
    pub fn masked_line(&self, line: &str) {
        let data = terminated(line);
        let _ = match self.masked.get() {
            Some(masker) => masker.write(data.as_bytes()),
            None => self.direct.write(data.as_bytes()),
        };
    }

    /// Output consumer feeding the direct channel
    pub fn direct_output(self: &Arc<Self>) -> OutputFn {
        let log = self.clone();
        Box::new(move |line| log.direct_line(line))
    }

    /// Output consumer feeding the masked channel
    pub fn masked_output(self: &Arc<Self>) -> OutputFn {
        let log = self.clone();
        Box::new(move |line| log.masked_line(line))
    }

    /// Flushes everything written so far and stops the stream
    ///
    /// Returns once the last chunk reached the sink.
    pub async fn close(&self) {
        self.direct.close();
        self.direct.wait().await;
    }
}

fn terminated(line: &str) -> String {
    let mut line = line.trim_end_matches(['\r', '\n']).to_string();
    line.push('\n');
    line
}
