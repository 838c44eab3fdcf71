//! Bare host-process backend
//!
//! Runs commands directly on the host. A sandbox is only a bookkeeping
//! handle: creating one allocates nothing on the host, and destroying it
//! stops whatever commands are still running in it.

use async_trait::async_trait;
use sluice_core::domain::auth::AuthConfigs;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ExecRequest, LineSink, OutputFn, Sandbox, SandboxBackend, SandboxError, SandboxResult, Volume,
    stream_command,
};

/// Sandbox backend running commands as host processes
#[derive(Default)]
pub struct ProcessBackend {
    /// Live sandboxes by id
    sandboxes: Mutex<HashMap<String, Sandbox>>,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<String, Sandbox>> {
        self.sandboxes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn isolates_filesystem(&self) -> bool {
        false
    }

    async fn create(&self, name: &str, image: &str, volumes: &[Volume]) -> SandboxResult<Sandbox> {
        debug!(
            "Allocating process sandbox {} (image {} and {} volume(s) ignored)",
            name,
            image,
            volumes.len()
        );

        let sandbox = Sandbox::new(Uuid::new_v4().to_string(), name);
        self.live()
            .insert(sandbox.id().to_string(), sandbox.clone());
        Ok(sandbox)
    }

    async fn destroy(&self, sandbox: &Sandbox) -> SandboxResult<()> {
        sandbox.kill_all();
        self.live().remove(sandbox.id());
        Ok(())
    }

    async fn prepare(
        &self,
        image: &str,
        _output: LineSink<'_>,
        info: LineSink<'_>,
        _pull_configs: &[AuthConfigs],
    ) -> SandboxResult<()> {
        info(&format!(
            "Using host process runtime (image {} is not used)",
            image
        ));
        Ok(())
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        request: ExecRequest,
        output: OutputFn,
        cancel: CancellationToken,
    ) -> SandboxResult<()> {
        let Some((program, args)) = request.cmd.split_first() else {
            return Err(SandboxError::Engine("empty command".to_string()));
        };

        debug!("Executing in process sandbox {}: {:?}", sandbox.name(), request.cmd);

        let mut command = Command::new(program);
        command.args(args).envs(&request.env);
        if let Some(workdir) = &request.workdir {
            command.current_dir(workdir);
        }

        stream_command(
            command,
            sandbox,
            request.attach_stdout,
            request.attach_stderr,
            output,
            &cancel,
        )
        .await
    }

    async fn cleanup(&self) -> SandboxResult<()> {
        let mut live = self.live();
        if !live.is_empty() {
            info!("Stopping {} process sandbox(es)", live.len());
        }
        for sandbox in live.values() {
            sandbox.kill_all();
        }
        live.clear();
        Ok(())
    }
}
