//! Container engine backend
//!
//! Drives podman (or a docker-compatible CLI) to manage sandboxes:
//! - Checking the local image cache and pulling with resolved credentials
//! - Starting one long-lived container per sandbox, labelled with its owner
//! - Executing commands with `exec`, streaming their output
//! - Removing containers individually or in bulk by owner label

use async_trait::async_trait;
use sluice_core::domain::auth::{self, AuthConfigs, RegistryAuth};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ExecRequest, LineSink, OutputFn, Sandbox, SandboxBackend, SandboxError, SandboxResult, Volume,
    stream_command,
};

/// Label attached to every container this runner creates
pub const OWNER_LABEL: &str = "io.sluice.runner";

/// Sandbox backend backed by a container engine CLI
pub struct ContainerBackend {
    /// Engine binary (e.g. "podman" or "docker")
    cli: String,
    /// Value of the owner label; identifies this runner's containers
    owner: String,
}

impl ContainerBackend {
    /// Creates a backend driving `cli`, labelling containers with `owner`
    pub fn new(cli: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            cli: cli.into(),
            owner: owner.into(),
        }
    }

    /// Checks that the engine binary is installed and working
    pub async fn check_available(&self) -> SandboxResult<String> {
        let output = self.run(&["--version"]).await?;
        let version = output.trim().to_string();
        info!("Container engine is available: {}", version);
        Ok(version)
    }

    fn owner_filter(&self) -> String {
        format!("{}={}", OWNER_LABEL, self.owner)
    }

    fn is_docker(&self) -> bool {
        std::path::Path::new(&self.cli)
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("docker"))
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.cli);
        command.kill_on_drop(true);
        command
    }

    /// Runs an engine command to completion and returns its stdout
    async fn run(&self, args: &[&str]) -> SandboxResult<String> {
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::Engine(format!("failed to run {}: {}", self.cli, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(SandboxError::Engine(format!(
                "{} {} failed: exit_code={}, stderr='{}'",
                self.cli,
                args.first().copied().unwrap_or_default(),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        if !stderr.trim().is_empty() {
            debug!("{} {:?} stderr: {}", self.cli, args, stderr.trim());
        }

        Ok(stdout)
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.run(&["image", "inspect", "--format", "{{.Id}}", image])
            .await
            .is_ok()
    }

    async fn image_digest(&self, image: &str) -> SandboxResult<String> {
        let format = "{{if .RepoDigests}}{{index .RepoDigests 0}}{{else}}{{.Id}}{{end}}";
        let digest = self
            .run(&["image", "inspect", "--format", format, image])
            .await?;
        let digest = digest.trim();
        Ok(digest
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or(digest)
            .to_string())
    }

    async fn pull(
        &self,
        image: &str,
        credential: Option<&RegistryAuth>,
        output: LineSink<'_>,
    ) -> SandboxResult<()> {
        let mut command = self.command();
        command.arg("pull");

        // Credentials travel through a throwaway auth file, never argv.
        let auth_dir = match credential {
            Some(credential) => {
                let dir = tempfile::tempdir()?;
                let path = dir.path().join("config.json");
                let mut auths = serde_json::Map::new();
                auths.insert(
                    auth::registry_of(image),
                    serde_json::json!({ "auth": credential.encoded() }),
                );
                let document = serde_json::json!({ "auths": auths });
                tokio::fs::write(&path, document.to_string()).await?;
                if self.is_docker() {
                    command.env("DOCKER_CONFIG", dir.path());
                } else {
                    command.arg("--authfile").arg(&path);
                }
                Some(dir)
            }
            None => None,
        };
        command.arg(image);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let forward: OutputFn = Box::new(move |line: &str| {
            let _ = tx.send(line.to_string());
        });

        let placeholder = Sandbox::new("pull", format!("pull {}", image));
        let never = CancellationToken::new();
        let pull = stream_command(command, &placeholder, true, true, forward, &never);
        tokio::pin!(pull);

        let result = loop {
            tokio::select! {
                result = &mut pull => break result,
                Some(line) = rx.recv() => output(&line),
            }
        };
        while let Ok(line) = rx.try_recv() {
            output(&line);
        }
        drop(auth_dir);

        result.map_err(|e| match e {
            SandboxError::NonZeroExit { code } => {
                SandboxError::Engine(format!("pull of {} failed with exit code {}", image, code))
            }
            other => other,
        })
    }
}

/// Appends `:latest` to references that carry no tag or digest
pub fn normalize_image(image: &str) -> String {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if image.contains('@') || last_segment.contains(':') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    fn name(&self) -> &'static str {
        "container"
    }

    fn isolates_filesystem(&self) -> bool {
        true
    }

    async fn create(&self, name: &str, image: &str, volumes: &[Volume]) -> SandboxResult<Sandbox> {
        info!("Creating container {} for image {}", name, image);

        let label = self.owner_filter();
        let mounts: Vec<String> = volumes
            .iter()
            .map(|v| format!("{}:{}", v.source.display(), v.target))
            .collect();

        let mut args: Vec<&str> = vec!["run", "-d", "--name", name, "--label", label.as_str()];
        for mount in &mounts {
            args.push("-v");
            args.push(mount.as_str());
        }
        // Keep the container alive regardless of the image's entrypoint.
        args.extend(["--entrypoint", "/bin/sh", image, "-c", "sleep infinity"]);

        let id = self.run(&args).await?.trim().to_string();
        info!("Container {} started with ID: {}", name, id);

        Ok(Sandbox::new(id, name))
    }

    async fn destroy(&self, sandbox: &Sandbox) -> SandboxResult<()> {
        sandbox.kill_all();

        match self.run(&["rm", "-f", sandbox.name()]).await {
            Ok(_) => {
                debug!("Container {} removed", sandbox.name());
                Ok(())
            }
            Err(SandboxError::Engine(message))
                if message.to_ascii_lowercase().contains("no such container") =>
            {
                debug!("Container {} already removed", sandbox.name());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn prepare(
        &self,
        image: &str,
        output: LineSink<'_>,
        info: LineSink<'_>,
        pull_configs: &[AuthConfigs],
    ) -> SandboxResult<()> {
        let image = normalize_image(image);

        if self.image_exists(&image).await {
            debug!("Image {} found in local cache", image);
        } else {
            let registry = auth::registry_of(&image);
            let credential = auth::resolve(&registry, pull_configs);
            info!(
                "Pulling image {} (registry {}, authenticated: {})",
                image,
                registry,
                credential.is_some()
            );
            self.pull(&image, credential, output).await?;
        }

        let digest = self.image_digest(&image).await?;
        info(&format!("Using image {} @ {}", image, digest));
        Ok(())
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        request: ExecRequest,
        output: OutputFn,
        cancel: CancellationToken,
    ) -> SandboxResult<()> {
        if request.cmd.is_empty() {
            return Err(SandboxError::Engine("empty command".to_string()));
        }

        debug!("Executing in container {}: {:?}", sandbox.name(), request.cmd);

        let mut command = self.command();
        command.arg("exec");
        if let Some(workdir) = &request.workdir {
            command.arg("-w").arg(workdir);
        }
        // Values are inherited from the engine client's environment so they
        // never appear on a command line.
        for (key, value) in &request.env {
            command.arg("-e").arg(key);
            command.env(key, value);
        }
        command.arg(sandbox.name()).args(&request.cmd);

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
        let filter = format!("label={}", self.owner_filter());
        let listed = self.run(&["ps", "-a", "-q", "--filter", &filter]).await?;
        let ids: Vec<&str> = listed.split_whitespace().collect();

        if ids.is_empty() {
            debug!("No leftover containers to clean up");
            return Ok(());
        }

        info!("Removing {} leftover container(s)", ids.len());
        for id in ids {
            if let Err(e) = self.run(&["rm", "-f", id]).await {
                warn!("Failed to remove leftover container {}: {}", id, e);
            }
        }

        Ok(())
    }
}
