//! Runner configuration
//!
//! Every setting comes from an environment variable and falls back to a
//! default, so a bare `sluice-runner` against a local gate works out of the
//! box. `validate` rejects combinations the runner cannot work with.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::service::log_buffer::{DEFAULT_BUFFER_SIZE, DEFAULT_FLUSH_TIMEOUT};

/// Which sandbox backend executes jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Container,
    Process,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" | "podman" | "docker" => Ok(Self::Container),
            "process" | "shell" => Ok(Self::Process),
            other => bail!("unknown backend '{}' (expected 'container' or 'process')", other),
        }
    }
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Gate base URL (e.g., "http://localhost:8080")
    pub gate_url: String,

    /// Token presented once at registration
    pub registration_token: String,

    /// Human-readable runner name reported at registration
    pub runner_name: String,

    pub backend: BackendKind,

    /// Container engine CLI used by the container backend
    pub container_cli: String,

    /// Ceiling on concurrently executing pipelines
    pub max_parallel_pipelines: usize,

    /// Sleep between polls that returned no work
    pub poll_interval: Duration,

    pub heartbeat_interval: Duration,

    /// Root for per-pipeline checkout and agent directories
    pub work_dir: PathBuf,

    /// Image used when neither the job nor the pipeline names one
    pub default_image: String,

    /// Image of the per-pipeline sidecar (needs git, ssh and ssh-agent)
    pub sidecar_image: String,

    /// Log bytes buffered before a chunk is pushed
    pub log_buffer_size: usize,

    /// Inactivity before a partial log chunk is pushed
    pub log_flush_timeout: Duration,

    /// Upper bound on waiting for the sidecar credential agent
    pub agent_ready_timeout: Duration,

    /// Runner-level registry credentials (Docker config.json)
    pub docker_auth_config: Option<String>,
}

impl Config {
    /// Creates a configuration with defaults
    pub fn new(gate_url: String) -> Self {
        Self {
            gate_url,
            registration_token: String::new(),
            runner_name: default_runner_name(),
            backend: BackendKind::Container,
            container_cli: "podman".to_string(),
            max_parallel_pipelines: 2,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            work_dir: std::env::temp_dir().join("sluice"),
            default_image: "docker.io/library/alpine:latest".to_string(),
            sidecar_image: "docker.io/alpine/git:latest".to_string(),
            log_buffer_size: DEFAULT_BUFFER_SIZE,
            log_flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            agent_ready_timeout: Duration::from_secs(30),
            docker_auth_config: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Recognised variables (all optional):
    /// - GATE_URL, RUNNER_TOKEN, RUNNER_NAME
    /// - RUNNER_BACKEND (container|process), CONTAINER_CLI
    /// - MAX_PARALLEL_PIPELINES
    /// - POLL_INTERVAL, HEARTBEAT_INTERVAL, AGENT_READY_TIMEOUT (seconds)
    /// - LOG_BUFFER_SIZE (bytes), LOG_FLUSH_TIMEOUT (milliseconds)
    /// - WORK_DIR, DEFAULT_IMAGE, SIDECAR_IMAGE, DOCKER_AUTH_CONFIG
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::new(
            get("GATE_URL").unwrap_or_else(|| "http://localhost:8080".to_string()),
        );

        if let Some(token) = get("RUNNER_TOKEN") {
            config.registration_token = token;
        }
        if let Some(name) = get("RUNNER_NAME") {
            config.runner_name = name;
        }
        if let Some(backend) = get("RUNNER_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(cli) = get("CONTAINER_CLI") {
            config.container_cli = cli;
        }
        if let Some(max) = get("MAX_PARALLEL_PIPELINES") {
            config.max_parallel_pipelines = parse_number(&max, "MAX_PARALLEL_PIPELINES")?;
        }
        if let Some(secs) = get("POLL_INTERVAL") {
            config.poll_interval = Duration::from_secs(parse_number(&secs, "POLL_INTERVAL")?);
        }
        if let Some(secs) = get("HEARTBEAT_INTERVAL") {
            config.heartbeat_interval =
                Duration::from_secs(parse_number(&secs, "HEARTBEAT_INTERVAL")?);
        }
        if let Some(dir) = get("WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(image) = get("DEFAULT_IMAGE") {
            config.default_image = image;
        }
        if let Some(image) = get("SIDECAR_IMAGE") {
            config.sidecar_image = image;
        }
        if let Some(size) = get("LOG_BUFFER_SIZE") {
            config.log_buffer_size = parse_number(&size, "LOG_BUFFER_SIZE")?;
        }
        if let Some(ms) = get("LOG_FLUSH_TIMEOUT") {
            config.log_flush_timeout =
                Duration::from_millis(parse_number(&ms, "LOG_FLUSH_TIMEOUT")?);
        }
        if let Some(secs) = get("AGENT_READY_TIMEOUT") {
            config.agent_ready_timeout =
                Duration::from_secs(parse_number(&secs, "AGENT_READY_TIMEOUT")?);
        }
        config.docker_auth_config = get("DOCKER_AUTH_CONFIG");

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.gate_url.is_empty() {
            bail!("gate_url cannot be empty");
        }

        if !self.gate_url.starts_with("http://") && !self.gate_url.starts_with("https://") {
            bail!("gate_url must start with http:// or https://");
        }

        if self.runner_name.is_empty() {
            bail!("runner_name cannot be empty");
        }

        if self.max_parallel_pipelines == 0 {
            bail!("max_parallel_pipelines must be greater than 0");
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be greater than 0");
        }

        if self.log_buffer_size == 0 {
            bail!("log_buffer_size must be greater than 0");
        }

        if self.log_flush_timeout.is_zero() {
            bail!("log_flush_timeout must be greater than 0");
        }

        if self.backend == BackendKind::Container && self.container_cli.is_empty() {
            bail!("container_cli cannot be empty with the container backend");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("http://localhost:8080".to_string())
    }
}

fn parse_number<T>(value: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("{} must be a number, got '{}'", key, value))
}

fn default_runner_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("runner-{}", uuid::Uuid::new_v4()))
}
