//! Sluice Runner
//!
//! A CI agent that pulls pipeline work from the gate and executes every job
//! in an ephemeral sandbox.
//!
//! Architecture:
//! - Configuration: settings from the environment, with defaults
//! - Repository: the gate API behind a trait
//! - Sandbox: container and host-process backends behind one trait
//! - Services: job log buffering and masking, job environment
//! - Execution: sidecar, job and pipeline executors
//! - Scheduler: task polling, cancellation, sandbox reclamation
//!
//! On Ctrl-C the runner stops polling, lets running pipelines fail with a
//! shutdown notice, destroys their sandboxes and exits.

mod config;
mod execution;
mod repository;
mod sandbox;
mod scheduler;
mod service;
#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use sluice_client::GateClient;
use sluice_core::domain::auth::AuthConfigs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{BackendKind, Config};
use crate::execution::{ExecutionOptions, PipelineExecutor};
use crate::repository::{GateRepository, HttpGateRepository};
use crate::sandbox::{ContainerBackend, ProcessBackend, SandboxBackend};
use crate::scheduler::{TaskPoller, heartbeat_loop, reclaim_sandboxes};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sluice_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Sluice Runner {}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    info!(
        "Loaded configuration: runner_name={}, gate_url={}, backend={:?}",
        config.runner_name, config.gate_url, config.backend
    );

    let runner_auths = AuthConfigs::parse_optional(config.docker_auth_config.as_deref())
        .context("DOCKER_AUTH_CONFIG is invalid")?;

    let client = GateClient::new(config.gate_url.clone());
    register_with_retry(&client, &config).await?;

    let backend: Arc<dyn SandboxBackend> = match config.backend {
        BackendKind::Container => {
            let backend =
                ContainerBackend::new(config.container_cli.clone(), config.runner_name.clone());
            backend.check_available().await.with_context(|| {
                format!("Container engine '{}' is not usable", config.container_cli)
            })?;
            Arc::new(backend)
        }
        BackendKind::Process => Arc::new(ProcessBackend::new()),
    };
    info!("Using {} sandbox backend", backend.name());

    if let Err(e) = backend.cleanup().await {
        warn!("Failed to clean up leftover sandboxes: {}", e);
    }

    let gate: Arc<dyn GateRepository> = Arc::new(HttpGateRepository::new(client));
    let shutdown = CancellationToken::new();

    let heartbeat = tokio::spawn(heartbeat_loop(
        gate.clone(),
        config.heartbeat_interval,
        shutdown.clone(),
    ));

    let (reclaim_tx, reclaim_rx) = mpsc::unbounded_channel();
    let reclaimer = tokio::spawn(reclaim_sandboxes(backend.clone(), reclaim_rx));

    let executor = PipelineExecutor::new(
        gate.clone(),
        backend.clone(),
        ExecutionOptions::from_config(&config),
        runner_auths,
        reclaim_tx,
    );
    let poller = TaskPoller::new(
        gate,
        Arc::new(executor),
        config.max_parallel_pipelines,
        config.poll_interval,
    );

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            }
            shutdown.cancel();
        });
    }

    info!("Runner initialized successfully");
    let result = poller.run(shutdown.clone()).await;
    shutdown.cancel();

    // the executor holds the last reclamation sender
    drop(poller);
    let reclaimed = reclaimer.await.context("Reclaimer task failed")?;
    info!("Reclaimed {} sandbox(es)", reclaimed);
    let _ = heartbeat.await;

    result
}

/// Registers with the gate, retrying with exponential backoff
///
/// The gate may not be reachable yet when the runner starts (common in
/// container environments).
async fn register_with_retry(client: &GateClient, config: &Config) -> Result<()> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match client
            .register(
                &config.runner_name,
                &config.registration_token,
                env!("CARGO_PKG_VERSION"),
            )
            .await
        {
            Ok(registration) => {
                info!(
                    "Registered as runner {} after {} attempt(s)",
                    registration.runner_id, attempt
                );
                return Ok(());
            }
            Err(e) if e.is_client_error() => {
                return Err(anyhow::anyhow!("Gate rejected registration: {}", e));
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!(
                        "Failed to register with the gate after {} attempts",
                        MAX_RETRIES
                    );
                    return Err(anyhow::anyhow!("Failed to register with the gate: {}", e));
                }

                warn!(
                    "Failed to register with the gate (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
