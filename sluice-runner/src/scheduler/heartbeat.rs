//! Heartbeat loop

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::repository::GateRepository;

/// Pings the gate every `interval` until `shutdown` fires
pub async fn heartbeat_loop(
    gate: Arc<dyn GateRepository>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match gate.heartbeat().await {
            Ok(()) => debug!("Heartbeat sent"),
            Err(e) => warn!("Heartbeat failed: {:#}", e),
        }
    }
}
