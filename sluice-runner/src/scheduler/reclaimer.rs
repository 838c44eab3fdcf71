//! Sandbox reclamation
//!
//! Job executors hand finished sandboxes over through a channel; this loop
//! owns them from then on and destroys them one by one.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sandbox::{Sandbox, SandboxBackend};

/// Destroys every sandbox received until all senders are gone
///
/// Returns the number of sandboxes handled.
pub async fn reclaim_sandboxes(
    backend: Arc<dyn SandboxBackend>,
    mut rx: mpsc::UnboundedReceiver<Sandbox>,
) -> usize {
    let mut handled = 0;

    while let Some(sandbox) = rx.recv().await {
        handled += 1;
        match backend.destroy(&sandbox).await {
            Ok(()) => debug!("Destroyed sandbox {}", sandbox.name()),
            Err(e) => warn!("Failed to destroy sandbox {}: {}", sandbox.name(), e),
        }
    }

    handled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedBackend;

    #[tokio::test]
    async fn test_drains_until_senders_close() {
        let backend = Arc::new(ScriptedBackend::new());
        let (tx, rx) = mpsc::unbounded_channel();

        let first = backend.create("job-a", "alpine", &[]).await.unwrap();
        tx.send(first).unwrap();
        // never created: the destroy still runs and the loop keeps going
        tx.send(Sandbox::new("id-ghost", "job-ghost")).unwrap();
        drop(tx);

        assert_eq!(reclaim_sandboxes(backend.clone(), rx).await, 2);
        assert_eq!(
            *backend.destroyed.lock().unwrap(),
            vec!["job-a".to_string(), "job-ghost".to_string()]
        );
    }
}
