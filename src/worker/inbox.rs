//! Periodic inbox drain.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;

/// Spawn the inbox drain loop. Entries are processed sequentially in arrival
/// order; a failed entry stays queued and ends the sweep, so ordering is
/// preserved across sweeps.
pub fn spawn_inbox_drain(engine: Arc<Engine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = engine.drain_inbox().await {
                tracing::error!(error = %e, "Inbox drain interrupted");
            }
        }
    })
}
