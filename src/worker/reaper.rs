//! Periodic abandonment sweep.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;

/// Spawn the reaper loop: every `interval`, expire conversations idle past
/// the ledger TTL and roll back their collected data.
pub fn spawn_reaper(engine: Arc<Engine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = engine.reap_idle().await {
                tracing::error!(error = %e, "Abandonment sweep failed");
            }
        }
    })
}
