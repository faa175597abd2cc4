//! Keep-Alive Sweeper
//!
//! A single 1 Hz task that walks every registered connection, closes the
//! ones whose keep-alive expired, and logs the connection counts whenever
//! they change.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::registry::DeviceRegistry;

/// Runs until the shutdown signal fires.
pub async fn run(registry: Arc<DeviceRegistry>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_counts: Option<(usize, usize)> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let counts = sweep(&registry, Instant::now());
                if last_counts != Some(counts) {
                    info!("connections: {} total, {} with live sessions", counts.0, counts.1);
                    last_counts = Some(counts);
                }
            }
            _ = shutdown.changed() => {
                debug!("sweeper stopping");
                return;
            }
        }
    }
}

/// One sweep pass: keep-alive checks plus `(total, active)` counts.
pub fn sweep(registry: &DeviceRegistry, now: Instant) -> (usize, usize) {
    let connections = registry.snapshot();
    for conn in &connections {
        conn.check_keep_alive(now);
    }
    let total = connections.len();
    let active = connections.iter().filter(|c| c.is_alive()).count();
    (total, active)
}
