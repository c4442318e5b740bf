//! Background lease sweep.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::Scheduler;

/// Shortest sweep period accepted, whatever the configuration says.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Spawn a background task that returns expired claims to pending every
/// `sweep_interval`.
///
/// Claims are also released lazily on every claim; the sweep keeps the stored
/// state accurate while no worker is polling.
pub fn spawn_lease_sweep(scheduler: Arc<Scheduler>) -> tokio::task::JoinHandle<()> {
    let period = scheduler.config().sweep_interval.max(MIN_SWEEP_INTERVAL);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match scheduler.release_expired().await {
                Ok(0) => {}
                Ok(released) => debug!(released, "Lease sweep released claims"),
                Err(e) => warn!(error = %e, "Lease sweep failed"),
            }
        }
    })
}
