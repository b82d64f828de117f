use crate::metrics::RegistryMetrics;
use registry_core::ServiceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Periodically drop expired leases. Expiry is already enforced on every
/// lookup; this only bounds how long dead entries occupy memory.
pub fn spawn_sweeper(
    registry: Arc<ServiceRegistry>,
    metrics: RegistryMetrics,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let removed = registry.sweep_expired().await;
            if removed > 0 {
                info!("Swept {} expired leases", removed);
                metrics.swept_total.inc_by(removed as u64);
            } else {
                debug!("Sweep found no expired leases");
            }
        }
    })
}
