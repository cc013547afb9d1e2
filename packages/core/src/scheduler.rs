//! Background sampling scheduler.
//!
//! Each tick purges expired cache entries and polls every registered plug,
//! so the consumption ledger keeps growing while nobody has a dashboard
//! open. Readings still go through the cache: a plug polled by a request
//! within the TTL is not polled again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::signal;
use tokio::time;

use crate::cache::AppCache;
use crate::metrics::AppMetrics;
use crate::models::DeviceRecord;
use crate::poller::DevicePoller;
use crate::repository::{EnergyRepository, RepositoryError};

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub purged: usize,
    pub polled: usize,
    pub degraded: usize,
}

/// Run the sampling loop until `Ctrl+C` (SIGINT) is received.
///
/// A failed tick is logged and the loop carries on.
pub async fn run_sampling(
    repo: EnergyRepository,
    poller: DevicePoller,
    cache: Arc<AppCache>,
    metrics: Option<Arc<AppMetrics>>,
    interval_seconds: u64,
) {
    let mut interval = time::interval(Duration::from_secs(interval_seconds.max(1)));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    tracing::info!("Sampling started (interval: {}s)", interval_seconds);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match sample_once(&repo, &poller, &cache).await {
                    Ok(summary) => {
                        tracing::info!(
                            "Sampled {} plugs ({} degraded), purged {} cache entries",
                            summary.polled,
                            summary.degraded,
                            summary.purged
                        );
                    }
                    Err(err) => tracing::error!("Sampling tick failed, skipping: {}", err),
                }
                if let Some(metrics) = &metrics {
                    metrics.cache_entries.set(cache.len() as f64);
                }
            }

            _ = signal::ctrl_c() => {
                tracing::info!("Shutdown signal received. Stopping sampling.");
                break;
            }
        }
    }

    tracing::info!("Sampling stopped cleanly");
}

/// Execute a single tick. Plugs are polled per owner so each reading is
/// written back against the right user.
pub async fn sample_once(
    repo: &EnergyRepository,
    poller: &DevicePoller,
    cache: &AppCache,
) -> Result<TickSummary, RepositoryError> {
    let purged = cache.purge_expired();

    let mut by_owner: BTreeMap<i64, Vec<DeviceRecord>> = BTreeMap::new();
    for device in repo.all_devices().await? {
        by_owner.entry(device.user_id).or_default().push(device);
    }

    let rounds = by_owner
        .iter()
        .map(|(user_id, devices)| poller.poll_all(Some(*user_id), devices));
    let snapshots: Vec<_> = join_all(rounds).await.into_iter().flatten().collect();

    Ok(TickSummary {
        purged,
        polled: snapshots.len(),
        degraded: snapshots.iter().filter(|s| s.is_degraded()).count(),
    })
}
