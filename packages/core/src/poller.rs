//! Concurrent device fan-out poller.
//!
//! Reads live consumption from every plug a user owns, under two nested
//! deadlines: each device gets `device_timeout`, and the whole batch gets
//! `deadline`. Nothing here ever fails: a plug that is slow or unreachable
//! becomes a zeroed snapshot carrying an error tag, and a batch that runs
//! out of time is completed with basic records for the devices that had
//! not answered yet.
//!
//! Polls that miss the batch deadline are detached, not aborted. They may
//! still finish later, and their cache write and sample write-back apply
//! even though the caller already got the fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};

use crate::cache::{keys, AppCache};
use crate::device::{DeviceError, PlugConnector};
use crate::metrics::AppMetrics;
use crate::models::{CachedValue, ConsumptionSample, DeviceRecord, DeviceSnapshot};
use crate::pool::{TaskError, WorkerPool};
use crate::repository::SampleSink;

pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct DevicePoller {
    connector: Arc<dyn PlugConnector>,
    cache: Arc<AppCache>,
    pool: WorkerPool,
    samples: Arc<dyn SampleSink>,
    device_timeout: Duration,
    deadline: Duration,
    metrics: Option<Arc<AppMetrics>>,
}

impl DevicePoller {
    pub fn new(
        connector: Arc<dyn PlugConnector>,
        cache: Arc<AppCache>,
        pool: WorkerPool,
        samples: Arc<dyn SampleSink>,
    ) -> Self {
        Self {
            connector,
            cache,
            pool,
            samples,
            device_timeout: DEFAULT_DEVICE_TIMEOUT,
            deadline: DEFAULT_POLL_DEADLINE,
            metrics: None,
        }
    }

    pub fn with_timeouts(mut self, device_timeout: Duration, deadline: Duration) -> Self {
        self.device_timeout = device_timeout;
        self.deadline = deadline;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Poll every device concurrently and return one snapshot per device.
    ///
    /// Returns no later than `deadline` after the call. The result holds
    /// exactly one snapshot per input device; callers must match them by
    /// `id`, not by position.
    pub async fn poll_all(&self, user_id: Option<i64>, devices: &[DeviceRecord]) -> Vec<DeviceSnapshot> {
        if devices.is_empty() {
            return Vec::new();
        }

        let deadline = Instant::now() + self.deadline;
        let mut polls = JoinSet::new();
        for device in devices.iter().cloned() {
            let poller = self.clone();
            polls.spawn(async move { poller.poll_device(&device, user_id).await });
        }

        let mut settled: HashMap<i64, DeviceSnapshot> = HashMap::with_capacity(devices.len());
        loop {
            match time::timeout_at(deadline, polls.join_next()).await {
                Ok(Some(Ok(snapshot))) => {
                    settled.insert(snapshot.id, snapshot);
                }
                Ok(Some(Err(err))) => {
                    tracing::error!("Device poll task failed: {}", err);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        pending = polls.len(),
                        "Poll deadline of {:?} reached, returning basic records",
                        self.deadline
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .device_poll_failures_total
                            .with_label_values(&["deadline"])
                            .inc_by(polls.len() as f64);
                    }
                    break;
                }
            }
        }
        polls.detach_all();

        devices
            .iter()
            .map(|device| {
                settled
                    .remove(&device.id)
                    .unwrap_or_else(|| DeviceSnapshot::timed_out(device))
            })
            .collect()
    }

    /// Read one device, serving a fresh cached snapshot when there is one.
    ///
    /// A successful network read is cached under `energy_data_{id}` and,
    /// when `user_id` is known, written back as a consumption sample in
    /// the background.
    pub async fn poll_device(&self, device: &DeviceRecord, user_id: Option<i64>) -> DeviceSnapshot {
        let key = keys::device_energy(device.id);
        if let Some(CachedValue::Snapshot(snapshot)) = self.cache.get(&key) {
            self.record_cache_lookup(true);
            return snapshot;
        }
        self.record_cache_lookup(false);

        match self.read_device(device).await {
            Ok((watts, is_on)) => {
                let snapshot = DeviceSnapshot::reading(device, watts, is_on);
                self.cache.set(key, CachedValue::Snapshot(snapshot.clone()));
                if let Some(user_id) = user_id {
                    self.persist_sample(ConsumptionSample {
                        user_id,
                        device_id: device.id,
                        consumption_kwh: watts / 1000.0,
                        timestamp: Utc::now(),
                    });
                }
                snapshot
            }
            Err(DeviceError::Timeout(limit)) => {
                tracing::warn!(
                    "Timeout reading plug {} ({}) after {:?}",
                    device.id,
                    device.ip_address,
                    limit
                );
                self.record_failure("timeout");
                DeviceSnapshot::timed_out(device)
            }
            Err(err) => {
                tracing::error!(
                    "Error reading plug {} ({}): {}",
                    device.id,
                    device.ip_address,
                    err
                );
                self.record_failure("transport");
                DeviceSnapshot::degraded(device, err.to_string())
            }
        }
    }

    /// Live reading that bypasses the cache and records nothing.
    pub async fn read_live(&self, device: &DeviceRecord) -> Result<f64, DeviceError> {
        let (watts, _) = self.read_device(device).await?;
        Ok(watts)
    }

    /// Switch a plug on or off. Unlike polling this is an explicit user
    /// action, so failures are returned to the caller.
    pub async fn set_power(&self, device: &DeviceRecord, on: bool) -> Result<(), DeviceError> {
        let limit = self.device_timeout;
        let mut session = self.connector.open(&device.ip_address);

        time::timeout(limit, session.refresh())
            .await
            .map_err(|_| DeviceError::Timeout(limit))??;
        time::timeout(limit, session.set_on(on))
            .await
            .map_err(|_| DeviceError::Timeout(limit))??;

        self.cache.remove(&keys::device_energy(device.id));
        tracing::info!(
            "Plug {} ({}) switched {}",
            device.id,
            device.ip_address,
            if on { "on" } else { "off" }
        );
        Ok(())
    }

    async fn read_device(&self, device: &DeviceRecord) -> Result<(f64, bool), DeviceError> {
        let limit = self.device_timeout;
        let mut session = self.connector.open(&device.ip_address);
        if let Some(metrics) = &self.metrics {
            metrics.device_polls_total.inc();
        }

        time::timeout(limit, session.refresh())
            .await
            .map_err(|_| DeviceError::Timeout(limit))??;

        Ok((session.power_watts(), session.is_on()))
    }

    fn persist_sample(&self, sample: ConsumptionSample) {
        let sink = self.samples.clone();
        self.pool.fire_and_forget("persist_sample", async move {
            sink.record_sample(&sample)
                .await
                .map_err(|err| TaskError::Storage(err.to_string()))
        });
    }

    fn record_cache_lookup(&self, hit: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(hit);
        }
    }

    fn record_failure(&self, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .device_poll_failures_total
                .with_label_values(&[reason])
                .inc();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{fast, FakeConnector, MemorySink, PlugBehavior};
    use super::*;
    use crate::models::TIMEOUT_TAG;

    fn device(id: i64, name: &str, ip: &str) -> DeviceRecord {
        DeviceRecord {
            id,
            user_id: 1,
            name: name.to_string(),
            ip_address: ip.to_string(),
            created_at: "2026-01-01 00:00:00".to_string(),
        }
    }

    fn poller(connector: FakeConnector, sink: Arc<MemorySink>) -> (DevicePoller, Arc<AppCache>) {
        let cache = Arc::new(AppCache::new(Duration::from_secs(300)));
        let poller = DevicePoller::new(Arc::new(connector), cache.clone(), WorkerPool::new(4), sink);
        (poller, cache)
    }

    fn by_id(snapshots: &[DeviceSnapshot], id: i64) -> &DeviceSnapshot {
        snapshots.iter().find(|s| s.id == id).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_devices_resolve_within_deadline() {
        let connector = FakeConnector::default()
            .with("10.0.0.1", fast(150.0, true))
            .with("10.0.0.2", fast(0.0, false))
            .with("10.0.0.3", PlugBehavior::Hang);
        let sink = Arc::new(MemorySink::default());
        let (poller, _) = poller(connector, sink);
        let poller = poller.with_timeouts(Duration::from_secs(2), Duration::from_secs(10));
        let devices = vec![
            device(1, "Televisor", "10.0.0.1"),
            device(2, "Lavadora", "10.0.0.2"),
            device(3, "Terma", "10.0.0.3"),
        ];

        let started = Instant::now();
        let snapshots = poller.poll_all(Some(1), &devices).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(snapshots.len(), 3);

        let a = by_id(&snapshots, 1);
        assert_eq!(a.consumption, 0.15);
        assert!(a.status);
        assert!(a.error.is_none());

        let b = by_id(&snapshots, 2);
        assert_eq!(b.consumption, 0.0);
        assert!(!b.status);
        assert!(b.error.is_none());

        let c = by_id(&snapshots, 3);
        assert_eq!(c.consumption, 0.0);
        assert!(!c.status);
        assert_eq!(c.error.as_deref(), Some(TIMEOUT_TAG));

        let total: f64 = snapshots.iter().map(|s| s.consumption).sum();
        assert!((total - 0.15).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn global_deadline_fills_in_unsettled_devices() {
        let connector = FakeConnector::default()
            .with("10.0.0.1", fast(60.0, true))
            .with("10.0.0.2", PlugBehavior::Hang);
        let (poller, _) = poller(connector, Arc::new(MemorySink::default()));
        let poller = poller.with_timeouts(Duration::from_secs(30), Duration::from_secs(1));
        let devices = vec![device(1, "Foco", "10.0.0.1"), device(2, "Radio", "10.0.0.2")];

        let started = Instant::now();
        let snapshots = poller.poll_all(None, &devices).await;

        assert!(started.elapsed() <= Duration::from_secs(1) + Duration::from_millis(5));
        assert_eq!(snapshots.len(), 2);
        assert_eq!(by_id(&snapshots, 1).consumption, 0.06);
        let slow = by_id(&snapshots, 2);
        assert_eq!(slow.name, "Radio");
        assert_eq!(slow.ip_address, "10.0.0.2");
        assert_eq!(slow.error.as_deref(), Some(TIMEOUT_TAG));
    }

    #[tokio::test(start_paused = true)]
    async fn late_poll_still_populates_cache() {
        let connector = FakeConnector::default().with(
            "10.0.0.9",
            PlugBehavior::Respond {
                watts: 1000.0,
                on: true,
                delay: Duration::from_secs(3),
            },
        );
        let sink = Arc::new(MemorySink::default());
        let (poller, cache) = poller(connector, sink.clone());
        let poller = poller.with_timeouts(Duration::from_secs(5), Duration::from_secs(1));
        let devices = vec![device(9, "Horno", "10.0.0.9")];

        let snapshots = poller.poll_all(Some(1), &devices).await;
        assert_eq!(snapshots[0].error.as_deref(), Some(TIMEOUT_TAG));

        time::sleep(Duration::from_secs(3)).await;

        match cache.get(&keys::device_energy(9)) {
            Some(CachedValue::Snapshot(snapshot)) => assert_eq!(snapshot.consumption, 1.0),
            other => panic!("expected late snapshot in cache, got {:?}", other),
        }
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_is_tagged_not_raised() {
        let connector =
            FakeConnector::default().with("10.0.0.4", PlugBehavior::Fail("connection refused"));
        let (poller, cache) = poller(connector, Arc::new(MemorySink::default()));

        let snapshot = poller.poll_device(&device(4, "Router", "10.0.0.4"), Some(1)).await;

        assert_eq!(snapshot.consumption, 0.0);
        assert!(!snapshot.status);
        assert!(snapshot.error.unwrap().contains("connection refused"));
        assert!(cache.get(&keys::device_energy(4)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cached_snapshot_skips_network() {
        let connector = FakeConnector::default().with("10.0.0.5", fast(200.0, true));
        let (poller, _) = poller(connector.clone(), Arc::new(MemorySink::default()));
        let plug = device(5, "Ventilador", "10.0.0.5");

        let first = poller.poll_device(&plug, None).await;
        let second = poller.poll_device(&plug, None).await;

        assert_eq!(first, second);
        assert_eq!(connector.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_poll_writes_sample_in_background() {
        let connector = FakeConnector::default().with("10.0.0.6", fast(1500.0, true));
        let sink = Arc::new(MemorySink::default());
        let (poller, _) = poller(connector, sink.clone());

        poller.poll_device(&device(6, "Plancha", "10.0.0.6"), Some(42)).await;
        time::sleep(Duration::from_millis(10)).await;

        let samples = sink.samples.lock().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].user_id, 42);
        assert_eq!(samples[0].device_id, 6);
        assert!((samples[0].consumption_kwh - 1.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn no_sample_without_user() {
        let connector = FakeConnector::default().with("10.0.0.6", fast(1500.0, true));
        let sink = Arc::new(MemorySink::default());
        let (poller, _) = poller(connector, sink.clone());

        poller.poll_device(&device(6, "Plancha", "10.0.0.6"), None).await;
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(sink.len(), 0);
    }

    #[tokio::test]
    async fn empty_device_list_returns_immediately() {
        let (poller, _) = poller(FakeConnector::default(), Arc::new(MemorySink::default()));
        assert!(poller.poll_all(Some(1), &[]).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_power_switches_and_drops_cached_snapshot() {
        let connector = FakeConnector::default().with("10.0.0.7", fast(80.0, true));
        let (poller, cache) = poller(connector.clone(), Arc::new(MemorySink::default()));
        let plug = device(7, "Consola", "10.0.0.7");

        poller.poll_device(&plug, None).await;
        assert!(cache.get(&keys::device_energy(7)).is_some());

        poller.set_power(&plug, false).await.unwrap();

        assert!(cache.get(&keys::device_energy(7)).is_none());
        assert_eq!(
            connector.switched.lock().unwrap().as_slice(),
            &[("10.0.0.7".to_string(), false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn set_power_times_out_on_hanging_plug() {
        let connector = FakeConnector::default().with("10.0.0.8", PlugBehavior::Hang);
        let (poller, _) = poller(connector, Arc::new(MemorySink::default()));

        let err = poller
            .set_power(&device(8, "Estufa", "10.0.0.8"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
    }
}
