//! Energy service: the operations behind the HTTP API.
//!
//! Reads go through the shared cache and the device poller; every write to
//! a user's devices drops the cached views derived from them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::cache::{keys, AppCache};
use crate::error::AppError;
use crate::estimate::EstimateResolver;
use crate::mail::{compose_welcome, dispatch_welcome, Mailer, WelcomeKind};
use crate::models::{
    round_to, CachedValue, ConsumptionEstimate, Dashboard, DeviceDetail, DeviceRecord,
    DeviceSnapshot, User,
};
use crate::poller::DevicePoller;
use crate::pool::WorkerPool;
use crate::report::{recommendations, total_consumption, total_cost, ConsumptionHistory};
use crate::repository::EnergyRepository;

/// How long `add_device` waits for an estimate to quote back.
pub const ADD_DEVICE_ESTIMATE_BUDGET: Duration = Duration::from_secs(1);

/// Samples shown on the device detail page.
pub const DETAIL_HISTORY_LEN: i64 = 20;

/// Result of registering a plug.
#[derive(Debug, Clone, Serialize)]
pub struct AddedDevice {
    pub id: i64,
    pub message: String,
    pub estimate: ConsumptionEstimate,
}

/// Result of registering or re-registering a user.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub user: User,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
}

impl PowerAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

/// Strict dotted-quad IPv4: four decimal octets in 0..=255.
pub fn is_valid_ipv4(ip: &str) -> bool {
    let parts: Vec<&str> = ip.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|part| {
            !part.is_empty()
                && part.chars().all(|c| c.is_ascii_digit())
                && part.parse::<u16>().map(|octet| octet <= 255).unwrap_or(false)
        })
}

#[derive(Clone)]
pub struct EnergyService {
    repo: EnergyRepository,
    cache: Arc<AppCache>,
    poller: DevicePoller,
    estimates: Arc<EstimateResolver>,
    pool: WorkerPool,
    mailer: Arc<dyn Mailer>,
    base_url: String,
}

impl EnergyService {
    pub fn new(
        repo: EnergyRepository,
        cache: Arc<AppCache>,
        poller: DevicePoller,
        estimates: Arc<EstimateResolver>,
        pool: WorkerPool,
        mailer: Arc<dyn Mailer>,
        base_url: String,
    ) -> Self {
        Self {
            repo,
            cache,
            poller,
            estimates,
            pool,
            mailer,
            base_url,
        }
    }

    pub fn estimates(&self) -> &EstimateResolver {
        &self.estimates
    }

    // ---- Users ----

    /// Create the user, or recognise a returning one by receipt number.
    /// Either way a welcome mail goes out in the background when the user
    /// has an email address.
    pub async fn register_user(
        &self,
        username: &str,
        full_name: &str,
        email: Option<&str>,
        receipt_number: &str,
    ) -> Result<Registration, AppError> {
        let username = username.trim();
        let receipt_number = receipt_number.trim();
        if username.is_empty() || receipt_number.is_empty() {
            return Err(AppError::Validation(
                "Username and receipt number are required.".into(),
            ));
        }

        let (user, created) = match self.repo.user_by_receipt(receipt_number).await? {
            Some(user) => (user, false),
            None => {
                let id = self
                    .repo
                    .insert_user(username, full_name.trim(), email, receipt_number)
                    .await?;
                let user = self
                    .repo
                    .user_by_id(id)
                    .await?
                    .ok_or_else(|| AppError::Database(format!("user {} vanished after insert", id)))?;
                tracing::info!("Registered user {} ({})", user.username, user.receipt_number);
                (user, true)
            }
        };

        if let Some(address) = user.email.as_deref().filter(|a| !a.trim().is_empty()) {
            let (kind, stats) = if created {
                (WelcomeKind::NewUser, Default::default())
            } else {
                let stats = self.repo.user_stats(user.id).await.unwrap_or_else(|err| {
                    tracing::warn!("Could not load stats for user {}: {}", user.id, err);
                    Default::default()
                });
                (WelcomeKind::ReturningUser, stats)
            };
            let name = if user.full_name.trim().is_empty() {
                &user.username
            } else {
                &user.full_name
            };
            let message = compose_welcome(address, name, kind, &stats, &self.base_url);
            dispatch_welcome(&self.pool, self.mailer.clone(), message);
        }

        Ok(Registration { user, created })
    }

    async fn user(&self, receipt_number: &str) -> Result<User, AppError> {
        self.repo
            .user_by_receipt(receipt_number)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".into()))
    }

    async fn devices(&self, user_id: i64) -> Result<Vec<DeviceRecord>, AppError> {
        let key = keys::user_devices(user_id);
        if let Some(CachedValue::Devices(devices)) = self.cache.get(&key) {
            return Ok(devices);
        }

        let devices = self.repo.devices_for_user(user_id).await?;
        self.cache.set(key, CachedValue::Devices(devices.clone()));
        Ok(devices)
    }

    async fn owned_device(&self, user: &User, device_id: i64) -> Result<DeviceRecord, AppError> {
        self.repo
            .device_for_user(device_id, user.id)
            .await?
            .ok_or_else(|| AppError::NotFound("Device not found".into()))
    }

    fn invalidate_user_views(&self, user: &User) {
        // Exact keys: a substring sweep on `devices_user_1` would also hit
        // `devices_user_10`.
        let dropped = [
            keys::user_devices(user.id),
            keys::user_energy(&user.receipt_number),
            keys::dashboard(&user.receipt_number),
        ]
        .iter()
        .filter(|key| self.cache.remove(key))
        .count();
        tracing::debug!("Dropped {} cached views for user {}", dropped, user.id);
    }

    fn invalidate_device_views(&self, device_id: i64) {
        self.cache.remove(&keys::device_energy(device_id));
        self.cache.remove(&keys::device_detail(device_id));
    }

    // ---- Reads ----

    /// Current snapshot of every plug the user owns. Always succeeds for a
    /// known user; unreachable plugs show up degraded.
    pub async fn energy_data(&self, receipt_number: &str) -> Result<Vec<DeviceSnapshot>, AppError> {
        let key = keys::user_energy(receipt_number);
        if let Some(CachedValue::Snapshots(snapshots)) = self.cache.get(&key) {
            return Ok(snapshots);
        }

        let user = self.user(receipt_number).await?;
        let devices = self.devices(user.id).await?;
        let snapshots = self.poller.poll_all(Some(user.id), &devices).await;

        self.cache.set(key, CachedValue::Snapshots(snapshots.clone()));
        Ok(snapshots)
    }

    pub async fn dashboard(&self, receipt_number: &str) -> Result<Dashboard, AppError> {
        let key = keys::dashboard(receipt_number);
        if let Some(CachedValue::Dashboard(dashboard)) = self.cache.get(&key) {
            return Ok(*dashboard);
        }

        let user = self.user(receipt_number).await?;
        let devices = self.energy_data(receipt_number).await?;
        let total = total_consumption(&devices);
        let consumption_data = ConsumptionHistory::load(&self.repo, user.id, Utc::now()).await?;

        let dashboard = Dashboard {
            total_cost: total_cost(total),
            recommendations: recommendations(total, &devices),
            total_consumption: total,
            devices,
            consumption_data,
        };

        self.cache.set(key, CachedValue::Dashboard(Box::new(dashboard.clone())));
        Ok(dashboard)
    }

    /// Device record with its recent samples, estimated daily consumption
    /// and search snippets. The estimate and snippets are looked up
    /// concurrently, each under its own timeout.
    pub async fn device_detail(
        &self,
        receipt_number: &str,
        device_id: i64,
    ) -> Result<DeviceDetail, AppError> {
        let user = self.user(receipt_number).await?;
        let device = self.owned_device(&user, device_id).await?;

        let key = keys::device_detail(device.id);
        if let Some(CachedValue::DeviceDetail(detail)) = self.cache.get(&key) {
            return Ok(*detail);
        }

        let history = self.repo.recent_samples(device.id, DETAIL_HISTORY_LEN).await?;
        let (estimate, snippets) = tokio::join!(
            self.estimates.resolve(&device.name),
            self.estimates.snippets(&device.name)
        );

        let detail = DeviceDetail {
            device,
            estimate,
            snippets,
            history,
        };
        self.cache.set(key, CachedValue::DeviceDetail(Box::new(detail.clone())));
        Ok(detail)
    }

    /// Instantaneous draw of one plug in kWh, 3 decimals. Bypasses the cache.
    pub async fn live_consumption(&self, device_id: i64) -> Result<f64, AppError> {
        let device = self
            .repo
            .device_by_id(device_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Device not found".into()))?;

        let watts = self.poller.read_live(&device).await.map_err(|err| {
            AppError::Network(format!("Device {} unreachable: {}", device.id, err))
        })?;
        Ok(round_to(watts / 1000.0, 3))
    }

    // ---- Writes ----

    pub async fn add_device(
        &self,
        receipt_number: &str,
        name: &str,
        ip_address: &str,
    ) -> Result<AddedDevice, AppError> {
        let name = name.trim();
        let ip_address = ip_address.trim();
        if name.is_empty() || ip_address.is_empty() {
            return Err(AppError::Validation("Name and IP address are required.".into()));
        }
        if !is_valid_ipv4(ip_address) {
            return Err(AppError::Validation("Invalid IP address.".into()));
        }

        let user = self.user(receipt_number).await?;
        let id = self.repo.insert_device(user.id, name, ip_address).await?;
        self.invalidate_user_views(&user);
        tracing::info!("User {} registered plug {} at {}", user.id, id, ip_address);

        let estimate = self
            .estimates
            .resolve_within(name, ADD_DEVICE_ESTIMATE_BUDGET)
            .await;
        let message = match estimate.daily_kwh {
            Some(kwh) => format!(
                "Device added. Estimated consumption: {} kWh/day (source: {}).",
                kwh,
                estimate.source.label()
            ),
            None => "Device added.".to_string(),
        };

        Ok(AddedDevice {
            id,
            message,
            estimate,
        })
    }

    pub async fn delete_device(&self, receipt_number: &str, device_id: i64) -> Result<(), AppError> {
        let user = self.user(receipt_number).await?;
        if !self.repo.delete_device(device_id, user.id).await? {
            return Err(AppError::NotFound("Device not found".into()));
        }

        self.invalidate_user_views(&user);
        self.invalidate_device_views(device_id);
        tracing::info!("User {} removed plug {}", user.id, device_id);
        Ok(())
    }

    /// Switch a plug. Unlike polling, a device failure here is reported.
    pub async fn set_device_power(
        &self,
        receipt_number: &str,
        device_id: i64,
        action: PowerAction,
    ) -> Result<String, AppError> {
        let user = self.user(receipt_number).await?;
        let device = self.owned_device(&user, device_id).await?;

        self.poller
            .set_power(&device, action == PowerAction::On)
            .await
            .map_err(|err| {
                tracing::error!("Failed to switch plug {}: {}", device.id, err);
                AppError::Network(format!("Could not reach device {}", device.id))
            })?;

        self.invalidate_user_views(&user);
        self.invalidate_device_views(device.id);

        Ok(match action {
            PowerAction::On => format!("Device {} switched on", device.id),
            PowerAction::Off => format!("Device {} switched off", device.id),
        })
    }
}
