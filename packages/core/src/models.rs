//! Domain types shared by the cache, the poller and the API layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::report::{ConsumptionHistory, Recommendation};

/// Error tag carried by snapshots whose device did not answer in time.
pub const TIMEOUT_TAG: &str = "timeout";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub full_name: String,
    pub email: Option<String>,
    pub receipt_number: String,
    pub created_at: String,
}

/// A registered smart plug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub ip_address: String,
    pub created_at: String,
}

/// Point-in-time reading of one device.
///
/// `consumption` is the instantaneous draw expressed in kWh (watts / 1000),
/// rounded to two decimals. A snapshot with `error` set is a fallback:
/// consumption is zero and status is off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: i64,
    pub name: String,
    pub consumption: f64,
    pub status: bool,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceSnapshot {
    pub fn reading(device: &DeviceRecord, watts: f64, is_on: bool) -> Self {
        Self {
            id: device.id,
            name: device.name.clone(),
            consumption: round_to(watts / 1000.0, 2),
            status: is_on,
            ip_address: device.ip_address.clone(),
            error: None,
        }
    }

    /// Basic record used whenever a device could not be read.
    pub fn degraded(device: &DeviceRecord, tag: impl Into<String>) -> Self {
        Self {
            id: device.id,
            name: device.name.clone(),
            consumption: 0.0,
            status: false,
            ip_address: device.ip_address.clone(),
            error: Some(tag.into()),
        }
    }

    pub fn timed_out(device: &DeviceRecord) -> Self {
        Self::degraded(device, TIMEOUT_TAG)
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// Append-only consumption fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionSample {
    pub user_id: i64,
    pub device_id: i64,
    pub consumption_kwh: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    LocalTable,
    ExternalLookup,
    NotFound,
}

impl EstimateSource {
    pub fn label(&self) -> &'static str {
        match self {
            EstimateSource::LocalTable => "local table",
            EstimateSource::ExternalLookup => "external lookup",
            EstimateSource::NotFound => "not found",
        }
    }
}

/// Estimated daily consumption for a device name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionEstimate {
    pub device_name: String,
    pub daily_kwh: Option<f64>,
    pub source: EstimateSource,
}

impl ConsumptionEstimate {
    pub fn not_found(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            daily_kwh: None,
            source: EstimateSource::NotFound,
        }
    }
}

/// One search result as shown on the device detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSnippet {
    pub title: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDetail {
    pub device: DeviceRecord,
    pub estimate: ConsumptionEstimate,
    pub snippets: Vec<SearchSnippet>,
    pub history: Vec<ConsumptionSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
    pub devices: Vec<DeviceSnapshot>,
    pub total_consumption: f64,
    pub total_cost: f64,
    pub recommendations: Vec<Recommendation>,
    pub consumption_data: ConsumptionHistory,
}

/// Everything the service keeps in the shared cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Devices(Vec<DeviceRecord>),
    Snapshot(DeviceSnapshot),
    Snapshots(Vec<DeviceSnapshot>),
    Estimate(ConsumptionEstimate),
    Snippets(Vec<SearchSnippet>),
    DeviceDetail(Box<DeviceDetail>),
    Dashboard(Box<Dashboard>),
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceRecord {
        DeviceRecord {
            id: 1,
            user_id: 1,
            name: "Refrigeradora".to_string(),
            ip_address: "192.168.1.20".to_string(),
            created_at: "2026-01-01 10:00:00".to_string(),
        }
    }

    #[test]
    fn reading_converts_watts_to_kwh() {
        let snapshot = DeviceSnapshot::reading(&device(), 150.0, true);
        assert_eq!(snapshot.consumption, 0.15);
        assert!(snapshot.status);
        assert!(!snapshot.is_degraded());
    }

    #[test]
    fn timed_out_snapshot_is_zeroed_and_tagged() {
        let snapshot = DeviceSnapshot::timed_out(&device());
        assert_eq!(snapshot.consumption, 0.0);
        assert!(!snapshot.status);
        assert_eq!(snapshot.error.as_deref(), Some(TIMEOUT_TAG));
        assert_eq!(snapshot.ip_address, "192.168.1.20");
    }

    #[test]
    fn error_field_is_omitted_when_absent() {
        let json = serde_json::to_value(DeviceSnapshot::reading(&device(), 0.0, false)).unwrap();
        assert!(json.get("error").is_none());
    }

    #[test]
    fn round_to_two_decimals() {
        assert_eq!(round_to(0.1549, 2), 0.15);
        assert_eq!(round_to(1.23456, 3), 1.235);
    }
}
