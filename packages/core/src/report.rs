//! Dashboard figures derived from device snapshots and the consumption
//! ledger: totals, cost, savings recommendations and chart series.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{round_to, DeviceSnapshot};
use crate::repository::{EnergyRepository, RepositoryError};

/// Tariff used for cost and savings figures, in PEN per kWh.
pub const COST_PER_KWH: f64 = 0.50;

/// Expected draw of an average device, in kWh.
const AVERAGE_DEVICE_KWH: f64 = 1.5;
const HIGH_USAGE_MARGIN: f64 = 1.2;
const PEAK_SHIFT_SAVINGS: f64 = 0.15;
const STANDBY_THRESHOLD_KWH: f64 = 0.05;
const STANDBY_SAVINGS: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    #[serde(rename = "Alta")]
    High,
    #[serde(rename = "Baja")]
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub text: String,
    pub category: String,
    pub priority: Priority,
}

impl Recommendation {
    fn new(text: String, category: &str, priority: Priority) -> Self {
        Self {
            text,
            category: category.to_string(),
            priority,
        }
    }
}

/// Sum of snapshot consumption, rounded to 2 decimals.
pub fn total_consumption(snapshots: &[DeviceSnapshot]) -> f64 {
    round_to(snapshots.iter().map(|s| s.consumption).sum(), 2)
}

pub fn total_cost(total_kwh: f64) -> f64 {
    round_to(total_kwh * COST_PER_KWH, 2)
}

/// Savings advice for the dashboard. Never empty.
pub fn recommendations(total_kwh: f64, snapshots: &[DeviceSnapshot]) -> Vec<Recommendation> {
    let mut advice = Vec::new();

    let expected = AVERAGE_DEVICE_KWH * snapshots.len() as f64 * HIGH_USAGE_MARGIN;
    if total_kwh > expected {
        let savings = round_to(total_kwh * PEAK_SHIFT_SAVINGS * COST_PER_KWH, 2);
        advice.push(Recommendation::new(
            format!(
                "Tu consumo total ({:.2} kWh) es alto. Reduce el uso durante horas pico (6-10 PM) para ahorrar {} PEN/mes.",
                total_kwh, savings
            ),
            "Consumo General",
            Priority::High,
        ));
    }

    for device in snapshots {
        if !device.status && device.consumption > STANDBY_THRESHOLD_KWH {
            let savings = round_to(device.consumption * STANDBY_SAVINGS * COST_PER_KWH, 2);
            advice.push(Recommendation::new(
                format!(
                    "El {} está en standby consumiendo {:.2} kWh. Desconéctalo para ahorrar {} PEN/mes.",
                    device.name, device.consumption, savings
                ),
                "Consumo en Standby",
                Priority::Low,
            ));
        }
    }

    if advice.is_empty() {
        advice.push(Recommendation::new(
            "Tu consumo está dentro de lo normal. Mantén buenas prácticas como apagar luces innecesarias."
                .to_string(),
            "General",
            Priority::Low,
        ));
    }

    advice
}

/// One chart series. `labels` and `data` run oldest to newest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub labels: Vec<String>,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionHistory {
    pub daily: Series,
    pub weekly: Series,
    pub monthly: Series,
}

fn midnight(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&at.date_naive().and_time(NaiveTime::MIN))
}

impl ConsumptionHistory {
    /// Build the chart series for `user_id` as of `now`:
    /// - daily: the last 7 calendar days, today included
    /// - weekly: 4 week-long windows ending at midnight 0 to 3 weeks ago
    /// - monthly: 12 windows of 30 days, labelled by month
    pub async fn load(
        repo: &EnergyRepository,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, RepositoryError> {
        let mut history = Self::default();

        for days_ago in (0..7).rev() {
            let day = now - Duration::days(days_ago);
            let start = midnight(day);
            let total = repo
                .sum_consumption_between(user_id, start, start + Duration::days(1))
                .await?;
            history.daily.labels.push(day.format("%Y-%m-%d").to_string());
            history.daily.data.push(round_to(total, 2));
        }

        for weeks_ago in (0..4).rev() {
            let start = midnight(now - Duration::days((weeks_ago + 1) * 7));
            let total = repo
                .sum_consumption_between(user_id, start, start + Duration::days(7))
                .await?;
            history.weekly.labels.push(format!("Semana {}", 4 - weeks_ago));
            history.weekly.data.push(round_to(total, 2));
        }

        for months_ago in (0..12).rev() {
            let start = midnight(now - Duration::days((months_ago + 1) * 30));
            let total = repo
                .sum_consumption_between(user_id, start, start + Duration::days(30))
                .await?;
            let label = (now - Duration::days(months_ago * 30)).format("%Y-%m").to_string();
            history.monthly.labels.push(label);
            history.monthly.data.push(round_to(total, 2));
        }

        Ok(history)
    }
}
