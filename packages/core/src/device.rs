//! Smart plug collaborator.
//!
//! The core never talks to plug hardware directly. A [`PlugConnector`]
//! opens a lightweight [`PlugSession`] for a network address; the session
//! fetches a status snapshot on `refresh()` and exposes the last reading
//! through synchronous accessors.
//!
//! [`HttpPlugConnector`] reaches plugs through a local gateway speaking
//! JSON over HTTP:
//! - `GET  http://{ip}:{port}/status` -> `{"power": <watts>, "on": <bool>}`
//! - `POST http://{ip}:{port}/power`  <- `{"on": <bool>}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default gateway port on each plug.
pub const DEFAULT_GATEWAY_PORT: u16 = 80;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Protocol(String),
}

pub trait PlugConnector: Send + Sync {
    fn open(&self, ip_address: &str) -> Box<dyn PlugSession>;
}

#[async_trait]
pub trait PlugSession: Send {
    /// Fetch a fresh status snapshot from the device.
    async fn refresh(&mut self) -> Result<(), DeviceError>;

    /// Instantaneous draw in watts from the last refresh.
    fn power_watts(&self) -> f64;

    /// Relay state from the last refresh.
    fn is_on(&self) -> bool;

    async fn set_on(&mut self, on: bool) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PlugStatus {
    #[serde(alias = "power_w", default)]
    power: f64,
    #[serde(alias = "device_on", default)]
    on: bool,
}

#[derive(Debug, Serialize)]
struct PowerCommand {
    on: bool,
}

#[derive(Clone)]
pub struct HttpPlugConnector {
    http: Client,
    port: u16,
}

impl HttpPlugConnector {
    pub fn new(port: u16) -> Self {
        Self {
            http: Client::new(),
            port,
        }
    }
}

impl Default for HttpPlugConnector {
    fn default() -> Self {
        Self::new(DEFAULT_GATEWAY_PORT)
    }
}

impl PlugConnector for HttpPlugConnector {
    fn open(&self, ip_address: &str) -> Box<dyn PlugSession> {
        Box::new(HttpPlugSession {
            base_url: format!("http://{}:{}", ip_address, self.port),
            http: self.http.clone(),
            status: PlugStatus::default(),
        })
    }
}

struct HttpPlugSession {
    base_url: String,
    http: Client,
    status: PlugStatus,
}

#[async_trait]
impl PlugSession for HttpPlugSession {
    async fn refresh(&mut self) -> Result<(), DeviceError> {
        let url = format!("{}/status", self.base_url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| DeviceError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(DeviceError::Transport(format!(
                "plug returned HTTP {}",
                response.status()
            )));
        }

        self.status = response
            .json::<PlugStatus>()
            .await
            .map_err(|err| DeviceError::Protocol(err.to_string()))?;

        Ok(())
    }

    fn power_watts(&self) -> f64 {
        self.status.power
    }

    fn is_on(&self) -> bool {
        self.status.on
    }

    async fn set_on(&mut self, on: bool) -> Result<(), DeviceError> {
        let url = format!("{}/power", self.base_url);

        let response = self
            .http
            .post(&url)
            .json(&PowerCommand { on })
            .send()
            .await
            .map_err(|err| DeviceError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(DeviceError::Transport(format!(
                "plug returned HTTP {}",
                response.status()
            )));
        }

        self.status.on = on;
        Ok(())
    }
}
