//! Outgoing mail collaborator.
//!
//! Messages are handed to a [`Mailer`] through the worker pool so that a
//! slow relay never delays a response. Delivery failures are logged by the
//! pool and otherwise ignored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::pool::{TaskError, WorkerPool};
use crate::repository::UserStats;

/// Upper bound on one relay round trip.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail relay unreachable: {0}")]
    Transport(String),

    #[error("mail relay rejected message with HTTP {0}")]
    Rejected(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError>;
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

/// Posts messages as JSON to an HTTP mail relay.
#[derive(Clone)]
pub struct HttpMailer {
    relay_url: String,
    sender: String,
    http: Client,
}

impl HttpMailer {
    pub fn new(relay_url: String, sender: String) -> Self {
        Self::with_timeout(relay_url, sender, RELAY_TIMEOUT)
    }

    pub fn with_timeout(relay_url: String, sender: String, timeout: Duration) -> Self {
        Self {
            relay_url,
            sender,
            http: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        let response = self
            .http
            .post(&self.relay_url)
            .json(&RelayRequest {
                from: &self.sender,
                to: &message.to,
                subject: &message.subject,
                html: &message.html,
            })
            .send()
            .await
            .map_err(|err| MailError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(MailError::Rejected(response.status().as_u16()));
        }

        Ok(())
    }
}

/// Mailer used when no relay is configured. Only logs.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        tracing::info!("Mail relay not configured, skipping '{}' to {}", message.subject, message.to);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WelcomeKind {
    NewUser,
    ReturningUser,
}

/// Build the welcome message for a freshly registered or returning user.
pub fn compose_welcome(
    to: &str,
    name: &str,
    kind: WelcomeKind,
    stats: &UserStats,
    base_url: &str,
) -> MailMessage {
    let (subject, heading, intro, call_to_action) = match kind {
        WelcomeKind::NewUser => (
            "¡Bienvenido a EnerVirgil! Tu viaje hacia el ahorro energético comienza aquí",
            "¡Bienvenido a EnerVirgil!",
            "Nos emociona tenerte en EnerVirgil. Has dado el primer paso hacia un futuro más sostenible.",
            "Comenzar Ahora",
        ),
        WelcomeKind::ReturningUser => (
            "¡Bienvenido de vuelta a EnerVirgil! Continuemos ahorrando energía",
            "¡Bienvenido de vuelta!",
            "Nos alegra verte de vuelta en EnerVirgil. Continuemos optimizando tu consumo energético.",
            "Ir al Dashboard",
        ),
    };

    let html = format!(
        r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;">
  <h1>{heading}</h1>
  <h2>¡Hola {name}!</h2>
  <p>{intro}</p>
  <ul>
    <li>Días activo: {days}</li>
    <li>Dispositivos conectados: {devices}</li>
    <li>Consumo del último mes: {kwh:.2} kWh</li>
    <li>Ahorro estimado: {savings}%</li>
    <li>CO2 reducido: {co2} kg</li>
  </ul>
  <p><a href="{base_url}">{call_to_action}</a></p>
  <p>EnerVirgil - Tu aliado en el ahorro energético ({date})</p>
</div>"#,
        days = stats.days_active,
        devices = stats.connected_devices,
        kwh = stats.monthly_kwh,
        savings = stats.estimated_savings_pct,
        co2 = stats.co2_reduced_kg,
        date = Utc::now().format("%d/%m/%Y"),
    );

    MailMessage {
        to: to.to_string(),
        subject: subject.to_string(),
        html,
    }
}

/// Send `message` in the background. Returns immediately.
pub fn dispatch_welcome(pool: &WorkerPool, mailer: Arc<dyn Mailer>, message: MailMessage) {
    pool.fire_and_forget("welcome_mail", async move {
        mailer
            .send(&message)
            .await
            .map_err(|err| TaskError::Mail(err.to_string()))?;
        tracing::info!("Welcome mail sent to {}", message.to);
        Ok(())
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Mailer double that keeps every message it was asked to send.
    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<MailMessage>>,
    }

    impl RecordingMailer {
        pub fn subjects(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|m| m.subject.clone()).collect()
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }
}
