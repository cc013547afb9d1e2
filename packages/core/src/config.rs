use std::env;
use std::fmt;
use std::str::FromStr;

/// Runtime configuration, read from the environment (and `.env`).
/// Every setting has a default so the service starts with no env at all.
#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub base_url: String,
    pub cache_ttl_seconds: u64,
    pub worker_pool_size: usize,
    pub sample_interval_seconds: u64,
    pub device_timeout_seconds: u64,
    pub poll_deadline_seconds: u64,
    pub plug_gateway_port: u16,
    pub google_api_key: Option<String>,
    pub google_cx: Option<String>,
    pub mail_relay_url: Option<String>,
    pub mail_sender: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str, default: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let worker_pool_size: usize = parse_var(&lookup, "WORKER_POOL_SIZE", 4)?;
        if worker_pool_size == 0 {
            return Err("WORKER_POOL_SIZE must be at least 1".to_string());
        }

        Ok(Self {
            database_url: text("DATABASE_URL", "sqlite://enervirgil.db"),
            bind_addr: text("BIND_ADDR", "0.0.0.0:5000"),
            base_url: text("BASE_URL", "http://localhost:5000"),
            cache_ttl_seconds: parse_var(&lookup, "CACHE_TTL_SECONDS", 300)?,
            worker_pool_size,
            sample_interval_seconds: parse_var(&lookup, "SAMPLE_INTERVAL_SECONDS", 300)?,
            device_timeout_seconds: parse_var(&lookup, "DEVICE_TIMEOUT_SECONDS", 2)?,
            poll_deadline_seconds: parse_var(&lookup, "POLL_DEADLINE_SECONDS", 10)?,
            plug_gateway_port: parse_var(&lookup, "PLUG_GATEWAY_PORT", 80)?,
            google_api_key: optional("GOOGLE_API_KEY"),
            google_cx: optional("GOOGLE_CX"),
            mail_relay_url: optional("MAIL_RELAY_URL"),
            mail_sender: text("MAIL_SENDER", "no-reply@enervirgil.pe"),
        })
    }

    /// Search credentials, when both halves are configured.
    pub fn search_credentials(&self) -> Option<(String, String)> {
        match (&self.google_api_key, &self.google_cx) {
            (Some(key), Some(cx)) => Some((key.clone(), cx.clone())),
            _ => None,
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} must be a valid number", name)),
        _ => Ok(default),
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("bind_addr", &self.bind_addr)
            .field("base_url", &self.base_url)
            .field("cache_ttl_seconds", &self.cache_ttl_seconds)
            .field("worker_pool_size", &self.worker_pool_size)
            .field("sample_interval_seconds", &self.sample_interval_seconds)
            .field("device_timeout_seconds", &self.device_timeout_seconds)
            .field("poll_deadline_seconds", &self.poll_deadline_seconds)
            .field("plug_gateway_port", &self.plug_gateway_port)
            .field("search_enabled", &self.search_credentials().is_some())
            .field("mail_relay_url", &self.mail_relay_url)
            .field("mail_sender", &self.mail_sender)
            .finish()
    }
}
