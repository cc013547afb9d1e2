use clap::Parser;

use crate::config::Config;

/// EnerVirgil CLI arguments. Each flag overrides its environment variable.
#[derive(Debug, Parser)]
#[command(
    name = "enervirgil",
    version,
    about = "Home energy monitoring backend for smart plugs"
)]
pub struct Cli {
    /// SQLite connection URL
    #[arg(long)]
    pub database_url: Option<String>,

    /// Address the HTTP server listens on
    #[arg(long)]
    pub bind: Option<String>,

    /// Cache entry lifetime in seconds
    #[arg(long)]
    pub cache_ttl: Option<u64>,

    /// Background worker pool size
    #[arg(long)]
    pub workers: Option<usize>,

    /// Background sampling interval in seconds
    #[arg(long)]
    pub sample_interval: Option<u64>,
}

impl Cli {
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(url) = self.database_url {
            config.database_url = url;
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(ttl) = self.cache_ttl {
            config.cache_ttl_seconds = ttl;
        }
        if let Some(workers) = self.workers {
            config.worker_pool_size = workers.max(1);
        }
        if let Some(interval) = self.sample_interval {
            config.sample_interval_seconds = interval;
        }
        config
    }
}
