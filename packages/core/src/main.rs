use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;

use enervirgil::api::{self, AppState};
use enervirgil::cache::AppCache;
use enervirgil::cli::Cli;
use enervirgil::config::Config;
use enervirgil::db::create_pool;
use enervirgil::device::HttpPlugConnector;
use enervirgil::error::AppError;
use enervirgil::estimate::EstimateResolver;
use enervirgil::logging::init_logging;
use enervirgil::mail::{HttpMailer, LogMailer, Mailer};
use enervirgil::metrics::AppMetrics;
use enervirgil::poller::DevicePoller;
use enervirgil::pool::WorkerPool;
use enervirgil::repository::EnergyRepository;
use enervirgil::scheduler::run_sampling;
use enervirgil::search::{DisabledSearch, GoogleSearchClient, SearchProvider};
use enervirgil::services::EnergyService;

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();

    if let Err(err) = run().await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let config = cli.apply(Config::from_env().map_err(AppError::Config)?);
    tracing::info!("Service starting with config: {:?}", config);

    let db = create_pool(&config.database_url)
        .await
        .map_err(|err| AppError::Database(err.to_string()))?;
    let repo = EnergyRepository::new(db);

    let metrics = Arc::new(AppMetrics::new().map_err(|err| AppError::Config(err.to_string()))?);
    let cache = Arc::new(AppCache::new(Duration::from_secs(config.cache_ttl_seconds)));
    let workers = WorkerPool::new(config.worker_pool_size).with_metrics(metrics.clone());

    let poller = DevicePoller::new(
        Arc::new(HttpPlugConnector::new(config.plug_gateway_port)),
        cache.clone(),
        workers.clone(),
        Arc::new(repo.clone()),
    )
    .with_timeouts(
        Duration::from_secs(config.device_timeout_seconds),
        Duration::from_secs(config.poll_deadline_seconds),
    )
    .with_metrics(metrics.clone());

    let search: Arc<dyn SearchProvider> = match config.search_credentials() {
        Some((key, cx)) => Arc::new(GoogleSearchClient::new(key, cx)),
        None => {
            tracing::warn!("GOOGLE_API_KEY / GOOGLE_CX not set, external estimates disabled");
            Arc::new(DisabledSearch)
        }
    };
    let estimates = Arc::new(
        EstimateResolver::new(cache.clone(), workers.clone(), search).with_metrics(metrics.clone()),
    );

    let mailer: Arc<dyn Mailer> = match &config.mail_relay_url {
        Some(url) => Arc::new(HttpMailer::new(url.clone(), config.mail_sender.clone())),
        None => Arc::new(LogMailer),
    };

    let service = EnergyService::new(
        repo.clone(),
        cache.clone(),
        poller.clone(),
        estimates,
        workers,
        mailer,
        config.base_url.clone(),
    );

    tokio::spawn(run_sampling(
        repo,
        poller,
        cache.clone(),
        Some(metrics.clone()),
        config.sample_interval_seconds,
    ));

    let app = api::router(AppState {
        service,
        cache,
        metrics,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|err| AppError::Network(format!("cannot bind {}: {}", config.bind_addr, err)))?;
    tracing::info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received. Stopping server.");
        })
        .await
        .map_err(|err| AppError::Network(err.to_string()))?;

    Ok(())
}
