mod config;
mod core;
mod db;
mod errors;
mod metrics;
mod rpc;
mod server;
mod signals;
mod tags;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use prometheus_client::registry::Registry;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::core::normalize::Normalizer;
use crate::core::pipeline::PipelineOrchestrator;
use crate::core::poller::{BlockPoller, Services, StatusBoard};
use crate::db::persistence::SignalPersistence;
use crate::db::{SharedDatabase, StoreError};
use crate::errors::ErrorHandler;
use crate::metrics::Metrics;
use crate::rpc::connector::NodeConnector;
use crate::rpc::explorer::ExplorerClient;
use crate::rpc::{BitcoinRpc, BlockSource, RpcError};
use crate::server::AppState;
use crate::signals::ProcessorFactory;
use crate::tags::{EntityDirectory, EntityLoader};

#[derive(Debug, Error)]
enum StartupError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("rpc client: {0}")]
    Rpc(#[from] RpcError),
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("chainsignal=info".parse().unwrap()),
        )
        .init();

    tracing::info!("chainsignal starting...");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".into());
    let config = Config::load(&config_path);
    tracing::debug!("Config: {:?}", config);

    if let Err(e) = run(config).await {
        tracing::error!("Startup failed: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    let db = SharedDatabase::open(Path::new(&config.database.path))?;
    tracing::info!("Database opened at {}", config.database.path);

    // Seed the entity table if a seed file is configured
    if let Some(seed_path) = config.entities.seed_path.as_deref() {
        let seed_path = Path::new(seed_path);
        if seed_path.exists() {
            match db.seed_entities_from_file(seed_path) {
                Ok(count) => tracing::info!("Seeded {count} entities from {}", seed_path.display()),
                Err(e) => tracing::warn!("Failed to seed entities: {e}"),
            }
        }
    }

    let mut registry = Registry::default();
    let metrics = Arc::new(Metrics::register(&mut registry));
    let registry = Arc::new(registry);

    // Node access: bitcoind first, Esplora when it stays down
    let primary: Arc<dyn BlockSource> = Arc::new(BitcoinRpc::new(&config.bitcoin)?);
    let fallback: Option<Arc<dyn BlockSource>> = match config.bitcoin.fallback_url.as_deref() {
        Some(url) => Some(Arc::new(ExplorerClient::new(
            url,
            Duration::from_secs(config.bitcoin.request_timeout_secs),
        )?)),
        None => None,
    };
    let connector = Arc::new(NodeConnector::new(
        primary,
        fallback,
        config.bitcoin.max_failures,
        Duration::from_secs(config.bitcoin.fallback_min_dwell_secs),
        metrics.clone(),
    ));
    tracing::info!("Node connector configured for {}", config.bitcoin.network);

    let handler = Arc::new(ErrorHandler::new(&config.retry, metrics.clone()));
    let directory = Arc::new(EntityDirectory::new(metrics.clone()));
    match directory.refresh_with_retry(&db, &handler).await {
        Ok(count) => tracing::info!("Entity directory loaded with {count} entities"),
        Err(e) => tracing::warn!("Entity directory starts empty: {e}"),
    }

    let persistence = SignalPersistence::new(
        Arc::new(db.clone()),
        handler.clone(),
        config.persistence.batch_size,
    );
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        signals::default_processors(&config, directory.clone()),
        persistence,
        handler.clone(),
        config.pipeline.processor_timeout(),
    ));
    let processor_factory: ProcessorFactory = {
        let config = config.clone();
        let directory = directory.clone();
        Arc::new(move || signals::default_processors(&config, directory.clone()))
    };
    tracing::info!("Processors enabled: {:?}", orchestrator.enabled_processors());

    let services = Services {
        connector,
        normalizer: Normalizer::new(config.bitcoin.network()),
        orchestrator,
        processor_factory,
        directory: directory.clone(),
        db: db.clone(),
        handler: handler.clone(),
        status: Arc::new(StatusBoard::default()),
        metrics,
    };

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let loader: Arc<dyn EntityLoader> = Arc::new(db);
    tasks.push(directory.spawn_refresh(
        loader,
        handler,
        Duration::from_secs(config.entities.reload_interval_secs.max(1)),
        cancel.clone(),
    ));

    if config.server.enabled {
        let state = AppState {
            services: services.clone(),
            registry,
        };
        let bind = config.server.bind.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(&bind, state, cancel).await {
                tracing::error!("HTTP server failed: {e}");
            }
        }));
    }

    let poller = BlockPoller::new(&config.pipeline, services);
    tasks.push(tokio::spawn(poller.run(cancel.clone())));

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown requested"),
        Err(e) => tracing::error!("Failed to listen for ctrl-c, shutting down: {e}"),
    }
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!("Task ended abnormally: {e}");
        }
    }
    tracing::info!("chainsignal stopped");
    Ok(())
}
