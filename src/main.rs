use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use sync_hub::{
    cli::{self, Cli, Commands},
    config::Config,
    coordinator::{router, SyncState},
    registry::ConnectionRegistry,
    store::{RedisStore, SyncStore},
    sweeper::Sweeper,
};

#[tokio::main]
async fn main() {
    // Default to INFO if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let args = Cli::parse();

    if let Some(Commands::Probe {
        url,
        tenant,
        connector,
        heartbeat,
    }) = args.command
    {
        if let Err(e) = cli::run_probe(url, tenant, connector, heartbeat).await {
            error!("probe error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("starting sync-hub coordinator on port {}", config.port);
    info!("redis URL: {}", config.redis_url);
    info!(
        "heartbeat timeout: {}s, sweep interval: {}s",
        config.heartbeat_timeout_secs, config.sweep_interval_secs
    );

    let store: Arc<dyn SyncStore> = match RedisStore::connect(&config.redis_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to connect to redis: {}", e);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(ConnectionRegistry::new());
    let state = SyncState {
        registry: registry.clone(),
        store: store.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Sweeper::new(
        registry,
        store,
        Duration::from_secs(config.heartbeat_timeout_secs),
        Duration::from_secs(config.sweep_interval_secs),
    )
    .spawn(shutdown_rx);

    let app = router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    info!("sync-hub listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("failed to start server");

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
