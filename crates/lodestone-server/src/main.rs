use std::path::Path;
use std::sync::Arc;

use lodestone_protocol_v1_12::V1_12Adapter;
use lodestone_server::auth::{AuthPool, MojangSessionService};
use lodestone_server::event_loop::EventLoopGroup;
use lodestone_server::player::{run_keep_alive, PlayerList};
use lodestone_server::{ConnectionManager, OnlineMode, ServerConfig, ServerContext};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Lodestone server...");

    let config = Arc::new(ServerConfig::load(Path::new("config/server.toml"))?);
    info!(
        "Config loaded: bind={}:{}, max_players={}, online_mode={}, compression_threshold={}",
        config.bind, config.port, config.max_players, config.online_mode, config.compression_threshold
    );

    let auth = if config.online_mode == OnlineMode::False {
        None
    } else {
        let service = MojangSessionService::new(&config.session_server)?;
        Some(AuthPool::new(Arc::new(service), config.auth_workers)?)
    };

    let players = Arc::new(PlayerList::new());
    let ctx = Arc::new(ServerContext::new(
        config.clone(),
        &V1_12Adapter::new(),
        players.clone(),
        auth,
    )?);

    let loops = EventLoopGroup::new(config.transport, config.event_loop_threads())?;
    let manager = Arc::new(ConnectionManager::new(ctx, loops));

    // A bind failure aborts startup.
    let listener = manager.bind().await?;
    let sweeper = manager.start_sweeper()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let ctrlc_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
        let _ = ctrlc_tx.send(true);
    });

    tokio::select! {
        _ = run_keep_alive(players, shutdown_rx) => {
            info!("Shutting down");
        }
        _ = manager.clone().run(listener) => {
            error!("Accept loop exited unexpectedly");
        }
    }

    manager.shutdown();
    // Let the connection tasks flush their disconnect packets.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    sweeper.stop();
    info!("Server shut down cleanly");

    Ok(())
}
