use anyhow::{Context, Result};
use log::{error, info};
use std::env;
use std::sync::Arc;

use reactbot::bot::ChatBot;
use reactbot::config::ConfigManager;
use reactbot::overlay::OverlayServer;
use reactbot::platforms::twitch::{TwitchConfig, TwitchConnection};
use reactbot::storage::FileStorage;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    info!("reactbot v{} starting with config '{config_path}'", reactbot::VERSION);

    // A config that fails to load at startup is fatal; only reloads fall
    // back to the previous snapshot.
    let config = Arc::new(
        ConfigManager::load(&config_path)
            .await
            .context("initial configuration load failed")?,
    );
    let snapshot = config.snapshot().await;

    let storage = Arc::new(FileStorage::new(&snapshot.data_dir));

    let overlay = if snapshot.feature_enabled("webserver") {
        let port = snapshot.overlay.as_ref().map(|o| o.port).unwrap_or(8888);
        let server = Arc::new(OverlayServer::new(port));
        server.start().await.context("overlay server failed to start")?;
        Some(server)
    } else {
        None
    };

    let twitch_config = TwitchConfig::from_bot_config(&snapshot)?;
    let connection = Box::new(TwitchConnection::new(twitch_config));

    let mut bot = ChatBot::new(config, connection, storage, overlay);
    let mut shutdown_rx = bot.subscribe_shutdown();
    let mut degraded_rx = bot.subscribe_degraded();

    if let Err(e) = bot.start().await {
        error!("bot failed to start: {e:#}");
        return Err(e);
    }

    let mut degraded = false;
    tokio::select! {
        _ = shutdown_rx.recv() => info!("shutdown command received"),
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = degraded_rx.recv() => {
            error!("platform message stream died, shutting down");
            bot.notify_degraded().await;
            degraded = true;
        }
    }

    bot.shutdown().await;
    if degraded {
        anyhow::bail!("platform message stream died");
    }
    Ok(())
}
