// src/server/main.rs
// Entry point for the chat relay server
use chat_relay::server::broker::{LocalPublisher, Publisher, RedisPublisher, RedisSubscriber};
use chat_relay::server::config::ServerConfig;
use chat_relay::server::database::Database;
use chat_relay::server::hub::SessionHub;
use chat_relay::server::presence::{PresenceOracle, PresenceRegistry, RedisPresence};
use chat_relay::server::relay::ChatRelay;
use chat_relay::server::websocket::{self, ChatGateway};
use std::sync::Arc;
use log::{info, error};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Configura logging
    std::env::set_var("RUST_LOG", &config.log_level);
    env_logger::init();

    let database = Arc::new(Database::connect(&config.database_url).await?);
    info!("🗄️ Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;
    info!("✅ Database migrations completed successfully");

    let hub = SessionHub::new(config.max_clients);

    // Redis when configured, otherwise a single instance fanning out in-process
    let (publisher, presence): (Arc<dyn Publisher>, Arc<dyn PresenceOracle>) = match &config.redis_url {
        Some(redis_url) => {
            info!("Using Redis broker at {}", redis_url);
            let publisher = RedisPublisher::new(redis_url).await?;
            let presence = RedisPresence::new(redis_url).await?;
            RedisSubscriber::spawn(redis_url.clone(), hub.clone());
            (Arc::new(publisher), Arc::new(presence))
        }
        None => {
            info!("REDIS_URL not set; running as a single instance");
            (Arc::new(LocalPublisher::new(hub.clone())), Arc::new(PresenceRegistry::new()))
        }
    };

    let relay = Arc::new(ChatRelay::new(
        database.clone(),
        database.clone(),
        database.clone(),
        presence.clone(),
        publisher,
        &config,
    ));
    let gateway = Arc::new(ChatGateway::new(relay, database.clone(), database.clone(), presence, hub));

    let ws_addr = config.ws_addr();
    tokio::select! {
        res = websocket::serve(&ws_addr, gateway) => {
            if let Err(e) = res {
                error!("WebSocket gateway stopped with error: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}
