//! Cafe Duel Server
//!
//! Binds the WebSocket front end over an in-memory account store.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cafe_duel::{
    network::{GameServer, ServerConfig},
    settlement::MemoryUserStore,
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env()?;
    info!("Cafe Duel Server v{}", VERSION);
    info!(
        bind = %config.bind_addr,
        max_connections = config.max_connections,
        requests_per_second = config.requests_per_second,
        "Configuration loaded"
    );

    let store = Arc::new(MemoryUserStore::new());
    let server = Arc::new(GameServer::new(config, store));

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                signal_server.shutdown();
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}
