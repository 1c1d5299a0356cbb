//! Chat fan-out hub - Entry Point
//!
//! Loads configuration, starts the Hub actor and accepts connections until
//! Ctrl-C.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chat_hub::{serve, Config, Hub, InMemoryStore, ServerContext};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::from_env()?;

    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_hub=trace
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_hub=info"));
    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Command line bind address overrides the environment
    if let Some(addr) = env::args().nth(1) {
        config.bind_addr = addr;
    }

    let store = match &config.seed_file {
        Some(path) => {
            info!("Seeding chats from {}", path.display());
            InMemoryStore::from_seed_file(path)?
        }
        None => {
            warn!("No HUB_SEED_FILE set; no chat accepts connections");
            InMemoryStore::new()
        }
    };

    // Start TCP listener
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Chat hub listening on {}", config.bind_addr);

    // Create Hub actor and start
    let (hub, handle) = Hub::new(config.channel_capacity);
    let hub_task = tokio::spawn(hub.run());

    info!("Hub actor started");

    let ctx = ServerContext::new(handle, Arc::new(store), config);
    serve(listener, ctx, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await;

    hub_task.await?;
    info!("Chat hub stopped");

    Ok(())
}
