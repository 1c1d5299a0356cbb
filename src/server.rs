//! Accept loop
//!
//! Wires the hub, Message Store and token verifier together and spawns a
//! connection handler per accepted TCP stream.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::handler::handle_connection;
use crate::hub::HubHandle;
use crate::store::MessageStore;

/// Everything a connection handler needs
#[derive(Clone)]
pub struct ServerContext {
    pub hub: HubHandle,
    pub store: Arc<dyn MessageStore>,
    pub verifier: Arc<TokenVerifier>,
    pub config: Arc<Config>,
}

impl ServerContext {
    pub fn new(hub: HubHandle, store: Arc<dyn MessageStore>, config: Config) -> Self {
        Self {
            hub,
            store,
            verifier: Arc::new(TokenVerifier::new(&config.jwt_secret)),
            config: Arc::new(config),
        }
    }
}

/// Accept connections until `shutdown` resolves, then stop the hub
pub async fn serve(listener: TcpListener, ctx: ServerContext, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let ctx = ctx.clone();

                    // Spawn handler task for each connection
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, ctx).await {
                            error!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    ctx.hub.shutdown();
}
