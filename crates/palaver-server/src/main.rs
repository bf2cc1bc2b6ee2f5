//! # palaver-server
//!
//! Composition root for the real-time messaging core.
//!
//! This binary provides:
//! - **REST API** (axum) for the messaging operations: conversations,
//!   participants, messages, reactions, read tracking
//! - **Call signal routing**: `POST /call/signal` forwarded to the
//!   counterpart's delivery channel
//! - **Operational call configuration** (`GET /call/config`) so clients
//!   fetch the STUN list instead of hard-coding it

mod api;
mod config;
mod error;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use palaver_messaging::{MessagingPolicy, MessagingService};
use palaver_net::DeliveryRegistry;
use palaver_store::MemoryStore;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,palaver_server=debug")),
        )
        .init();

    info!("Starting Palaver server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        instance = %config.instance_name,
        stun_servers = config.ice.stun_servers.len(),
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // One delivery channel per online user; shared by messaging fan-out and
    // call signal routing.
    let registry = Arc::new(DeliveryRegistry::new());

    // In-memory store; the relational backend is owned by another system
    // and plugged in through the same ConversationStore interface.
    let store = Arc::new(MemoryStore::new());

    let messaging = Arc::new(MessagingService::new(
        store,
        registry.clone(),
        MessagingPolicy::default(),
    ));

    let app_state = AppState {
        registry,
        messaging,
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
