//! longpoll-pubsub: HTTP long-poll publish/subscribe server
//!
//! Serves every configured rule on one listener. Publishers send
//! `category`/`body` form fields to a rule's publish path; subscribers
//! long-poll its subscribe path.
//!
//! ## Configuration
//! - First argument or PUBSUB_CONFIG: YAML configuration file
//! - PUBSUB__SERVER__PORT: listener port (default: 8080)
//! - PUBSUB_LOG: tracing filter (default: info)

use tokio::net::TcpListener;
use tracing::{error, info};

use longpoll_pubsub::config::Config;
use longpoll_pubsub::utils::bootstrap::{init_tracing, serve};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting longpoll-pubsub");

    let listener = TcpListener::bind(config.server.bind_address()).await?;
    serve(&config, listener, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await
}
