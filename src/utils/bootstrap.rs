//! Bootstrap utilities for the pubsub binary.

use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, LOG_ENV_VAR};
use crate::handlers::RuleRouter;

/// Initialize tracing with PUBSUB_LOG environment variable.
///
/// Defaults to "info" level if PUBSUB_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Host application: the rule router in front of a 404 fallback.
pub fn app(rules: RuleRouter) -> axum::Router {
    rules
        .into_router(axum::Router::new())
        .layer(TraceLayer::new_for_http())
}

/// Serve `config` on `listener` until `shutdown` resolves.
///
/// Brokers are stopped before the listener drains, so long-polls still in
/// flight are released instead of holding graceful shutdown open.
pub async fn serve<F>(
    config: &Config,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let rules = RuleRouter::from_config(config);
    let app = app(rules.clone());

    info!(
        address = %listener.local_addr()?,
        rules = rules.rules().len(),
        "pubsub HTTP server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutdown requested, stopping brokers");
            rules.shutdown().await;
        })
        .await?;
    Ok(())
}
