mod api;
mod bus;
mod config;
mod dispatcher;
mod integrations;
mod pim;
mod registry;
mod relay;
mod schema;
mod services;
mod state;
mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use api::AppState;
use config::Config;
use integrations::upb::UpbIntegration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,upb_bridge=debug")),
        )
        .init();

    tracing::info!("Starting upb-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    let app_state = Arc::new(AppState::new());

    let upb = UpbIntegration::setup(app_state.clone(), &config.upb)?;
    let attached = upb.join_platforms().await;
    tracing::info!(entities = attached, "UPB integration ready");

    // Build combined router: REST API + WebSocket
    let app = api::router(app_state.clone())
        .merge(websocket::router(app_state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    upb.shutdown().await;
    Ok(())
}
