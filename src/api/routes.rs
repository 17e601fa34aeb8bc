use crate::App;
use axum::{
    routing::{get, Router},
    Extension,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use super::handlers::*;

/// Create the API router
pub fn create_router(app: Arc<App>) -> Router {
    info!("Setting up API routes");

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);

    let mev_routes = Router::new()
        .route("/block/:number", get(get_block_analysis))
        .route("/high-gas/:number", get(get_high_gas_outliers))
        .route("/sandwich/:number", get(get_sandwich_patterns))
        .route("/actors", get(get_repeated_actors))
        .route("/trends", get(get_mev_trends))
        .route("/stats", get(get_mev_stats));

    // API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .nest("/mev", mev_routes)
        .layer(cors);

    Router::new()
        .route("/ws", get(ws_handler))
        .nest("/api", api_routes)
        .layer(Extension(app))
        .layer(TraceLayer::new_for_http())
}

/// Start the API server; returns once the application shuts down
pub async fn start_server(app: Arc<App>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", app.config.api_port).parse()?;
    let shutdown = app.shutdown.clone();
    let router = create_router(app);

    info!("Starting API server on {}", addr);

    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("API server stopped");
    Ok(())
}
