use axum::{Extension, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time;

use crate::App;

/// Health check endpoint
pub async fn health_check(Extension(app): Extension<Arc<App>>) -> Json<Value> {
    let source_reachable = matches!(
        time::timeout(app.config.source_timeout(), app.source.latest_height()).await,
        Ok(Ok(_))
    );

    Json(json!({
        "status": "ok",
        "source_reachable": source_reachable,
        "indexer_running": app.indexer.is_running(),
        "subscribers": app.hub.client_count().await,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
