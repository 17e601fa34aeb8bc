use axum::{http::StatusCode, Extension, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::App;

/// Store totals, ingestion counters and subscriber count
pub async fn get_stats(
    Extension(app): Extension<Arc<App>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let store = app.db.get_stats().await.map_err(|e| {
        error!("Failed to load store stats: {:#}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Failed to load stats" })),
        )
    })?;

    Ok(Json(json!({
        "store": store,
        "ingestion": app.indexer.stats(),
        "subscribers": app.hub.client_count().await,
    })))
}
