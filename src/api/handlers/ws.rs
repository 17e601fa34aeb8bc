use axum::{
    extract::ws::WebSocketUpgrade,
    response::IntoResponse,
    Extension,
};
use std::sync::Arc;

use crate::{hub::run_session, App};

/// Upgrade to a WebSocket subscribed to the broadcast hub
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(app): Extension<Arc<App>>,
) -> impl IntoResponse {
    let hub = app.hub.clone();
    ws.on_upgrade(move |socket| run_session(socket, hub))
}
