use axum::{Json, body::Bytes, extract::State};
use tracing::info;

use crate::interfaces::web::AppState;

/// Characters of an event body written to the log.
const EVENT_LOG_LIMIT: usize = 2000;

pub async fn root() -> &'static str {
    "deal-batcher is up. Use POST /install to store portal credentials."
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "tokens_present": state.tokens_file.exists(),
    }))
}

/// Placeholder for portal push events: logged, acknowledged, ignored.
pub async fn event_handler(body: Bytes) -> Json<serde_json::Value> {
    let text = String::from_utf8_lossy(&body);
    let head: String = text.chars().take(EVENT_LOG_LIMIT).collect();
    info!("[handler] incoming: {}", head);
    Json(serde_json::json!({ "ok": true }))
}
