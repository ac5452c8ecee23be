use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;

pub const PROMPTDESK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `GET /health`
pub async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// `GET /status`
pub async fn status_handler(State(app_state): AppState) -> Json<Value> {
    Json(json!({
        "version": PROMPTDESK_VERSION,
        "free_limit": app_state.quota_gate.free_limit(),
        "model": app_state.config.completion.model,
    }))
}
