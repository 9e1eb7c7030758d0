use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
/// Returns service version, store reachability and queue depth.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let store = match state.jobs.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!("health check: store unreachable: {e}");
            "unreachable"
        }
    };
    let queue = state.jobs.stats().await;

    Json(json!({
        "status": if store == "ok" { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "service": "salesgen-api",
        "store": store,
        "queue": queue,
    }))
}
