pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::messages::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/messages", post(handlers::handle_submit))
        .route("/api/messages/:job_id", get(handlers::handle_status))
        .with_state(state)
}
