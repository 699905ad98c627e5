use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::ws::handler as ws_handler;

const LIMITER_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// GET /health
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "instance_id": state.hub.instance_id(),
        "connections": state.hub.connection_count(),
    }))
}

/// Build the axum Router. Must be called inside a Tokio runtime.
pub fn build_router(state: AppState) -> Router {
    // Forget idle limiter keys so the maps track only recent clients.
    // Both purgers stop with the hub.
    for limiter in [&state.ip_limiter, &state.user_limiter] {
        tokio::spawn(
            limiter
                .clone()
                .run_purger(LIMITER_PURGE_INTERVAL, state.hub.child_token()),
        );
    }

    Router::new()
        .route("/ws", get(ws_handler::ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
}
