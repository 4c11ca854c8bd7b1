// ABOUTME: HTTP routes for the execution gateway
// ABOUTME: Shared handler state and router construction

pub mod execute;
pub mod health;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use codegate_gateway::Gateway;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::middleware::{create_panic_handler, flood_guard_middleware, FloodGuard};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

/// Execution routes sit behind the flood guard; health does not
pub fn create_router(state: AppState, guard: FloodGuard) -> Router {
    let guarded = Router::new()
        .route("/api/execute", post(execute::execute))
        .route("/api/validate", post(execute::validate))
        .layer(from_fn_with_state(guard, flood_guard_middleware));

    Router::new()
        .route("/api/health", get(health::health_check))
        .merge(guarded)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(create_panic_handler())
}
