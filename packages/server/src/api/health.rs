// ABOUTME: Health endpoint reporting engine availability and breaker state
// ABOUTME: Answers 503 when neither engine can take work

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde_json::{json, Value};

use super::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let report = state.gateway.health().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if report.healthy { "healthy" } else { "unavailable" },
            "timestamp": Utc::now().timestamp(),
            "version": env!("CARGO_PKG_VERSION"),
            "service": "codegate",
            "engines": report.engines,
            "blockedIdentities": report.blocked_identities,
        })),
    )
}
