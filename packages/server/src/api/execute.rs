// ABOUTME: Execution and validate-only handlers
// ABOUTME: The peer address becomes the identity fallback; the result's error kind picks the status

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use codegate_gateway::{ErrorKind, ExecutionRequest, ExecutionResult, ValidationVerdict};
use std::net::SocketAddr;
use tracing::debug;

use super::AppState;
use crate::error::{ApiResult, AppError};

pub async fn execute(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload.map_err(|e| AppError::bad_request(e.body_text()))?;
    let request = request.with_client_addr(addr.ip());
    debug!(peer = %addr, tier = %request.tier, "Execution request received");

    // Detached so a client hanging up cannot cancel a run midway through its sandbox
    let gateway = state.gateway.clone();
    let result = tokio::spawn(async move { gateway.submit(request).await })
        .await
        .map_err(AppError::internal)?;
    Ok(result_response(result))
}

pub async fn validate(
    State(state): State<AppState>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> ApiResult<Json<ValidationVerdict>> {
    let Json(request) = payload.map_err(|e| AppError::bad_request(e.body_text()))?;
    let verdict = state.gateway.check(&request)?;
    Ok(Json(verdict))
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        // Runtime failures of the submitted code are still completed executions
        ErrorKind::None | ErrorKind::Timeout | ErrorKind::MemoryExceeded => StatusCode::OK,
        ErrorKind::ValidationFailed => StatusCode::BAD_REQUEST,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn result_response(result: ExecutionResult) -> Response {
    let status = status_for(result.error_kind);
    let retry_after = result.retry_after_ms.map(|ms| ms.div_ceil(1000).max(1));

    let mut response = (status, Json(result)).into_response();
    if let Some(seconds) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
    }
    response
}
