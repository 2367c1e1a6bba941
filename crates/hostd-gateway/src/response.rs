//! Response envelopes and error mapping.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use hostd_common::api::{operation_url, with_project};
use hostd_common::HostdError;
use hostd_operations::Operation;
use serde::Serialize;
use serde_json::json;
use tracing::error;

/// `{type: "sync"}` envelope.
pub fn sync_response<T: Serialize>(metadata: T) -> Response {
    Json(json!({
        "type": "sync",
        "status": "Success",
        "status_code": 200,
        "metadata": metadata,
    }))
    .into_response()
}

/// Sync envelope carrying an `ETag` header.
pub fn sync_response_etag<T: Serialize>(metadata: T, etag: &str) -> Response {
    let mut response = sync_response(metadata);
    if let Ok(value) = HeaderValue::from_str(&format!("\"{etag}\"")) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response
}

/// 202 with the operation URL in `Location` and the operation view as
/// metadata.
pub fn operation_response(op: &Operation) -> Response {
    let url = with_project(operation_url(&op.id().to_string()), op.project());
    let body = json!({
        "type": "async",
        "status": "Operation created",
        "status_code": 100,
        "operation": url,
        "metadata": op.view(),
    });

    let mut response = (StatusCode::ACCEPTED, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&url) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    PreconditionFailed(String),
    Timeout(String),
    Internal(String),
}

impl From<HostdError> for AppError {
    fn from(err: HostdError) -> Self {
        let message = err.to_string();
        match err {
            HostdError::BadRequest(_) => AppError::BadRequest(message),
            HostdError::Forbidden(_) => AppError::Forbidden(message),
            HostdError::NotFound(_) => AppError::NotFound(message),
            HostdError::Conflict(_) => AppError::Conflict(message),
            HostdError::PreconditionFailed(_) => AppError::PreconditionFailed(message),
            HostdError::Timeout(_) => AppError::Timeout(message),
            HostdError::Internal(_) | HostdError::Io(_) | HostdError::Json(_) => {
                AppError::Internal(message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::PreconditionFailed(msg) => (StatusCode::PRECONDITION_FAILED, msg),
            AppError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            AppError::Internal(msg) => {
                error!("Request failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = json!({
            "type": "error",
            "error": message,
            "error_code": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}
