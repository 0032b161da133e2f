//! HTTP error mapping
//!
//! Pool errors surface to clients as JSON bodies `{"error", "kind"}`:
//! exhausted → 503, fatal creation failure → 502, configuration and store
//! failures → 500. Unknown pools are 404 and malformed calls 400.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unknown pool: {0}")]
    UnknownPool(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Pool(#[from] identity_pool::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::UnknownPool(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Pool(identity_pool::Error::Exhausted { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Pool(identity_pool::Error::Create(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Pool(identity_pool::Error::Config(_) | identity_pool::Error::Store(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::UnknownPool(_) => "unknown_pool",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Pool(identity_pool::Error::Exhausted { .. }) => "exhausted",
            ApiError::Pool(identity_pool::Error::Create(_)) => "create_failed",
            ApiError::Pool(identity_pool::Error::Config(_)) => "config",
            ApiError::Pool(identity_pool::Error::Store(_)) => "store",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, status = status.as_u16(), "request failed");
        }
        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            serde_json::json!({
                "error": self.to_string(),
                "kind": self.kind(),
            })
            .to_string(),
        )
            .into_response()
    }
}
