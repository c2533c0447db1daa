//! Request-level errors and their HTTP rendering
//!
//! Library errors are converted to responses here and nowhere else. Bodies
//! use the `{"detail": ...}` shape chat clients of this API expect.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid JSON body")]
    InvalidJson,

    #[error("missing or unknown caller key")]
    Unauthorized,

    #[error("gateway is disabled")]
    GatewayDisabled,

    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Chat(#[from] chat_session::Error),

    #[error(transparent)]
    Pool(#[from] token_pool::Error),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidJson | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::GatewayDisabled => StatusCode::NOT_FOUND,
            ApiError::Chat(e) => {
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Pool(token_pool::Error::PoolExhausted(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Pool(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn detail(&self) -> Value {
        match self {
            ApiError::InvalidJson => json!({"error": "Invalid JSON body"}),
            ApiError::Unauthorized => json!("Unauthorized"),
            ApiError::GatewayDisabled => json!("Gateway is disabled"),
            ApiError::Chat(chat_session::Error::Server(_)) | ApiError::Pool(token_pool::Error::Store(_)) => {
                json!("Server error")
            }
            // Exhaustion messages are already structured JSON with pool counts
            ApiError::Chat(chat_session::Error::PoolExhausted(msg))
            | ApiError::Pool(token_pool::Error::PoolExhausted(msg)) => {
                serde_json::from_str(msg).unwrap_or_else(|_| json!(msg))
            }
            ApiError::Chat(chat_session::Error::Validation(msg)) | ApiError::BadRequest(msg) => {
                json!(msg)
            }
            other => json!(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %self, status = status.as_u16(), "request failed");
        }
        (status, Json(json!({"detail": self.detail()}))).into_response()
    }
}
