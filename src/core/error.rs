//! Error types and handling for the routing proxy.
//!
//! [`AppError`] is the single error type surfaced by HTTP handlers. It renders
//! the Anthropic error envelope so clients that already speak the messages API
//! can parse proxy-originated failures the same way as upstream ones.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// Client provided invalid data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A quota file failed to load or validate on reload.
    #[error("invalid quotas: {0}")]
    InvalidQuotas(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport failure talking to an upstream lane. The detail is logged but
    /// never echoed to the client.
    #[error("upstream error")]
    Upstream(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::InvalidQuotas(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) | AppError::InvalidQuotas(_) => "invalid_request_error",
            AppError::NotFound(_) => "not_found_error",
            AppError::Unavailable(_) => "overloaded_error",
            _ => "api_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_type = self.error_type();

        let message = match &self {
            AppError::Upstream(detail) => {
                tracing::warn!(error = %detail, "Upstream transport error");
                "upstream error".to_string()
            }
            AppError::Config(e) => {
                tracing::error!(error = %e, "Configuration error");
                e.to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                msg.clone()
            }
            AppError::BadRequest(msg) | AppError::NotFound(msg) | AppError::Unavailable(msg) => {
                msg.clone()
            }
            AppError::InvalidQuotas(_) => self.to_string(),
        };

        let body = Json(json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
