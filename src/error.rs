//! # Error Handling
//!
//! HTTP-facing error type and its conversion into JSON responses.
//!
//! Errors on the WebSocket wire never come through here: once a connection is
//! upgraded, failures become `error` events carrying a numeric code (see
//! [`crate::protocol::ErrorCode`]) and the connection stays open. `AppError` only
//! covers the plain HTTP surface: health, metrics, configuration and the
//! upgrade handshake itself.
//!
//! ## Key Rust Concepts:
//! - **From trait**: `?` converts library errors into `AppError` automatically
//! - **ResponseError trait**: actix-web turns any `AppError` into an HTTP response
//! - **Display trait**: Defines how errors are formatted in logs

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Something went wrong on our side (500)
    Internal(String),

    /// The request itself is malformed (400)
    BadRequest(String),

    /// The requested resource does not exist (404)
    NotFound(String),

    /// Configuration could not be loaded or applied (500)
    ConfigError(String),

    /// Input parsed but failed validation (400)
    ValidationError(String),

    /// Missing or wrong observer token (401)
    Unauthorized(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
        }
    }
}

impl AppError {
    /// Machine-readable error type used in the JSON body.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::Unauthorized(_) => "unauthorized",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::Unauthorized(msg) => msg,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_unauthorized_renders_json_body() {
        let error = AppError::Unauthorized("bad token".to_string());
        assert_eq!(error.status_code(), StatusCode::UNAUTHORIZED);

        let response = error.error_response();
        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "unauthorized");
        assert_eq!(value["error"]["message"], "bad token");
    }

    #[test]
    fn test_conversions_pick_the_right_variant() {
        let parse_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(AppError::from(parse_error), AppError::BadRequest(_)));

        let internal = AppError::from(anyhow::anyhow!("disk full"));
        assert_eq!(internal.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(internal.to_string(), "Internal error: disk full");
    }
}
