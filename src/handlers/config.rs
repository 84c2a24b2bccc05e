//! # Runtime Configuration Endpoints
//!
//! - `GET /api/v1/config`: the live configuration with secrets masked
//! - `PUT /api/v1/config`: partial JSON update, validated before it is applied
//!
//! Audio and session settings are captured when a connection is accepted, so
//! an update affects the next call, never the one in progress.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Merge the request body into the current configuration.
///
/// ## Error Handling:
/// - A body that is not JSON is rejected by the `web::Json` extractor
/// - A merged result that fails validation → `400`, and nothing changes
/// - Changing the browser token or the chat API key → `400`
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(format!("{:#}", e)))?;

    state
        .update_config(updated.clone())
        .map_err(|e| AppError::ValidationError(e.to_string()))?;
    tracing::info!("Configuration updated at runtime");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated.redacted()
    })))
}
