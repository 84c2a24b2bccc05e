//! # HTTP Request Handlers
//!
//! REST endpoints under `/api/v1`. The WebSocket endpoints live in
//! [`crate::websocket`] and the health routes in [`crate::health`].

pub mod config;

pub use self::config::*;

use crate::error::{AppError, AppResult};
use actix_web::{HttpRequest, HttpResponse};

/// Fallback for unknown routes, so clients get the same JSON error shape.
pub async fn not_found(req: HttpRequest) -> AppResult<HttpResponse> {
    Err(AppError::NotFound(format!("No route for {} {}", req.method(), req.path())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App};

    #[actix_web::test]
    async fn test_unknown_route_is_json_404() {
        let app = test::init_service(App::new().default_service(web::to(not_found))).await;
        let response = test::call_service(&app, test::TestRequest::get().uri("/nope").to_request()).await;
        assert_eq!(response.status(), 404);

        let body: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(body["error"]["type"], "not_found");
    }
}
