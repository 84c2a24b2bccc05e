//! # Metrics Middleware
//!
//! Counts every HTTP request and records its latency under `METHOD /route`.
//!
//! ## Route keys:
//! The key uses the matched route pattern rather than the raw path, so query
//! strings such as `/browser?token=…` never end up in the metrics table.
//! Requests that match no route share a single `unmatched` key.
//!
//! ## Rust Concepts:
//! - **Transform / Service**: actix's two-step middleware; `Transform` builds
//!   one `Service` per worker, `Service::call` runs per request
//! - **LocalBoxFuture**: a boxed future that does not need to be `Send`,
//!   which is all an actix worker requires

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::StatusCode,
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        let route = req.match_pattern().unwrap_or_else(|| "unmatched".to_string());
        let endpoint = format!("{} {}", req.method(), route);
        let state = req.app_data::<web::Data<AppState>>().cloned();

        if let Some(state) = &state {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let Some(state) = state else {
                return result;
            };

            let status = match &result {
                Ok(response) => response.status(),
                Err(e) => e.as_response_error().status_code(),
            };
            let is_error = status.is_client_error() || status.is_server_error();

            // An upgrade returns as soon as the handshake is done; the socket
            // lifetime is tracked by the connection counters instead.
            if status != StatusCode::SWITCHING_PROTOCOLS {
                state.record_endpoint_request(&endpoint, started.elapsed().as_millis() as u64, is_error);
            }
            if is_error {
                state.increment_error_count();
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::test_support::stub_state;
    use actix_web::{test, App, HttpResponse};

    #[actix_web::test]
    async fn test_requests_are_keyed_by_route_pattern() {
        let state = stub_state(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(MetricsMiddleware)
                .route("/calls/{id}", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/boom", web::get().to(|| async { HttpResponse::InternalServerError().finish() })),
        )
        .await;

        for uri in ["/calls/1?x=y", "/calls/2", "/boom", "/missing"] {
            test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        }

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 4);
        assert_eq!(snapshot.error_count, 2);
        assert_eq!(snapshot.endpoint_metrics["GET /calls/{id}"].request_count, 2);
        assert_eq!(snapshot.endpoint_metrics["GET /boom"].error_count, 1);
        assert_eq!(snapshot.endpoint_metrics["GET unmatched"].request_count, 1);
    }
}
