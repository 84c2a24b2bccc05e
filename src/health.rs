//! # Health and Metrics Endpoints
//!
//! - `GET /health` and `GET /api/v1/health`: liveness plus headline counters
//! - `GET /api/v1/metrics`: per-endpoint latency, connection and pipeline totals
//!
//! ## Rust Concepts:
//! - **web::Data<AppState>**: actix hands every handler a cheap clone of the
//!   shared state
//! - **json! macro**: builds a `serde_json::Value` with JSON-like syntax

use crate::state::{AppState, MetricsSnapshot};
use actix_web::{web, HttpResponse};
use serde_json::json;

fn error_rate(metrics: &MetricsSnapshot) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

/// Basic health check.
///
/// Always `200 OK` while the process can serve requests. `call_in_progress`
/// tells a load balancer whether this relay is free for a new call.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "connections": {
            "call_in_progress": metrics.active_primaries > 0,
            "active_primaries": metrics.active_primaries,
            "active_observers": metrics.active_observers,
            "observers_enabled": !config.browser.token.is_empty()
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "utterances_processed": metrics.pipeline.utterances_processed,
            "pipeline_failures": metrics.pipeline.pipeline_failures,
            "stale_replies_discarded": metrics.pipeline.stale_replies_discarded
        },
        "memory": get_memory_info()
    }))
}

/// Detailed metrics for dashboards.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "connections": {
            "active_primaries": metrics.active_primaries,
            "active_observers": metrics.active_observers,
            "websocket_upgrades": metrics.websocket_upgrades,
            "refused_primaries": metrics.refused_primaries
        },
        "pipeline": metrics.pipeline,
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

/// Resident and virtual memory of this process, where the platform exposes it.
fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let field_bytes = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": field_bytes("VmRSS:"),
                "virtual_memory_bytes": field_bytes("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::test_support::stub_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_connections() {
        let state = stub_state(AppConfig::default());
        state.registry.reserve_primary("call-1");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"]["call_in_progress"], true);
        assert_eq!(body["connections"]["observers_enabled"], false);
        assert_eq!(body["metrics"]["utterances_processed"], 0);
    }

    #[actix_web::test]
    async fn test_metrics_lists_endpoints_and_pipeline() {
        let state = stub_state(AppConfig::default());
        state.record_endpoint_request("GET /health", 4, false);
        state.pipeline.stats().record_stale();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/api/v1/metrics").to_request()).await;
        assert_eq!(body["endpoints"][0]["endpoint"], "GET /health");
        assert_eq!(body["pipeline"]["stale_replies_discarded"], 1);
        assert_eq!(body["connections"]["refused_primaries"], 0);
    }
}
