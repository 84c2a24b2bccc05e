//! # Custom Middleware
//!
//! Request tracing comes from `tracing-actix-web`; this module adds the
//! per-endpoint counters behind `/api/v1/metrics`.

pub mod metrics;

pub use metrics::MetricsMiddleware;
