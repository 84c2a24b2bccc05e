//! # Voicebot Relay - Main Application Entry Point
//!
//! A WebSocket relay between a telephony media stream and an AI voice
//! pipeline. One primary call at a time streams μ-law audio in; each
//! utterance is transcribed, answered by a chat model, synthesized and
//! streamed back. Authenticated browsers can watch the call and inject audio.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the server, the collaborators and the signal handling are all async
//! - **actors**: each WebSocket connection is an actix actor with its own mailbox
//! - **Result<T, E>**: startup errors bubble up to `main` through `?`
//! - **Arc**: shared state handed to every worker thread
//!
//! ## Application Architecture:
//! - **config**: TOML files + environment variables
//! - **audio**: μ-law codec, resampling, noise gate, WAV
//! - **protocol**: wire events and the per-connection state machines
//! - **stream**: session state, chunk buffering, the connection registry
//! - **pipeline**: speech-to-text → chat → text-to-speech
//! - **websocket**: connection actors and the `/voicebot` and `/browser` endpoints
//! - **state / health / handlers / middleware / error**: the HTTP side

mod audio;       // Codec chain (audio/ directory)
mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // REST handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod pipeline;    // AI collaborators (pipeline/ directory)
mod protocol;    // Wire protocol (protocol/ directory)
mod state;       // Application state management (state.rs)
mod stream;      // Stream sessions and registry (stream/ directory)
mod websocket;   // WebSocket actors (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::config::AppConfig;
use crate::state::AppState;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.browser.token.is_empty() {
        info!("No browser token configured, observer connections are disabled");
    }

    let app_state = AppState::new(config.clone()).context("Failed to initialize the voice pipeline")?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs bottom-up on the way in
            .wrap(middleware::MetricsMiddleware)
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/voicebot", web::get().to(websocket::voicebot_websocket))
            .route("/browser", web::get().to(websocket::browser_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .default_service(web::to(handlers::not_found))
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Whichever finishes first: the server on its own (an error) or a signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voicebot_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on Unix.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        // Without a signal source there is nothing to wait for
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}
