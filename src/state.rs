//! # Application State Management
//!
//! Everything the HTTP handlers and the WebSocket actors share lives here:
//! runtime configuration, request metrics, the connection registry and the
//! AI pipeline with its collaborators.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Every worker thread gets its own clone of `AppState`; the clones all point
//!   at the same registry, pipeline and metrics
//! - Data is freed when the last clone is dropped
//!
//! ### RwLock (Reader-Writer Lock)
//! - Many readers OR one writer at a time
//! - `parking_lot::RwLock` never poisons, so reads and writes hand back the
//!   guard directly instead of a `Result`
//!
//! ### Trait objects (`Arc<dyn ContactLookup>`)
//! - The state holds *something that can look up contacts*, not a concrete type
//! - Tests swap in in-memory stubs through [`AppState::with_components`]

use crate::config::AppConfig;
use crate::pipeline::chat::OpenAiChat;
use crate::pipeline::contacts::ContactDirectory;
use crate::pipeline::engine::PipelineStatsSnapshot;
use crate::pipeline::speech::HttpSpeech;
use crate::pipeline::transcriber::WhisperCli;
use crate::pipeline::transcripts::TranscriptStore;
use crate::pipeline::{ContactLookup, VoicePipeline};
use crate::stream::ConnectionManager;
use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The state shared by every request handler and connection actor.
///
/// ## Thread Safety Pattern:
/// - Mutable data (`config`, `metrics`) sits behind `Arc<RwLock<T>>`
/// - Components with their own interior locking (`registry`, `pipeline`) are
///   shared with a plain `Arc`
/// - `start_time` never changes and is `Copy`
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and connection counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Who is connected: the single primary and the observers
    pub registry: Arc<ConnectionManager>,

    /// Speech-to-text → chat → text-to-speech
    pub pipeline: Arc<VoicePipeline>,

    /// Caller greetings, loaded once at startup
    pub contacts: Arc<dyn ContactLookup>,

    /// Where finished conversations are written
    pub transcripts: Arc<TranscriptStore>,

    /// When the server started
    pub start_time: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("registry", &self.registry)
            .field("pipeline", &self.pipeline)
            .field("transcripts", &self.transcripts.directory())
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

/// Counters collected across HTTP requests and WebSocket connections.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: HTTP load and reliability
/// - **websocket_upgrades**: connections accepted on either endpoint
/// - **refused_primaries**: telephony connections turned away because a call
///   was already in progress
/// - **endpoint_metrics**: per-route latency
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub websocket_upgrades: u64,
    pub refused_primaries: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Latency and error totals for one `METHOD /path`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Read-only copy of all counters, safe to serialize after the locks are gone.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub error_count: u64,
    pub websocket_upgrades: u64,
    pub refused_primaries: u64,
    pub active_primaries: usize,
    pub active_observers: usize,
    pub pipeline: PipelineStatsSnapshot,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

impl AppState {
    /// Build the state and the real collaborators from configuration.
    ///
    /// ## What this does:
    /// 1. Creates the HTTP clients for chat and speech (fails on a bad TLS setup)
    /// 2. Loads and pre-encodes the contact directory
    /// 3. Wires the subprocess transcriber into the pipeline
    pub fn new(config: AppConfig) -> Result<Self> {
        let transcriber = Arc::new(WhisperCli::new(&config.pipeline.transcriber));
        let chat = Arc::new(OpenAiChat::new(&config.pipeline.chat)?);
        let speech = Arc::new(HttpSpeech::new(&config.pipeline.speech)?);
        let contacts = Arc::new(ContactDirectory::load(&config.contacts.file, &config.audio)?);
        let transcripts = Arc::new(TranscriptStore::new(&config.transcripts.directory));

        let pipeline = Arc::new(VoicePipeline::new(transcriber, chat, speech));
        Ok(Self::with_components(config, pipeline, contacts, transcripts))
    }

    /// Assemble the state around already-built components.
    pub fn with_components(
        config: AppConfig,
        pipeline: Arc<VoicePipeline>,
        contacts: Arc<dyn ContactLookup>,
        transcripts: Arc<TranscriptStore>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry: Arc::new(ConnectionManager::default()),
            pipeline,
            contacts,
            transcripts,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration.
    ///
    /// The read lock is held only for the clone, so a slow caller never blocks
    /// a concurrent `PUT /api/v1/config`.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<()> {
        new_config.validate()?;
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    pub fn record_websocket_upgrade(&self) {
        self.metrics.write().websocket_upgrades += 1;
    }

    pub fn record_refused_primary(&self) {
        self.metrics.write().refused_primaries += 1;
    }

    /// Add one request to the per-endpoint totals.
    ///
    /// ## Rust Concepts:
    /// - **entry().or_default()**: insert a zeroed metric the first time an
    ///   endpoint is seen, then update it in place
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        metric.request_count += 1;
        metric.total_duration_ms += duration_ms;
        if is_error {
            metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        let metrics = self.metrics.read();
        MetricsSnapshot {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            websocket_upgrades: metrics.websocket_upgrades,
            refused_primaries: metrics.refused_primaries,
            active_primaries: usize::from(self.registry.has_primary()),
            active_observers: self.registry.observer_count(),
            pipeline: self.pipeline.stats().snapshot(),
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
