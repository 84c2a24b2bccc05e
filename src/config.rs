//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT` and `OPENAI_API_KEY` (deployment platform conventions)
//! 2. Environment variables (APP_SERVER__PORT, APP_PIPELINE__CHAT__MODEL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)

use crate::audio::AudioSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps onto one part of the relay (the HTTP listener, the codec
/// chain, the WebSocket sessions, the AI collaborators) so a `config.toml` reads
/// the same way the code is laid out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioSettings,
    pub session: SessionConfig,
    pub browser: BrowserConfig,
    pub pipeline: PipelineConfig,
    pub contacts: ContactsConfig,
    pub transcripts: TranscriptsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// WebSocket liveness settings.
///
/// A ping goes out every `heartbeat_interval_secs`; a peer that has sent nothing
/// (not even a pong) for `client_timeout_secs` is disconnected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Observer (browser) access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Shared secret browsers must present. Empty disables observer connections.
    pub token: String,
}

/// External AI collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub transcriber: TranscriberConfig,
    pub chat: ChatConfig,
    pub speech: SpeechConfig,
}

/// Speech-to-text subprocess (whisper.cpp style command line).
///
/// The binary is invoked as `binary -m <model> <args...> -f <wav file>` and its
/// trimmed stdout is taken as the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriberConfig {
    pub binary: String,
    pub model: String,
    pub args: Vec<String>,
    /// Directory for temporary WAV files. Empty means the system temp dir.
    pub work_dir: String,
}

/// OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

/// HTTP text-to-speech service returning WAV audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub endpoint: String,
    pub voice: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactsConfig {
    /// Path to the TOML contact directory. Empty means no greetings.
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptsConfig {
    pub directory: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,
            },
            audio: AudioSettings::default(),
            session: SessionConfig {
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            browser: BrowserConfig {
                token: String::new(),
            },
            pipeline: PipelineConfig {
                transcriber: TranscriberConfig {
                    binary: "whisper-cli".to_string(),
                    model: "models/ggml-base.en.bin".to_string(),
                    args: vec!["--no-timestamps".to_string(), "--language".to_string(), "en".to_string()],
                    work_dir: String::new(),
                },
                chat: ChatConfig {
                    endpoint: "https://api.openai.com/v1".to_string(),
                    model: "gpt-4o-mini".to_string(),
                    api_key: String::new(),
                    system_prompt: "You are a friendly voice assistant on a phone call. \
                                    Keep answers short and conversational."
                        .to_string(),
                    max_tokens: 256,
                    temperature: 0.7,
                    timeout_secs: 30,
                },
                speech: SpeechConfig {
                    endpoint: "http://127.0.0.1:5002/api/tts".to_string(),
                    voice: "default".to_string(),
                    timeout_secs: 30,
                },
            },
            contacts: ContactsConfig {
                file: String::new(),
            },
            transcripts: TranscriptsConfig {
                directory: "transcripts".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_AUDIO__NOISE_GATE=false`: Disable the noise gate
    /// - `APP_PIPELINE__CHAT__MODEL=gpt-4o`: Override the chat model
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    /// - `OPENAI_API_KEY=sk-...`: Chat completion credentials
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates nesting levels so field names can keep theirs
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("pipeline.chat.api_key", key)?;
        }

        let config = settings
            .build()?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Sample rates and the resampler half-width are non-zero
    /// - Heartbeat and collaborator timeouts are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.wire_sample_rate == 0 || self.audio.transcription_sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if self.audio.sinc_half_width == 0 {
            return Err(anyhow::anyhow!("Resampler half-width must be greater than 0"));
        }

        if self.session.heartbeat_interval_secs == 0 || self.session.client_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval and client timeout must be greater than 0"));
        }

        if self.session.client_timeout_secs <= self.session.heartbeat_interval_secs {
            return Err(anyhow::anyhow!("Client timeout must be longer than the heartbeat interval"));
        }

        if self.pipeline.chat.timeout_secs == 0 || self.pipeline.speech.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Collaborator timeouts must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the keys present in the JSON are changed, at any depth. For example
    /// `{"audio": {"noise_gate": false}}` leaves every other setting alone. The
    /// update is applied to a copy first, so an invalid result leaves `self` untouched.
    ///
    /// ## Secrets:
    /// The browser token and the chat API key come from the config file or the
    /// environment only. A masked value (as returned by `redacted`) is skipped, so
    /// a document fetched with GET can be edited and sent back whole; any other
    /// change to a secret is rejected.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let mut partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial_config.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }
        strip_masked_secrets(&mut partial_config);

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, partial_config);

        let candidate: AppConfig =
            serde_json::from_value(merged).context("Configuration update has the wrong shape")?;
        if candidate.browser.token != self.browser.token {
            return Err(anyhow::anyhow!("browser.token cannot be changed at runtime"));
        }
        if candidate.pipeline.chat.api_key != self.pipeline.chat.api_key {
            return Err(anyhow::anyhow!("pipeline.chat.api_key cannot be changed at runtime"));
        }
        candidate.validate()?;

        *self = candidate;
        Ok(())
    }

    /// Copy of the configuration with secrets blanked, for API responses.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.pipeline.chat.api_key.is_empty() {
            copy.pipeline.chat.api_key = REDACTED.to_string();
        }
        if !copy.browser.token.is_empty() {
            copy.browser.token = REDACTED.to_string();
        }
        copy
    }
}

/// Placeholder shown instead of a secret.
const REDACTED: &str = "********";

/// Drop secret fields whose value is the redaction placeholder.
fn strip_masked_secrets(patch: &mut serde_json::Value) {
    for (parent, field) in [("/browser", "token"), ("/pipeline/chat", "api_key")] {
        if let Some(map) = patch.pointer_mut(parent).and_then(|v| v.as_object_mut()) {
            if map.get(field).and_then(|v| v.as_str()) == Some(REDACTED) {
                map.remove(field);
            }
        }
    }
}

/// Recursively overlay `patch` onto `base`. Objects merge key by key; anything
/// else replaces the existing value.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}
