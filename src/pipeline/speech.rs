//! # HTTP Text-to-Speech Client
//!
//! Posts `{"text": ..., "voice": ...}` to a synthesizer and expects a WAV file
//! back. Any bit depth, channel count or sample rate is accepted; the audio is
//! down-mixed to mono floats here and resampled to the wire rate later.

use super::{SynthesizedSpeech, TextToSpeech};
use crate::audio::wav;
use crate::config::SpeechConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    voice: &'a str,
}

/// Text-to-speech over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSpeech {
    client: reqwest::Client,
    endpoint: String,
    voice: String,
}

impl HttpSpeech {
    pub fn new(config: &SpeechConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build speech HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            voice: config.voice.clone(),
        })
    }
}

#[async_trait]
impl TextToSpeech for HttpSpeech {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedSpeech> {
        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SpeechRequest {
                text,
                voice: &self.voice,
            })
            .send()
            .await
            .context("Speech request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Speech endpoint returned HTTP {}: {}", status, body));
        }

        let bytes = response.bytes().await.context("Failed to read speech audio")?;
        let decoded = wav::read_wav(&bytes).context("Speech endpoint did not return WAV audio")?;
        if decoded.sample_rate == 0 {
            return Err(anyhow!("Speech audio declares a sample rate of 0"));
        }

        tracing::info!(
            chars = text.len(),
            samples = decoded.samples.len(),
            sample_rate = decoded.sample_rate,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Speech synthesized"
        );

        Ok(SynthesizedSpeech {
            samples: decoded.samples,
            sample_rate: decoded.sample_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::create_wav_from_pcm;
    use actix_web::{web, App, HttpResponse, HttpServer};

    #[actix_web::test]
    async fn test_synthesize_decodes_wav_reply() {
        let server = HttpServer::new(|| {
            App::new().route(
                "/tts",
                web::post().to(|body: web::Json<serde_json::Value>| async move {
                    assert_eq!(body["voice"], "test-voice");
                    let samples = vec![1000i16; body["text"].as_str().unwrap_or_default().len() * 10];
                    HttpResponse::Ok()
                        .content_type("audio/wav")
                        .body(create_wav_from_pcm(&samples, 22050))
                }),
            )
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let handle = server.run();
        let server_handle = handle.handle();
        actix_web::rt::spawn(handle);

        let speech = HttpSpeech::new(&SpeechConfig {
            endpoint: format!("http://{}/tts", addr),
            voice: "test-voice".to_string(),
            timeout_secs: 5,
        })
        .unwrap();

        let result = speech.synthesize("hello").await.unwrap();
        assert_eq!(result.sample_rate, 22050);
        assert_eq!(result.samples.len(), 50);

        server_handle.stop(false).await;
    }

    #[actix_web::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let speech = HttpSpeech::new(&SpeechConfig {
            endpoint: "http://127.0.0.1:1/tts".to_string(),
            voice: "x".to_string(),
            timeout_secs: 1,
        })
        .unwrap();
        assert!(speech.synthesize("hello").await.is_err());
    }
}
