//! # Voice Pipeline Engine
//!
//! Runs one consolidated utterance through the collaborators:
//!
//! 1. **Decode**: μ-law → 16 kHz WAV (upsample + noise gate)
//! 2. **Transcribe**: WAV → text, passed on unfiltered
//! 3. **Chat**: conversation so far + transcript → reply text
//! 4. **Synthesize**: reply text → float samples
//! 5. **Encode**: samples → μ-law at the wire rate
//!
//! Codec work is CPU-bound and goes through `spawn_blocking` so a long
//! utterance never stalls the connection actors sharing the runtime.

use super::{ChatCompletion, PipelineOutput, SpeechToText, TextToSpeech, UtteranceJob};
use crate::audio::AudioProcessor;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters shared by the pipeline and every primary connection.
#[derive(Debug, Default)]
pub struct PipelineStats {
    utterances_processed: AtomicU64,
    pipeline_failures: AtomicU64,
    stale_replies_discarded: AtomicU64,
    total_duration_ms: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`] for the metrics endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub utterances_processed: u64,
    pub pipeline_failures: u64,
    pub stale_replies_discarded: u64,
    pub average_duration_ms: f64,
}

impl PipelineStats {
    pub fn record_success(&self, duration_ms: u64) {
        self.utterances_processed.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.pipeline_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_replies_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        let processed = self.utterances_processed.load(Ordering::Relaxed);
        let total_ms = self.total_duration_ms.load(Ordering::Relaxed);
        PipelineStatsSnapshot {
            utterances_processed: processed,
            pipeline_failures: self.pipeline_failures.load(Ordering::Relaxed),
            stale_replies_discarded: self.stale_replies_discarded.load(Ordering::Relaxed),
            average_duration_ms: if processed > 0 {
                total_ms as f64 / processed as f64
            } else {
                0.0
            },
        }
    }
}

/// The three AI collaborators plus shared counters.
pub struct VoicePipeline {
    transcriber: Arc<dyn SpeechToText>,
    chat: Arc<dyn ChatCompletion>,
    speech: Arc<dyn TextToSpeech>,
    stats: Arc<PipelineStats>,
}

impl std::fmt::Debug for VoicePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoicePipeline")
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl VoicePipeline {
    pub fn new(
        transcriber: Arc<dyn SpeechToText>,
        chat: Arc<dyn ChatCompletion>,
        speech: Arc<dyn TextToSpeech>,
    ) -> Self {
        Self {
            transcriber,
            chat,
            speech,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Produce the spoken reply for one utterance.
    ///
    /// ## Error Handling:
    /// Any stage failing fails the whole run; the caller reports it on the wire
    /// and the stream carries on with the next utterance.
    pub async fn respond(&self, job: &UtteranceJob) -> Result<PipelineOutput> {
        let started = Instant::now();
        let result = self.run(job).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(output) => {
                self.stats.record_success(elapsed_ms);
                tracing::info!(
                    stream_id = %job.stream_id,
                    peer = job.peer.as_deref().unwrap_or("unknown"),
                    generation = job.generation,
                    elapsed_ms,
                    reply_bytes = output.audio.len(),
                    "Utterance processed"
                );
            }
            Err(e) => {
                self.stats.record_failure();
                tracing::error!(
                    stream_id = %job.stream_id,
                    peer = job.peer.as_deref().unwrap_or("unknown"),
                    generation = job.generation,
                    elapsed_ms,
                    error = %format!("{:#}", e),
                    "Utterance failed"
                );
            }
        }
        result
    }

    async fn run(&self, job: &UtteranceJob) -> Result<PipelineOutput> {
        if job.audio.is_empty() {
            return Err(anyhow!("Utterance has no audio"));
        }

        let processor = AudioProcessor::new(job.settings.clone());

        let inbound = processor.clone();
        let audio = job.audio.clone();
        let wav = tokio::task::spawn_blocking(move || inbound.wire_to_wav(&audio))
            .await
            .context("Audio decoding task failed")?;

        let transcript = self
            .transcriber
            .transcribe(wav)
            .await
            .context("Speech-to-text failed")?;
        tracing::debug!(stream_id = %job.stream_id, transcript = %transcript, "Caller said");

        let reply = self
            .chat
            .reply(&job.history, &transcript)
            .await
            .context("Chat completion failed")?;
        tracing::debug!(stream_id = %job.stream_id, reply = %reply, "Assistant replies");

        if reply.trim().is_empty() {
            return Ok(PipelineOutput {
                transcript,
                reply,
                audio: Vec::new(),
            });
        }

        let speech = self
            .speech
            .synthesize(&reply)
            .await
            .context("Text-to-speech failed")?;

        let audio = tokio::task::spawn_blocking(move || {
            processor.speech_to_wire(&speech.samples, speech.sample_rate)
        })
        .await
        .context("Audio encoding task failed")?;

        Ok(PipelineOutput {
            transcript,
            reply,
            audio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{mulaw, AudioSettings};
    use crate::pipeline::stubs::{EchoChat, FailingTranscriber, FixedTranscriber, ToneSpeech};
    use crate::pipeline::{ChatTurn, Speaker};

    fn job(audio: Vec<u8>) -> UtteranceJob {
        UtteranceJob {
            generation: 1,
            stream_id: "MZ1".to_string(),
            peer: None,
            audio,
            history: vec![ChatTurn {
                role: Speaker::User,
                content: "earlier".to_string(),
            }],
            settings: AudioSettings::default(),
        }
    }

    fn speech_like() -> Vec<u8> {
        let samples: Vec<i16> = (0..1600).map(|i| ((i as f32 * 0.25).sin() * 6000.0) as i16).collect();
        mulaw::encode(&samples)
    }

    #[actix_web::test]
    async fn test_full_run_produces_wire_audio() {
        let pipeline = VoicePipeline::new(
            Arc::new(FixedTranscriber("hello".to_string())),
            Arc::new(EchoChat),
            Arc::new(ToneSpeech(24000)),
        );

        let output = pipeline.respond(&job(speech_like())).await.unwrap();
        assert_eq!(output.transcript, "hello");
        assert_eq!(output.reply, "[1] you said: hello");
        // 2400 samples at 24 kHz → 800 μ-law bytes at 8 kHz
        assert_eq!(output.audio.len(), 800);

        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.utterances_processed, 1);
        assert_eq!(stats.pipeline_failures, 0);
    }

    #[actix_web::test]
    async fn test_silence_markers_pass_through() {
        let pipeline = VoicePipeline::new(
            Arc::new(FixedTranscriber("[BLANK_AUDIO]".to_string())),
            Arc::new(EchoChat),
            Arc::new(ToneSpeech(8000)),
        );
        let output = pipeline.respond(&job(speech_like())).await.unwrap();
        assert_eq!(output.transcript, "[BLANK_AUDIO]");
    }

    #[actix_web::test]
    async fn test_stage_failure_is_counted() {
        let pipeline = VoicePipeline::new(
            Arc::new(FailingTranscriber),
            Arc::new(EchoChat),
            Arc::new(ToneSpeech(8000)),
        );

        let error = pipeline.respond(&job(speech_like())).await.unwrap_err();
        assert!(format!("{:#}", error).contains("Speech-to-text failed"));
        assert_eq!(pipeline.stats().snapshot().pipeline_failures, 1);

        assert!(pipeline.respond(&job(Vec::new())).await.is_err());
        assert_eq!(pipeline.stats().snapshot().pipeline_failures, 2);
    }

    #[test]
    fn test_stats_average() {
        let stats = PipelineStats::default();
        assert_eq!(stats.snapshot().average_duration_ms, 0.0);
        stats.record_success(100);
        stats.record_success(300);
        stats.record_stale();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.utterances_processed, 2);
        assert_eq!(snapshot.average_duration_ms, 200.0);
        assert_eq!(snapshot.stale_replies_discarded, 1);
    }
}
