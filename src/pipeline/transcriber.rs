//! # Subprocess Speech-to-Text
//!
//! Runs a whisper.cpp style command line per utterance:
//!
//! ```text
//! <binary> -m <model> <args...> -f <work_dir>/utterance-<uuid>.wav
//! ```
//!
//! The WAV goes to a uniquely named temp file, the trimmed stdout is the
//! transcript, and the file is removed whether or not the run succeeded.

use super::SpeechToText;
use crate::audio::wav::WavHeader;
use crate::config::TranscriberConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::process::Command;
use uuid::Uuid;

/// Speech-to-text through an external binary.
#[derive(Debug, Clone)]
pub struct WhisperCli {
    binary: String,
    model: String,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl WhisperCli {
    pub fn new(config: &TranscriberConfig) -> Self {
        let work_dir = if config.work_dir.trim().is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&config.work_dir)
        };

        Self {
            binary: config.binary.clone(),
            model: config.model.clone(),
            args: config.args.clone(),
            work_dir,
        }
    }

    fn command_args(&self, wav_path: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + 4);
        if !self.model.is_empty() {
            args.push("-m".to_string());
            args.push(self.model.clone());
        }
        args.extend(self.args.iter().cloned());
        args.push("-f".to_string());
        args.push(wav_path.to_string());
        args
    }

    async fn run(&self, wav_path: &Path) -> Result<String> {
        let path = wav_path.to_string_lossy();
        let output = Command::new(&self.binary)
            .args(self.command_args(&path))
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to launch transcriber {}", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "Transcriber exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SpeechToText for WhisperCli {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        let started = Instant::now();
        let header = WavHeader::parse(&wav).ok();
        let audio_secs = header.as_ref().map(WavHeader::duration_secs).unwrap_or_default();
        if let Some(header) = header.as_ref().filter(|h| h.audio_format != 1 || h.channels != 1) {
            tracing::warn!(
                audio_format = header.audio_format,
                channels = header.channels,
                "Transcriber input is not mono PCM"
            );
        }

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.work_dir.display()))?;
        let wav_path = self.work_dir.join(format!("utterance-{}.wav", Uuid::new_v4()));
        tokio::fs::write(&wav_path, &wav)
            .await
            .with_context(|| format!("Failed to write {}", wav_path.display()))?;

        let result = self.run(&wav_path).await;

        if let Err(e) = tokio::fs::remove_file(&wav_path).await {
            tracing::warn!(path = %wav_path.display(), error = %e, "Failed to remove temp WAV");
        }

        let transcript = result?;
        tracing::info!(
            audio_secs,
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = transcript.len(),
            "Transcription finished"
        );
        Ok(transcript)
    }
}
