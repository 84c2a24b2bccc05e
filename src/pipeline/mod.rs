//! # AI Pipeline Module
//!
//! Turns one consolidated caller utterance into a spoken reply:
//! speech-to-text → chat completion → text-to-speech, with the codec chain on
//! either side.
//!
//! ## Key Components:
//! - **Collaborator traits**: `SpeechToText`, `ChatCompletion`, `TextToSpeech`, `ContactLookup`
//! - **Voice Pipeline**: runs one utterance through the three collaborators
//! - **Implementations**: whisper-style subprocess, OpenAI-compatible chat,
//!   HTTP speech synthesizer, TOML contact directory
//! - **Transcript store**: writes each finished stream's conversation to disk
//!
//! The collaborators are trait objects so the relay can run against stubs in
//! tests and against real services in production without the protocol layer
//! knowing the difference.

pub mod chat;           // OpenAI-compatible streaming chat client
pub mod contacts;       // Phone number → greeting directory
pub mod engine;         // Utterance → reply orchestration
pub mod speech;         // HTTP text-to-speech client
pub mod transcriber;    // Subprocess speech-to-text
pub mod transcripts;    // Conversation persistence

pub use engine::{PipelineStats, VoicePipeline};

use crate::audio::AudioSettings;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Who said a line of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// One prior exchange handed to the chat model as context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Speaker,
    pub content: String,
}

/// A consolidated utterance waiting for a reply.
#[derive(Debug, Clone)]
pub struct UtteranceJob {
    /// Stream generation when the utterance was cut; replies for older generations are dropped
    pub generation: u64,
    pub stream_id: String,
    pub peer: Option<String>,
    /// μ-law bytes at the wire rate, in chunk order
    pub audio: Vec<u8>,
    pub history: Vec<ChatTurn>,
    /// Codec settings captured when the connection was accepted
    pub settings: AudioSettings,
}

/// What the pipeline produced for one utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub transcript: String,
    pub reply: String,
    /// μ-law bytes at the wire rate; empty when there was nothing to say
    pub audio: Vec<u8>,
}

/// Raw synthesizer output.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedSpeech {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Speech-to-text collaborator.
///
/// Whatever text comes back is passed on untouched, including empty strings and
/// silence markers such as `[BLANK_AUDIO]`.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String>;
}

/// Chat completion collaborator.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn reply(&self, history: &[ChatTurn], user_text: &str) -> Result<String>;
}

/// Text-to-speech collaborator.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedSpeech>;
}

/// Looks up the greeting played when a stream starts.
pub trait ContactLookup: Send + Sync {
    /// Base64 μ-law greeting for a normalized phone number.
    fn greeting_for(&self, phone: &str) -> Option<String>;
}
