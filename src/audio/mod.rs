//! # Audio Codec Module
//!
//! Pure, stateless conversions between the telephony wire encoding and the
//! formats the speech collaborators work with.
//!
//! ## Key Components:
//! - **μ-law codec**: G.711 encode/decode between 8-bit μ-law and 16-bit PCM
//! - **Resampler**: windowed-sinc conversion and fixed 2× cubic upsampling
//! - **WAV framing**: canonical 44-byte header writer and a tolerant reader
//! - **Audio Processor**: noise gate plus the inbound/outbound conversion chains
//!
//! ## Audio Formats:
//! - **Wire**: μ-law, 8 kHz, mono, base64 inside JSON `media` events
//! - **Speech-to-text**: 16-bit PCM WAV, 16 kHz, mono
//! - **Text-to-speech**: float samples at whatever rate the synthesizer picks
//!
//! Nothing in here panics on bad input: empty or undersized buffers produce an
//! empty or minimal well-formed result and a warning in the log.

pub mod mulaw;        // G.711 μ-law codec
pub mod processor;    // Noise gate and conversion chains
pub mod resample;     // Sample rate conversion
pub mod wav;          // WAV container framing

pub use processor::{AudioProcessor, AudioSettings, MediaFormat};
