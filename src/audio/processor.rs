//! # Audio Processing and Conversion
//!
//! Bridges the telephony wire format and the formats the AI collaborators speak.
//!
//! ## Inbound (caller → speech-to-text):
//! 1. **Decode**: μ-law bytes → 16-bit PCM at the wire rate
//! 2. **Upsample**: wire rate → transcription rate (cubic for the 2× case)
//! 3. **Noise gate**: attenuate the background hiss between words
//! 4. **Frame**: wrap in a canonical WAV container
//!
//! ## Outbound (text-to-speech → caller):
//! 1. **Resample**: synthesizer rate → wire rate (windowed sinc)
//! 2. **Quantize**: float → 16-bit PCM
//! 3. **Encode**: PCM → μ-law bytes

use crate::audio::{mulaw, resample, wav};
use serde::{Deserialize, Serialize};

/// Buffers shorter than this skip the noise gate entirely.
const NOISE_GATE_MIN_SAMPLES: usize = 100;

/// Longest analysis window used to estimate the noise floor.
const NOISE_ANALYSIS_MAX_SAMPLES: usize = 4000;

/// Threshold never drops below this amplitude.
const NOISE_THRESHOLD_FLOOR: f64 = 150.0;

/// Threshold sits this far above the measured RMS.
const NOISE_THRESHOLD_RMS_FACTOR: f64 = 1.8;

const MIN_ATTENUATION: f64 = 0.1;
const MAX_ATTENUATION: f64 = 0.7;

const ATTACK_MS: u32 = 10;
const RELEASE_MS: u32 = 50;

/// Largest share of the previous output kept at the start of each transition.
const ATTACK_SMOOTHING: f64 = 0.3;
const RELEASE_SMOOTHING: f64 = 0.7;

/// Audio format settings shared by the codec pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Sample rate of the μ-law stream on the wire (8000 for telephony)
    pub wire_sample_rate: u32,

    /// Sample rate handed to speech-to-text
    pub transcription_sample_rate: u32,

    /// Half-width of the windowed-sinc resampler, in source samples
    pub sinc_half_width: usize,

    /// Whether to run the noise gate before transcription
    pub noise_gate: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            wire_sample_rate: 8000,
            transcription_sample_rate: 16000,
            sinc_half_width: resample::DEFAULT_HALF_WIDTH,
            noise_gate: true,
        }
    }
}

/// Media format declared by the telephony peer in its `start` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub encoding: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    pub channels: u8,
}

impl Default for MediaFormat {
    fn default() -> Self {
        Self {
            encoding: "audio/x-mulaw".to_string(),
            sample_rate: 8000,
            channels: 1,
        }
    }
}

/// Audio processing and conversion utilities.
///
/// ## Purpose:
/// Holds the audio settings for one pipeline and exposes the two directions of
/// conversion. All methods are pure; they never fail, degrading to empty output
/// (with a warning) when handed nothing to work on.
#[derive(Debug, Clone)]
pub struct AudioProcessor {
    settings: AudioSettings,
}

impl AudioProcessor {
    /// Create a new audio processor with the given settings.
    pub fn new(settings: AudioSettings) -> Self {
        Self { settings }
    }

    /// Check a declared media format against what the codec pipeline handles.
    ///
    /// ## Returns:
    /// - **Ok(())**: μ-law, mono, at the configured wire rate
    /// - **Err(String)**: Description of the mismatch
    pub fn validate_media_format(&self, format: &MediaFormat) -> Result<(), String> {
        let encoding = format.encoding.to_ascii_lowercase();
        if !(encoding.contains("mulaw") || encoding.contains("ulaw") || encoding.contains("pcmu")) {
            return Err(format!("Unsupported encoding: {}", format.encoding));
        }

        if format.sample_rate != self.settings.wire_sample_rate {
            return Err(format!(
                "Sample rate mismatch: expected {}, got {}",
                self.settings.wire_sample_rate, format.sample_rate
            ));
        }

        if format.channels != 1 {
            return Err(format!("Channel count mismatch: expected 1, got {}", format.channels));
        }

        Ok(())
    }

    /// Turn a consolidated μ-law utterance into a WAV file for speech-to-text.
    pub fn wire_to_wav(&self, mulaw_bytes: &[u8]) -> Vec<u8> {
        let pcm = mulaw::decode(mulaw_bytes);
        let target_rate = self.settings.transcription_sample_rate;
        let wire_rate = self.settings.wire_sample_rate;

        let upsampled = if pcm.is_empty() || target_rate == wire_rate {
            pcm
        } else if target_rate == wire_rate * 2 {
            resample::upsample_2x(&pcm)
        } else {
            let floats = pcm_to_float(&pcm);
            float_to_pcm(&resample::resample(
                &floats,
                wire_rate,
                target_rate,
                self.settings.sinc_half_width,
            ))
        };

        let cleaned = if self.settings.noise_gate {
            reduce_noise(&upsampled, target_rate)
        } else {
            upsampled
        };

        wav::create_wav_from_pcm(&cleaned, target_rate)
    }

    /// Turn synthesized speech into μ-law bytes at the wire rate.
    pub fn speech_to_wire(&self, samples: &[f32], sample_rate: u32) -> Vec<u8> {
        let resampled = resample::resample(
            samples,
            sample_rate,
            self.settings.wire_sample_rate,
            self.settings.sinc_half_width,
        );
        mulaw::encode(&float_to_pcm(&resampled))
    }
}

/// Adaptive noise gate.
///
/// ## Method:
/// 1. Estimate the noise floor from the RMS of the opening stretch of audio
/// 2. Derive a threshold of `max(150, RMS × 1.8)`
/// 3. Scale samples below the threshold by 0.1-0.7 depending on how close they are
/// 4. Smooth the edges of each open/close transition against the previous output,
///    using a 10 ms attack and a 50 ms release
pub fn reduce_noise(samples: &[i16], sample_rate: u32) -> Vec<i16> {
    if samples.len() < NOISE_GATE_MIN_SAMPLES {
        return samples.to_vec();
    }

    let window = NOISE_ANALYSIS_MAX_SAMPLES.min(samples.len() / 5).max(1);
    let analysis = &samples[..window];
    let sum_squares: f64 = analysis.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_squares / window as f64).sqrt();
    let peak = analysis.iter().map(|&s| (s as i32).abs()).max().unwrap_or(0);
    let threshold = NOISE_THRESHOLD_FLOOR.max(rms * NOISE_THRESHOLD_RMS_FACTOR);

    let attack_len = ((sample_rate * ATTACK_MS) / 1000).max(1) as usize;
    let release_len = ((sample_rate * RELEASE_MS) / 1000).max(1) as usize;

    tracing::debug!(rms, peak, threshold, attack_len, release_len, "Noise gate calibrated");

    let mut output = Vec::with_capacity(samples.len());
    let mut gate_open = false;
    let mut countdown = 0usize;
    let mut transition_len = 1usize;
    let mut smoothing = 0.0f64;
    let mut previous = 0.0f64;

    for (i, &sample) in samples.iter().enumerate() {
        let value = sample as f64;
        let level = value.abs();
        let above = level >= threshold;

        if i > 0 && above != gate_open {
            if above {
                transition_len = attack_len;
                smoothing = ATTACK_SMOOTHING;
            } else {
                transition_len = release_len;
                smoothing = RELEASE_SMOOTHING;
            }
            countdown = transition_len;
        }
        gate_open = above;

        let target = if above {
            value
        } else {
            let attenuation = (MIN_ATTENUATION + (MAX_ATTENUATION - MIN_ATTENUATION) * (level / threshold))
                .clamp(MIN_ATTENUATION, MAX_ATTENUATION);
            value * attenuation
        };

        let shaped = if countdown > 0 {
            let keep = smoothing * (countdown as f64 / transition_len as f64);
            countdown -= 1;
            target * (1.0 - keep) + previous * keep
        } else {
            target
        };

        previous = shaped;
        output.push(shaped.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }

    output
}

/// Convert 16-bit PCM samples to floats in [-1.0, 1.0].
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Convert float samples back to 16-bit PCM, clamping out-of-range values.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let scaled = sample * 32768.0;
            scaled.clamp(-32768.0, 32767.0) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, amplitude: f64) -> Vec<i16> {
        (0..len)
            .map(|i| (amplitude * (i as f64 * 0.3).sin()) as i16)
            .collect()
    }

    #[test]
    fn test_noise_gate_skips_short_buffers() {
        let input = tone(99, 40.0);
        assert_eq!(reduce_noise(&input, 16000), input);
    }

    #[test]
    fn test_noise_gate_attenuates_quiet_audio() {
        let input = tone(4000, 60.0);
        let output = reduce_noise(&input, 16000);
        assert_eq!(output.len(), input.len());

        let energy_in: i64 = input.iter().map(|&s| (s as i64).abs()).sum();
        let energy_out: i64 = output.iter().map(|&s| (s as i64).abs()).sum();
        assert!(energy_out < energy_in, "{} !< {}", energy_out, energy_in);
        assert!(energy_out * 20 >= energy_in, "gate attenuated far below its floor");
    }

    #[test]
    fn test_noise_gate_passes_loud_speech() {
        // Quiet lead-in sets a low floor; a sustained loud burst must come through untouched
        let mut input = tone(2000, 50.0);
        input.extend((0..8000).map(|i| if (i / 5) % 2 == 0 { 12000i16 } else { -12000 }));
        let output = reduce_noise(&input, 8000);

        assert_eq!(&output[3000..], &input[3000..]);
    }

    #[test]
    fn test_pcm_conversion() {
        let pcm_samples = vec![0i16, 16384, -16384, 32767, -32768];
        let float_samples = pcm_to_float(&pcm_samples);
        let converted_back = float_to_pcm(&float_samples);

        for (original, converted) in pcm_samples.iter().zip(converted_back.iter()) {
            let diff = (original - converted).abs();
            assert!(diff <= 1, "Conversion error too large: {} vs {}", original, converted);
        }
    }

    #[test]
    fn test_media_format_validation() {
        let processor = AudioProcessor::new(AudioSettings::default());
        let good = MediaFormat {
            encoding: "audio/x-mulaw".to_string(),
            sample_rate: 8000,
            channels: 1,
        };
        assert!(processor.validate_media_format(&good).is_ok());

        let wrong_rate = MediaFormat { sample_rate: 16000, ..good.clone() };
        assert!(processor.validate_media_format(&wrong_rate).is_err());

        let wrong_codec = MediaFormat { encoding: "audio/opus".to_string(), ..good };
        assert!(processor.validate_media_format(&wrong_codec).is_err());
    }

    #[test]
    fn test_wire_to_wav_doubles_sample_count() {
        let processor = AudioProcessor::new(AudioSettings {
            noise_gate: false,
            ..AudioSettings::default()
        });
        let mulaw_bytes = mulaw::encode(&tone(160, 8000.0));
        let wav_bytes = processor.wire_to_wav(&mulaw_bytes);

        let header = wav::WavHeader::parse(&wav_bytes).unwrap();
        assert_eq!(header.sample_rate, 16000);
        assert_eq!(header.data_len as usize, 160 * 2 * 2);
    }

    #[test]
    fn test_wire_to_wav_on_empty_input_is_minimal() {
        let processor = AudioProcessor::new(AudioSettings::default());
        assert_eq!(processor.wire_to_wav(&[]).len(), wav::WAV_HEADER_LEN);
    }

    #[test]
    fn test_speech_to_wire_resamples_to_wire_rate() {
        let processor = AudioProcessor::new(AudioSettings::default());
        let speech: Vec<f32> = (0..2400).map(|i| (i as f32 * 0.05).sin() * 0.3).collect();
        let wire = processor.speech_to_wire(&speech, 24000);
        assert_eq!(wire.len(), 800);
    }
}
