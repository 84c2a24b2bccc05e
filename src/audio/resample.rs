//! # Sample Rate Conversion
//!
//! Two converters live here:
//! - **`resample`**: arbitrary-ratio windowed-sinc conversion, used to bring
//!   text-to-speech output (typically 22.05 or 24 kHz) down to the 8 kHz wire rate.
//! - **`upsample_2x`**: fixed 8 kHz → 16 kHz conversion by cubic interpolation, used
//!   before handing caller audio to speech-to-text.
//!
//! ## Windowed Sinc:
//! Each output sample sits at a fractional source index `i × ratio`. Every input
//! sample within `half_width` of that index contributes
//! `sinc(π·cutoff·d) × blackman(d)`, with the cutoff placed at 90% of the target
//! Nyquist frequency. Weights are normalized by their sum so DC gain stays at 1.

use std::f64::consts::PI;

/// Fraction of the target Nyquist frequency kept by the low-pass filter.
const CUTOFF_FACTOR: f64 = 0.9;

/// Blackman window coefficients.
const BLACKMAN_A0: f64 = 0.42;
const BLACKMAN_A1: f64 = 0.5;
const BLACKMAN_A2: f64 = 0.08;

/// Default number of source samples considered on each side of the output position.
pub const DEFAULT_HALF_WIDTH: usize = 16;

/// Blackman window evaluated at `distance` from the centre of a window spanning
/// `[-half_width, half_width]`.
fn blackman(distance: f64, half_width: f64) -> f64 {
    let n = (distance + half_width) / (2.0 * half_width);
    BLACKMAN_A0 - BLACKMAN_A1 * (2.0 * PI * n).cos() + BLACKMAN_A2 * (4.0 * PI * n).cos()
}

/// Resample `samples` from `source_rate` to `target_rate`.
///
/// ## Returns:
/// - The input unchanged when both rates are equal
/// - `floor(len / (source_rate / target_rate))` samples otherwise
/// - An empty buffer for empty input or a zero rate (with a warning)
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32, half_width: usize) -> Vec<f32> {
    if samples.is_empty() {
        tracing::warn!("Resample called with an empty buffer");
        return Vec::new();
    }
    if source_rate == 0 || target_rate == 0 {
        tracing::warn!(source_rate, target_rate, "Resample called with a zero sample rate");
        return Vec::new();
    }
    if source_rate == target_rate {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let output_len = (samples.len() as f64 / ratio).floor() as usize;
    let cutoff = CUTOFF_FACTOR * (target_rate as f64 / 2.0) / source_rate as f64;
    let half_width = half_width.max(1) as f64;
    let last_index = samples.len() as i64 - 1;

    let mut output = Vec::with_capacity(output_len);
    for i in 0..output_len {
        let centre = i as f64 * ratio;
        let first = ((centre - half_width).ceil() as i64).max(0);
        let last = ((centre + half_width).floor() as i64).min(last_index);

        let mut sum = 0.0f64;
        let mut weight_sum = 0.0f64;
        for j in first..=last {
            let distance = j as f64 - centre;
            let weight = if distance == 0.0 {
                1.0
            } else {
                let x = PI * cutoff * distance;
                (x.sin() / x) * blackman(distance, half_width)
            };
            sum += samples[j as usize] as f64 * weight;
            weight_sum += weight;
        }

        let value = if first > last || weight_sum == 0.0 {
            0.0
        } else {
            sum / weight_sum
        };
        output.push(value as f32);
    }

    tracing::debug!(
        source_rate,
        target_rate,
        input = samples.len(),
        output = output.len(),
        "Resampled audio"
    );
    output
}

/// Catmull-Rom cubic through `p1..p2` evaluated at fraction `t`.
fn cubic(p0: f64, p1: f64, p2: f64, p3: f64, t: f64) -> f64 {
    let a0 = -0.5 * p0 + 1.5 * p1 - 1.5 * p2 + 0.5 * p3;
    let a1 = p0 - 2.5 * p1 + 2.0 * p2 - 0.5 * p3;
    let a2 = -0.5 * p0 + 0.5 * p2;
    let a3 = p1;
    ((a0 * t + a1) * t + a2) * t + a3
}

/// Double the sample rate of `samples` (8 kHz → 16 kHz).
///
/// Even output indices carry the original samples untouched; odd indices are the
/// cubic midpoint between their neighbours. Inputs shorter than four samples are
/// duplicated instead.
pub fn upsample_2x(samples: &[i16]) -> Vec<i16> {
    if samples.is_empty() {
        tracing::warn!("Upsample called with an empty buffer");
        return Vec::new();
    }

    let mut output = Vec::with_capacity(samples.len() * 2);

    if samples.len() < 4 {
        for &s in samples {
            output.push(s);
            output.push(s);
        }
        return output;
    }

    // Three copies of each edge sample keep every 4-tap read in bounds
    const PAD: usize = 3;
    let first = samples[0];
    let last = samples[samples.len() - 1];
    let mut padded = Vec::with_capacity(samples.len() + 2 * PAD);
    padded.extend(std::iter::repeat(first).take(PAD));
    padded.extend_from_slice(samples);
    padded.extend(std::iter::repeat(last).take(PAD));

    for i in 0..samples.len() {
        let p = i + PAD;
        output.push(samples[i]);
        let mid = cubic(
            padded[p - 1] as f64,
            padded[p] as f64,
            padded[p + 1] as f64,
            padded[p + 2] as f64,
            0.5,
        );
        output.push(mid.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frequency: f64, rate: u32, len: usize, amplitude: f64) -> Vec<f32> {
        (0..len)
            .map(|i| (amplitude * (2.0 * PI * frequency * i as f64 / rate as f64).sin()) as f32)
            .collect()
    }

    #[test]
    fn test_same_rate_is_identity() {
        let input = sine(440.0, 8000, 400, 0.5);
        let output = resample(&input, 8000, 8000, DEFAULT_HALF_WIDTH);
        assert_eq!(output, input);
    }

    #[test]
    fn test_output_length_is_floored() {
        let input = vec![0.25f32; 1001];
        let output = resample(&input, 24000, 8000, DEFAULT_HALF_WIDTH);
        assert_eq!(output.len(), 333);

        let output = resample(&input, 22050, 8000, DEFAULT_HALF_WIDTH);
        assert_eq!(output.len(), (1001.0_f64 / (22050.0 / 8000.0)).floor() as usize);
    }

    #[test]
    fn test_constant_signal_keeps_its_level() {
        let input = vec![0.25f32; 2400];
        let output = resample(&input, 24000, 8000, DEFAULT_HALF_WIDTH);
        for value in output {
            assert!((value - 0.25).abs() < 1e-4, "value drifted to {}", value);
        }
    }

    #[test]
    fn test_passband_tone_survives_downsampling() {
        let input = sine(300.0, 24000, 24000, 0.5);
        let output = resample(&input, 24000, 8000, DEFAULT_HALF_WIDTH);
        let peak = output[100..output.len() - 100]
            .iter()
            .fold(0.0f32, |acc, v| acc.max(v.abs()));
        assert!(peak > 0.4 && peak < 0.6, "peak was {}", peak);
    }

    #[test]
    fn test_blackman_edges() {
        assert!((blackman(0.0, 16.0) - 1.0).abs() < 1e-12);
        assert!(blackman(16.0, 16.0).abs() < 1e-12);
        assert!(blackman(-16.0, 16.0).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(resample(&[], 24000, 8000, DEFAULT_HALF_WIDTH).is_empty());
        assert!(resample(&[0.1, 0.2], 0, 8000, DEFAULT_HALF_WIDTH).is_empty());
        assert!(upsample_2x(&[]).is_empty());
    }

    #[test]
    fn test_upsample_keeps_original_samples_at_even_indices() {
        let input: Vec<i16> = (0..160).map(|i| ((i * 37) % 2000 - 1000) as i16).collect();
        let output = upsample_2x(&input);
        assert_eq!(output.len(), input.len() * 2);
        for (i, &sample) in input.iter().enumerate() {
            assert_eq!(output[2 * i], sample);
        }
    }

    #[test]
    fn test_upsample_interpolates_linear_ramp() {
        let input: Vec<i16> = (0..16).map(|i| i * 100).collect();
        let output = upsample_2x(&input);
        // Away from the padded edges a cubic through a ramp lands on the midpoint
        for i in 2..12 {
            assert_eq!(output[2 * i + 1], input[i] + 50);
        }
    }

    #[test]
    fn test_upsample_short_input_duplicates() {
        assert_eq!(upsample_2x(&[5, -7, 9]), vec![5, 5, -7, -7, 9, 9]);
    }
}
