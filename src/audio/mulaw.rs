//! # G.711 μ-law Codec
//!
//! Converts between 16-bit linear PCM and the 8-bit μ-law encoding used on the
//! telephony wire (ITU-T Recommendation G.711).
//!
//! ## Encoding Steps:
//! 1. Take the sign and clamp the magnitude to 32767
//! 2. Drop to the 14-bit domain and add the bias of 33
//! 3. Find the logarithmic segment (0-7) and the 4-bit position inside it
//! 4. Pack `sign | segment | position` and complement every bit
//!
//! Decoding is a lookup into the standard G.711 reconstruction table, built at
//! compile time so every decoder shares one immutable copy.

/// Bias added to the 14-bit magnitude before segment lookup.
const BIAS: i32 = 33;

/// Largest magnitude accepted before encoding.
const CLIP: i32 = 32767;

/// Largest biased magnitude in the 14-bit domain.
const MAX_BIASED: i32 = 0x1FFF;

/// Decoded value for every possible μ-law byte.
static DECODE_TABLE: [i16; 256] = build_decode_table();

const fn decode_slow(code: u8) -> i16 {
    let inverted = !code;
    let sign = inverted & 0x80;
    let segment = ((inverted >> 4) & 0x07) as i32;
    let position = (inverted & 0x0F) as i32;

    let magnitude = (((position << 3) + 0x84) << segment) - 0x84;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

const fn build_decode_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut code = 0;
    while code < 256 {
        table[code] = decode_slow(code as u8);
        code += 1;
    }
    table
}

/// Encode one linear PCM sample to μ-law.
pub fn encode_sample(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let magnitude = (sample as i32).abs().min(CLIP);

    let biased = ((magnitude >> 2) + BIAS).min(MAX_BIASED);

    // `biased` is in [33, 8191], so its highest set bit sits between 5 and 12
    let highest_bit = 31 - biased.leading_zeros() as i32;
    let segment = (highest_bit - 5) as u8;
    let position = ((biased >> (segment + 1)) & 0x0F) as u8;

    !(sign | (segment << 4) | position)
}

/// Decode one μ-law byte to linear PCM.
pub fn decode_sample(code: u8) -> i16 {
    DECODE_TABLE[code as usize]
}

/// Encode a buffer of PCM samples to μ-law bytes.
pub fn encode(samples: &[i16]) -> Vec<u8> {
    if samples.is_empty() {
        tracing::warn!("μ-law encode called with an empty sample buffer");
        return Vec::new();
    }
    samples.iter().map(|&s| encode_sample(s)).collect()
}

/// Decode μ-law bytes to PCM samples.
pub fn decode(bytes: &[u8]) -> Vec<i16> {
    if bytes.is_empty() {
        tracing::warn!("μ-law decode called with an empty byte buffer");
        return Vec::new();
    }
    bytes.iter().map(|&b| decode_sample(b)).collect()
}
