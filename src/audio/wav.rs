//! # WAV Container Framing
//!
//! Speech-to-text collaborators take canonical 44-byte-header PCM WAV files, and the
//! text-to-speech collaborator hands WAV back. Writing uses `byteorder` directly so
//! the header layout is explicit; reading goes through the `wav` crate, which copes
//! with the extra chunks real synthesizers like to emit.

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Size of the canonical PCM WAV header.
pub const WAV_HEADER_LEN: usize = 44;

const PCM_FORMAT: u16 = 1;
const MONO: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;

/// Fields of a canonical 44-byte PCM WAV header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Length of the `data` chunk in bytes
    pub data_len: u32,
}

impl WavHeader {
    /// Parse the canonical header layout written by [`create_wav_from_pcm`].
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < WAV_HEADER_LEN {
            return Err(anyhow!("WAV buffer is {} bytes, header needs {}", bytes.len(), WAV_HEADER_LEN));
        }
        if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" || &bytes[12..16] != b"fmt " {
            return Err(anyhow!("Not a canonical RIFF/WAVE header"));
        }
        if &bytes[36..40] != b"data" {
            return Err(anyhow!("Expected data chunk at offset 36"));
        }

        let mut cursor = Cursor::new(&bytes[20..]);
        let audio_format = cursor.read_u16::<LittleEndian>()?;
        let channels = cursor.read_u16::<LittleEndian>()?;
        let sample_rate = cursor.read_u32::<LittleEndian>()?;
        let _byte_rate = cursor.read_u32::<LittleEndian>()?;
        let _block_align = cursor.read_u16::<LittleEndian>()?;
        let bits_per_sample = cursor.read_u16::<LittleEndian>()?;

        let mut cursor = Cursor::new(&bytes[40..44]);
        let data_len = cursor.read_u32::<LittleEndian>()?;

        Ok(Self {
            audio_format,
            channels,
            sample_rate,
            bits_per_sample,
            data_len,
        })
    }

    /// Playback duration described by the header.
    pub fn duration_secs(&self) -> f64 {
        let bytes_per_second =
            self.sample_rate as f64 * self.channels as f64 * (self.bits_per_sample as f64 / 8.0);
        if bytes_per_second == 0.0 {
            0.0
        } else {
            self.data_len as f64 / bytes_per_second
        }
    }
}

/// Frame mono 16-bit PCM samples as a WAV file.
///
/// An empty sample buffer still yields a valid 44-byte file with a zero-length
/// data chunk.
pub fn create_wav_from_pcm(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    if samples.is_empty() {
        tracing::warn!("Creating WAV from an empty sample buffer");
    }

    let data_len = (samples.len() * 2) as u32;
    let block_align = MONO * BITS_PER_SAMPLE / 8;
    let byte_rate = sample_rate * block_align as u32;

    let mut out = Vec::with_capacity(WAV_HEADER_LEN + data_len as usize);
    // Writes into a Vec cannot fail
    let _ = write_wav(&mut out, samples, sample_rate, data_len, block_align, byte_rate);
    out
}

fn write_wav(
    out: &mut Vec<u8>,
    samples: &[i16],
    sample_rate: u32,
    data_len: u32,
    block_align: u16,
    byte_rate: u32,
) -> std::io::Result<()> {
    out.extend_from_slice(b"RIFF");
    out.write_u32::<LittleEndian>(36 + data_len)?;
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.write_u32::<LittleEndian>(16)?;
    out.write_u16::<LittleEndian>(PCM_FORMAT)?;
    out.write_u16::<LittleEndian>(MONO)?;
    out.write_u32::<LittleEndian>(sample_rate)?;
    out.write_u32::<LittleEndian>(byte_rate)?;
    out.write_u16::<LittleEndian>(block_align)?;
    out.write_u16::<LittleEndian>(BITS_PER_SAMPLE)?;

    out.extend_from_slice(b"data");
    out.write_u32::<LittleEndian>(data_len)?;
    for &sample in samples {
        out.write_i16::<LittleEndian>(sample)?;
    }
    Ok(())
}

/// Audio decoded from a WAV file, down-mixed to mono floats in [-1.0, 1.0].
#[derive(Debug, Clone)]
pub struct DecodedWav {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Decode a WAV file of any common bit depth into mono float samples.
pub fn read_wav(bytes: &[u8]) -> Result<DecodedWav> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor).context("Failed to parse WAV data")?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples.into_iter().map(|s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    let channels = header.channel_count.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(DecodedWav {
        samples,
        sample_rate: header.sampling_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let samples: Vec<i16> = (0..320).map(|i| (i * 50 - 8000) as i16).collect();
        let wav = create_wav_from_pcm(&samples, 16000);
        assert_eq!(wav.len(), WAV_HEADER_LEN + samples.len() * 2);

        let header = WavHeader::parse(&wav).unwrap();
        assert_eq!(header.audio_format, 1);
        assert_eq!(header.channels, 1);
        assert_eq!(header.sample_rate, 16000);
        assert_eq!(header.bits_per_sample, 16);
        assert_eq!(header.data_len as usize, samples.len() * 2);
        assert!((header.duration_secs() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_wav_crate_reads_our_output() {
        let samples = vec![0i16, 16384, -16384, 32767, -32768];
        let wav = create_wav_from_pcm(&samples, 8000);
        let decoded = read_wav(&wav).unwrap();
        assert_eq!(decoded.sample_rate, 8000);
        assert_eq!(decoded.samples.len(), samples.len());
        assert!((decoded.samples[1] - 0.5).abs() < 1e-6);
        assert!((decoded.samples[4] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_samples_give_minimal_file() {
        let wav = create_wav_from_pcm(&[], 8000);
        assert_eq!(wav.len(), WAV_HEADER_LEN);
        assert_eq!(WavHeader::parse(&wav).unwrap().data_len, 0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(WavHeader::parse(b"RIFF").is_err());
        assert!(WavHeader::parse(&[0u8; 64]).is_err());
        assert!(read_wav(b"definitely not audio").is_err());
    }
}
