//! # Inbound Chunk Buffer
//!
//! Collects the caller's `media` payloads between two marks. Chunks can arrive
//! out of order, so each keeps the index it was sent with; draining sorts by
//! that index before the bytes are stitched back together.
//!
//! ## Key Features:
//! - **Duplicate detection**: a second chunk with an index already buffered is refused
//! - **Stable ordering**: chunks are sorted by index, arrival order breaks nothing
//! - **Drain once**: taking the utterance empties the buffer in the same call

use crate::protocol::{ErrorCode, MediaPayload, ProtocolError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashSet;
use std::time::Instant;

/// One fragment of inbound μ-law audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Ordering index inside the utterance
    pub index: u64,

    /// Decoded μ-law bytes
    pub payload: Vec<u8>,

    /// Provider timestamp, if one was sent
    pub timestamp: Option<String>,

    /// When the relay received the chunk
    pub arrival: Instant,
}

impl AudioChunk {
    /// Decode a base64 payload, insisting it re-encodes to exactly the same text.
    ///
    /// ## Error Handling:
    /// Non-canonical base64 (wrong padding, stray whitespace, bad alphabet) is
    /// rejected with [`ErrorCode::InvalidPayload`].
    pub fn from_base64(index: u64, encoded: &str, timestamp: Option<String>) -> Result<Self, ProtocolError> {
        let payload = STANDARD.decode(encoded).map_err(|e| {
            ProtocolError::new(ErrorCode::InvalidPayload, format!("Media payload is not valid base64: {}", e))
        })?;

        if STANDARD.encode(&payload) != encoded {
            return Err(ProtocolError::new(
                ErrorCode::InvalidPayload,
                "Media payload is not canonical base64",
            ));
        }

        Ok(Self {
            index,
            payload,
            timestamp,
            arrival: Instant::now(),
        })
    }

    /// Build a chunk from a `media` event, asking `fallback_index` for an index
    /// only when the sender left it out.
    pub fn from_media<F>(media: &MediaPayload, fallback_index: F) -> Result<Self, ProtocolError>
    where
        F: FnOnce() -> Result<u64, ProtocolError>,
    {
        let index = match media.chunk_index()? {
            Some(index) => index,
            None => fallback_index()?,
        };
        Self::from_base64(index, &media.payload, media.timestamp.clone())
    }
}

/// Chunks buffered for the utterance in progress.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: Vec<AudioChunk>,
    indices: HashSet<u64>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk. Refuses an index that is already buffered.
    pub fn push(&mut self, chunk: AudioChunk) -> Result<(), ProtocolError> {
        if !self.indices.insert(chunk.index) {
            return Err(ProtocolError::new(
                ErrorCode::DuplicateChunk,
                format!("Chunk {} is already buffered for this utterance", chunk.index),
            ));
        }
        self.chunks.push(chunk);
        Ok(())
    }

    /// Index to use for a chunk that arrived without one.
    ///
    /// Fails once the highest buffered index is `u64::MAX`, since there is
    /// nothing left to follow it.
    pub fn next_index(&self) -> Result<u64, ProtocolError> {
        match self.chunks.iter().map(|c| c.index).max() {
            None => Ok(0),
            Some(highest) => highest.checked_add(1).ok_or_else(|| {
                ProtocolError::new(
                    ErrorCode::InvalidPayload,
                    "Chunk index space exhausted, send an explicit chunk index",
                )
            }),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total buffered payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(|c| c.payload.len()).sum()
    }

    /// Take every buffered chunk, sorted by index, leaving the buffer empty.
    pub fn drain_ordered(&mut self) -> Vec<AudioChunk> {
        if self.is_empty() {
            return Vec::new();
        }
        self.indices.clear();
        let mut chunks = std::mem::take(&mut self.chunks);
        chunks.sort_by_key(|c| c.index);

        let gaps = chunks
            .windows(2)
            .filter(|pair| pair[1].index != pair[0].index + 1)
            .count();
        if gaps > 0 {
            tracing::warn!(gaps, chunks = chunks.len(), "Utterance has missing chunk indices");
        }

        chunks
    }

    /// Discard everything, returning how many chunks were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.chunks.len();
        self.chunks.clear();
        self.indices.clear();
        dropped
    }
}

/// Concatenate chunk payloads in index order.
pub fn combine_audio_chunks(mut chunks: Vec<AudioChunk>) -> Vec<u8> {
    chunks.sort_by_key(|c| c.index);
    let total = chunks.iter().map(|c| c.payload.len()).sum();
    let mut combined = Vec::with_capacity(total);
    for chunk in chunks {
        combined.extend_from_slice(&chunk.payload);
    }
    combined
}
