//! # Stream Session State
//!
//! Mutable record for one WebSocket connection. Owned by exactly one connection
//! actor, so nothing in here needs a lock.
//!
//! ## Stream Lifecycle:
//! 1. **Connected**: no stream yet; only `connected` and `dtmf` make sense
//! 2. **Active**: `start` set the stream id; media and marks flow
//! 3. **Stopped**: `stop` or disconnect; counters reset, buffers dropped
//!
//! Every transition into or out of a stream bumps the generation, which is how
//! a pipeline reply started under an older stream is recognised as stale.

use crate::pipeline::transcripts::{TranscriptRecord, TranscriptTurn};
use crate::pipeline::{ChatTurn, Speaker};
use crate::protocol::ProtocolError;
use crate::stream::buffer::{AudioChunk, ChunkBuffer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Which side of the relay a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// The single authoritative telephony stream
    Primary,
    /// A browser watching (and optionally injecting into) the primary stream
    Observer,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Primary => "primary",
            PeerRole::Observer => "observer",
        }
    }
}

/// Identity of the stream currently running on a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamIdentity {
    pub stream_id: String,
    pub call_sid: Option<String>,
    /// Normalized caller (or callee) phone number
    pub peer: Option<String>,
}

/// Per-connection state.
#[derive(Debug)]
pub struct StreamSession {
    pub connection_id: String,
    pub role: PeerRole,
    stream: Option<StreamIdentity>,
    sequence_counter: u64,
    media_chunk_counter: u64,
    mark_counter: u64,
    pending_marks: VecDeque<String>,
    chunks: ChunkBuffer,
    generation: u64,
    transcript: Vec<TranscriptTurn>,
    started_at: Option<DateTime<Utc>>,
}

impl StreamSession {
    pub fn new(connection_id: impl Into<String>, role: PeerRole) -> Self {
        Self {
            connection_id: connection_id.into(),
            role,
            stream: None,
            sequence_counter: 1,
            media_chunk_counter: 1,
            mark_counter: 1,
            pending_marks: VecDeque::new(),
            chunks: ChunkBuffer::new(),
            generation: 0,
            transcript: Vec::new(),
            started_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&StreamIdentity> {
        self.stream.as_ref()
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream.as_ref().map(|s| s.stream_id.as_str())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Sequence number for the next outgoing message.
    pub fn next_sequence(&mut self) -> u64 {
        let current = self.sequence_counter;
        self.sequence_counter += 1;
        current
    }

    /// Chunk number for the next outgoing media event.
    pub fn next_media_chunk(&mut self) -> u64 {
        let current = self.media_chunk_counter;
        self.media_chunk_counter += 1;
        current
    }

    /// Name for the next mark we send, e.g. `reply-3`.
    pub fn next_mark_name(&mut self, prefix: &str) -> String {
        let current = self.mark_counter;
        self.mark_counter += 1;
        format!("{}-{}", prefix, current)
    }

    /// Begin a stream. An already running stream is ended first.
    ///
    /// ## Returns:
    /// The transcript of the stream that was replaced, if there was one.
    pub fn begin_stream(&mut self, identity: StreamIdentity) -> Option<TranscriptRecord> {
        let previous = self.end_stream();
        tracing::info!(
            connection_id = %self.connection_id,
            role = self.role.as_str(),
            stream_id = %identity.stream_id,
            peer = identity.peer.as_deref().unwrap_or("unknown"),
            "Stream started"
        );
        self.stream = Some(identity);
        self.started_at = Some(Utc::now());
        previous
    }

    /// End the running stream, dropping buffered audio and pending marks and
    /// resetting every counter.
    ///
    /// ## Returns:
    /// The finished transcript, or `None` when no stream was running.
    pub fn end_stream(&mut self) -> Option<TranscriptRecord> {
        let dropped_bytes = self.chunks.byte_len();
        let dropped = self.chunks.clear();
        if dropped > 0 {
            tracing::warn!(
                connection_id = %self.connection_id,
                dropped,
                dropped_bytes,
                "Dropping buffered chunks that never reached a mark"
            );
        }

        self.pending_marks.clear();
        self.sequence_counter = 1;
        self.media_chunk_counter = 1;
        self.mark_counter = 1;
        self.generation += 1;

        let stream = self.stream.take()?;
        let started_at = self.started_at.take().unwrap_or_else(Utc::now);
        Some(TranscriptRecord {
            stream_id: stream.stream_id,
            call_sid: stream.call_sid,
            peer: stream.peer,
            started_at,
            ended_at: Utc::now(),
            turns: std::mem::take(&mut self.transcript),
        })
    }

    pub fn buffer_chunk(&mut self, chunk: AudioChunk) -> Result<(), ProtocolError> {
        self.chunks.push(chunk)
    }

    pub fn next_chunk_index(&self) -> Result<u64, ProtocolError> {
        self.chunks.next_index()
    }

    #[cfg(test)]
    pub fn buffered_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Take the utterance in progress, ordered by chunk index.
    pub fn take_chunks(&mut self) -> Vec<AudioChunk> {
        self.chunks.drain_ordered()
    }

    pub fn push_mark(&mut self, name: impl Into<String>) {
        self.pending_marks.push_back(name.into());
    }

    /// Forget a pending mark once the peer reports it played. Returns whether it was pending.
    pub fn acknowledge_mark(&mut self, name: &str) -> bool {
        match self.pending_marks.iter().position(|m| m == name) {
            Some(position) => {
                self.pending_marks.remove(position);
                true
            }
            None => false,
        }
    }

    /// Empty the pending marks, oldest first.
    pub fn flush_marks(&mut self) -> Vec<String> {
        self.pending_marks.drain(..).collect()
    }

    #[cfg(test)]
    pub fn pending_marks(&self) -> impl Iterator<Item = &str> {
        self.pending_marks.iter().map(String::as_str)
    }

    pub fn record_turn(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.transcript.push(TranscriptTurn::new(speaker, text));
    }

    /// Conversation so far, in the shape the chat model expects.
    pub fn history(&self) -> Vec<ChatTurn> {
        self.transcript.iter().map(TranscriptTurn::as_chat_turn).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(stream_id: &str) -> StreamIdentity {
        StreamIdentity {
            stream_id: stream_id.to_string(),
            call_sid: None,
            peer: Some("+15550102000".to_string()),
        }
    }

    #[test]
    fn test_counters_start_at_one_and_reset_on_stop() {
        let mut session = StreamSession::new("c1", PeerRole::Primary);
        session.begin_stream(identity("MZ1"));
        assert_eq!(session.next_sequence(), 1);
        assert_eq!(session.next_sequence(), 2);
        assert_eq!(session.next_media_chunk(), 1);

        session.end_stream();
        assert_eq!(session.next_sequence(), 1);
        assert_eq!(session.next_media_chunk(), 1);
    }

    #[test]
    fn test_generation_moves_on_every_transition() {
        let mut session = StreamSession::new("c1", PeerRole::Primary);
        let initial = session.generation();
        session.begin_stream(identity("MZ1"));
        let running = session.generation();
        assert!(running > initial);

        session.end_stream();
        assert!(session.generation() > running);
    }

    #[test]
    fn test_restart_drains_chunks_and_returns_old_transcript() {
        let mut session = StreamSession::new("c1", PeerRole::Primary);
        session.begin_stream(identity("MZ1"));
        session.buffer_chunk(AudioChunk::from_base64(0, "AA==", None).unwrap()).unwrap();
        session.record_turn(Speaker::User, "hello");
        session.push_mark("stream-start");

        let previous = session.begin_stream(identity("MZ2")).unwrap();
        assert_eq!(previous.stream_id, "MZ1");
        assert_eq!(previous.turns.len(), 1);
        assert_eq!(session.buffered_chunks(), 0);
        assert_eq!(session.pending_marks().count(), 0);
        assert_eq!(session.stream_id(), Some("MZ2"));
    }

    #[test]
    fn test_end_without_stream_returns_nothing() {
        let mut session = StreamSession::new("c1", PeerRole::Primary);
        assert!(session.end_stream().is_none());
    }

    #[test]
    fn test_marks_flush_in_fifo_order() {
        let mut session = StreamSession::new("c1", PeerRole::Primary);
        session.push_mark("a");
        session.push_mark("b");
        session.push_mark("c");
        assert!(session.acknowledge_mark("b"));
        assert!(!session.acknowledge_mark("b"));
        assert_eq!(session.flush_marks(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(session.pending_marks().count(), 0);
    }

    #[test]
    fn test_history_follows_transcript() {
        let mut session = StreamSession::new("c1", PeerRole::Primary);
        session.begin_stream(identity("MZ1"));
        session.record_turn(Speaker::User, "what time is it");
        session.record_turn(Speaker::Assistant, "noon");

        let history = session.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Speaker::User);
        assert_eq!(history[1].content, "noon");
    }
}
