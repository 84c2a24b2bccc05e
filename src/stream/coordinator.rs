//! # Mark/Boundary Coordinator
//!
//! A `mark` from the caller's side ends an utterance. The coordinator decides
//! whether there is anything to process, consolidates the buffered chunks into
//! one μ-law buffer for the pipeline, and later turns the pipeline's reply into
//! the `media` + `mark` pair sent back down the wire.
//!
//! ## Utterance Flow:
//! 1. `consolidate`: drain chunks (sorted by index) into an [`UtteranceJob`]
//! 2. The pipeline runs detached; new chunks buffer into the emptied buffer meanwhile
//! 3. `accept_reply`: check the generation, record the conversation, build events

use crate::audio::AudioSettings;
use crate::pipeline::{PipelineOutput, Speaker, UtteranceJob};
use crate::protocol::{ErrorCode, ProtocolError, StreamEvent};
use crate::stream::buffer::combine_audio_chunks;
use crate::stream::session::StreamSession;
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Prefix for marks that follow each spoken reply.
pub const REPLY_MARK_PREFIX: &str = "reply";

/// What to do with a finished pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// The stream moved on while the pipeline ran
    Stale { started: u64, current: u64 },
    /// The pipeline failed; tell the caller and keep going
    Failed(ProtocolError),
    /// Nothing to say (the chat model returned no text)
    Silent,
    /// Play `media`, then send `mark` so we hear when playback finished
    Speak { media: StreamEvent, mark: StreamEvent },
}

/// Cut the current utterance.
///
/// ## Returns:
/// - **Some(job)**: buffered chunks were drained into one ordered buffer
/// - **None**: nothing buffered (or no stream running); the mark is only forwarded
pub fn consolidate(session: &mut StreamSession, settings: &AudioSettings) -> Option<UtteranceJob> {
    let stream = session.stream()?.clone();

    let chunks = session.take_chunks();
    if chunks.is_empty() {
        return None;
    }

    let chunk_count = chunks.len();
    let first_arrival = chunks.iter().map(|c| c.arrival).min();
    let last_arrival = chunks.iter().map(|c| c.arrival).max();
    let span_ms = first_arrival
        .zip(last_arrival)
        .map(|(first, last)| last.duration_since(first).as_millis() as u64)
        .unwrap_or_default();
    let first_timestamp = chunks.first().and_then(|c| c.timestamp.clone());

    let audio = combine_audio_chunks(chunks);
    tracing::debug!(
        stream_id = %stream.stream_id,
        chunks = chunk_count,
        span_ms,
        first_timestamp = ?first_timestamp,
        bytes = audio.len(),
        generation = session.generation(),
        "Utterance consolidated"
    );

    Some(UtteranceJob {
        generation: session.generation(),
        stream_id: stream.stream_id,
        peer: stream.peer,
        audio,
        history: session.history(),
        settings: settings.clone(),
    })
}

/// Fold a pipeline result back into the session.
pub fn accept_reply(
    session: &mut StreamSession,
    generation: u64,
    result: Result<PipelineOutput, String>,
) -> ReplyOutcome {
    let current = session.generation();
    if generation != current || !session.is_active() {
        return ReplyOutcome::Stale {
            started: generation,
            current,
        };
    }

    let output = match result {
        Ok(output) => output,
        Err(message) => {
            return ReplyOutcome::Failed(ProtocolError::new(
                ErrorCode::PipelineFailure,
                format!("Pipeline failed: {}", message),
            ))
        }
    };

    session.record_turn(Speaker::User, output.transcript);
    if output.reply.trim().is_empty() {
        return ReplyOutcome::Silent;
    }
    session.record_turn(Speaker::Assistant, output.reply);

    if output.audio.is_empty() {
        return ReplyOutcome::Silent;
    }

    let chunk = session.next_media_chunk();
    let media = StreamEvent::media(STANDARD.encode(&output.audio), chunk);

    let mark_name = session.next_mark_name(REPLY_MARK_PREFIX);
    session.push_mark(mark_name.clone());

    ReplyOutcome::Speak {
        media,
        mark: StreamEvent::mark(mark_name),
    }
}
