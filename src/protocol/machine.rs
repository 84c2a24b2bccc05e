//! # Protocol State Machines
//!
//! One handler per connection turns decoded wire events into [`Effect`]s. The
//! handlers never touch the socket, the registry mailboxes or the pipeline
//! directly; the connection actor in [`crate::websocket`] carries the effects
//! out in order. That keeps every protocol rule testable without a network.
//!
//! ## Handlers:
//! - **`ServiceHandler`**: the primary telephony stream; owns a [`StreamSession`]
//! - **`BrowserHandler`**: an observer; its media/mark/clear go to the primary
//!
//! Both sit behind [`InboundEventSink`], and the choice is made once when the
//! connection is accepted.
//!
//! ## Sequence Numbers:
//! Outgoing messages are stamped as they are produced, which is the moment
//! they are written to the socket. Pipeline replies are stamped when the reply
//! arrives, not when the utterance was cut.

use crate::audio::{AudioProcessor, AudioSettings};
use crate::pipeline::contacts::normalize_phone_number;
use crate::pipeline::transcripts::TranscriptRecord;
use crate::pipeline::{ContactLookup, PipelineOutput, PipelineStats, UtteranceJob};
use crate::protocol::messages::{
    ErrorCode, MediaPayload, ProtocolError, StartMetadata, StopMetadata, StreamEvent, WireMessage,
};
use crate::stream::buffer::AudioChunk;
use crate::stream::coordinator::{self, ReplyOutcome};
use crate::stream::{ConnectionManager, PeerRole, StreamIdentity, StreamSession};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the mark sent right after a stream starts.
pub const INITIAL_MARK: &str = "stream-start";

/// Something the connection actor must do on the handler's behalf.
#[derive(Debug)]
pub enum Effect {
    /// Write to this connection's socket
    Reply(WireMessage),
    /// Copy to every observer
    Broadcast(WireMessage),
    /// Both of the above
    ReplyAndBroadcast(WireMessage),
    /// Run the AI pipeline on a consolidated utterance
    Process(UtteranceJob),
    /// Write a finished conversation to disk
    PersistTranscript(TranscriptRecord),
}

/// Per-connection protocol logic, one implementation per peer role.
pub trait InboundEventSink: Unpin + 'static {
    fn role(&self) -> PeerRole;

    fn connection_id(&self) -> &str;

    /// React to one decoded wire message.
    fn handle_event(&mut self, message: WireMessage) -> Vec<Effect>;

    /// React to a text frame that did not decode.
    fn handle_decode_error(&mut self, error: ProtocolError) -> Vec<Effect>;

    /// An observer asked for `event` to be injected into this stream.
    fn handle_relay(&mut self, from: &str, event: StreamEvent) -> Vec<Effect> {
        warn!(
            connection_id = self.connection_id(),
            from,
            event = event.name(),
            "Relay ignored by non-primary connection"
        );
        Vec::new()
    }

    /// A pipeline run started under `generation` finished.
    fn handle_pipeline_result(&mut self, generation: u64, _result: Result<PipelineOutput, String>) -> Vec<Effect> {
        debug!(connection_id = self.connection_id(), generation, "Pipeline result ignored");
        Vec::new()
    }

    /// The connection is going away.
    fn handle_close(&mut self) -> Vec<Effect>;
}

fn persist(record: Option<TranscriptRecord>) -> Option<Effect> {
    record
        .filter(|r| !r.turns.is_empty())
        .map(Effect::PersistTranscript)
}

/// State machine for the primary telephony stream.
pub struct ServiceHandler {
    session: StreamSession,
    settings: AudioSettings,
    contacts: Arc<dyn ContactLookup>,
    stats: Arc<PipelineStats>,
}

impl ServiceHandler {
    pub fn new(
        connection_id: impl Into<String>,
        settings: AudioSettings,
        contacts: Arc<dyn ContactLookup>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            session: StreamSession::new(connection_id, PeerRole::Primary),
            settings,
            contacts,
            stats,
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    /// Attach envelope fields to an outgoing event.
    fn stamp(&mut self, event: StreamEvent) -> WireMessage {
        WireMessage {
            event,
            sequence_number: Some(self.session.next_sequence().to_string()),
            stream_sid: self.session.stream_id().map(str::to_string),
        }
    }

    fn error_effect(&mut self, error: ProtocolError) -> Effect {
        warn!(
            connection_id = %self.session.connection_id,
            code = error.code.code(),
            message = %error.message,
            "Protocol error"
        );
        Effect::Reply(self.stamp(StreamEvent::error(&error)))
    }

    fn require_stream(&mut self, event: &str) -> Option<Effect> {
        if self.session.is_active() {
            None
        } else {
            let error = ProtocolError::new(
                ErrorCode::NoActiveStream,
                format!("Received {} before the stream started", event),
            );
            Some(self.error_effect(error))
        }
    }

    fn on_start(&mut self, start: StartMetadata, envelope_sid: Option<String>) -> Vec<Effect> {
        let stream_id = Some(start.stream_sid.clone())
            .filter(|s| !s.is_empty())
            .or(envelope_sid.filter(|s| !s.is_empty()))
            .unwrap_or_else(|| format!("MZ{}", Uuid::new_v4().simple()));

        if self.session.is_active() {
            warn!(
                connection_id = %self.session.connection_id,
                previous = self.session.stream_id().unwrap_or_default(),
                next = %stream_id,
                "Start received while a stream is active, restarting"
            );
        }

        let processor = AudioProcessor::new(self.settings.clone());
        if let Err(reason) = processor.validate_media_format(&start.media_format) {
            warn!(stream_id = %stream_id, %reason, "Unexpected media format, continuing anyway");
        }

        let candidates: Vec<String> = [start.from.as_deref(), start.to.as_deref()]
            .into_iter()
            .flatten()
            .map(normalize_phone_number)
            .filter(|n| !n.is_empty())
            .collect();
        let greeting = candidates.iter().find_map(|n| self.contacts.greeting_for(n));

        let mut effects = Vec::new();
        let previous = self.session.begin_stream(StreamIdentity {
            stream_id,
            call_sid: Some(start.call_sid.clone()).filter(|s| !s.is_empty()),
            peer: candidates.first().cloned(),
        });
        effects.extend(persist(previous));

        let ack = self.stamp(StreamEvent::Start { start });
        effects.push(Effect::ReplyAndBroadcast(ack));

        if let Some(payload) = greeting {
            debug!(stream_id = self.session.stream_id().unwrap_or_default(), "Playing greeting");
            let chunk = self.session.next_media_chunk();
            let media = self.stamp(StreamEvent::media(payload, chunk));
            effects.push(Effect::ReplyAndBroadcast(media));
        }

        self.session.push_mark(INITIAL_MARK);
        let mark = self.stamp(StreamEvent::mark(INITIAL_MARK));
        effects.push(Effect::ReplyAndBroadcast(mark));

        effects
    }

    fn on_media(&mut self, media: MediaPayload, sequence_number: Option<String>, stream_sid: Option<String>) -> Vec<Effect> {
        if let Some(error) = self.require_stream("media") {
            return vec![error];
        }

        let chunk = match AudioChunk::from_media(&media, || self.session.next_chunk_index()) {
            Ok(chunk) => chunk,
            Err(error) => return vec![self.error_effect(error)],
        };
        if let Err(error) = self.session.buffer_chunk(chunk) {
            return vec![self.error_effect(error)];
        }

        vec![Effect::Broadcast(WireMessage {
            event: StreamEvent::Media { media },
            sequence_number,
            stream_sid,
        })]
    }

    fn on_mark(&mut self, name: String, sequence_number: Option<String>, stream_sid: Option<String>) -> Vec<Effect> {
        if let Some(error) = self.require_stream("mark") {
            return vec![error];
        }

        if self.session.acknowledge_mark(&name) {
            debug!(mark = %name, "Peer reached pending mark");
        }

        let mut effects = Vec::new();
        if let Some(job) = coordinator::consolidate(&mut self.session, &self.settings) {
            info!(
                stream_id = %job.stream_id,
                mark = %name,
                bytes = job.audio.len(),
                "Utterance boundary reached"
            );
            effects.push(Effect::Process(job));
        }

        effects.push(Effect::Broadcast(WireMessage {
            event: StreamEvent::mark(name),
            sequence_number,
            stream_sid,
        }));
        effects
    }

    fn on_stop(&mut self, stop: StopMetadata) -> Vec<Effect> {
        let ack = self.stamp(StreamEvent::Stop { stop });
        let record = self.session.end_stream();
        if let Some(record) = &record {
            info!(stream_id = %record.stream_id, turns = record.turns.len(), "Stream stopped");
        }

        let mut effects = vec![Effect::ReplyAndBroadcast(ack)];
        effects.extend(persist(record));
        effects
    }

    fn on_clear(&mut self) -> Vec<Effect> {
        if let Some(error) = self.require_stream("clear") {
            return vec![error];
        }

        let mut effects: Vec<Effect> = self
            .session
            .flush_marks()
            .into_iter()
            .map(|name| Effect::ReplyAndBroadcast(self.stamp(StreamEvent::mark(name))))
            .collect();
        effects.push(Effect::ReplyAndBroadcast(self.stamp(StreamEvent::Clear)));
        effects
    }
}

impl InboundEventSink for ServiceHandler {
    fn role(&self) -> PeerRole {
        self.session.role
    }

    fn connection_id(&self) -> &str {
        &self.session.connection_id
    }

    fn handle_event(&mut self, message: WireMessage) -> Vec<Effect> {
        let WireMessage {
            event,
            sequence_number,
            stream_sid,
        } = message;

        match event {
            StreamEvent::Connected { .. } => vec![Effect::Reply(self.stamp(StreamEvent::connected()))],
            StreamEvent::Start { start } => self.on_start(start, stream_sid),
            StreamEvent::Media { media } => self.on_media(media, sequence_number, stream_sid),
            StreamEvent::Mark { mark } => self.on_mark(mark.name, sequence_number, stream_sid),
            StreamEvent::Stop { stop } => self.on_stop(stop),
            StreamEvent::Clear => self.on_clear(),
            StreamEvent::Dtmf { dtmf } => {
                info!(connection_id = %self.session.connection_id, digit = %dtmf.digit, "DTMF received");
                vec![Effect::ReplyAndBroadcast(self.stamp(StreamEvent::Dtmf { dtmf }))]
            }
            StreamEvent::Error { message, code } => {
                let kind = ErrorCode::from_code(code).map(|c| c.to_string());
                warn!(connection_id = %self.session.connection_id, code, ?kind, %message, "Peer reported an error");
                Vec::new()
            }
        }
    }

    fn handle_decode_error(&mut self, error: ProtocolError) -> Vec<Effect> {
        vec![self.error_effect(error)]
    }

    fn handle_relay(&mut self, from: &str, event: StreamEvent) -> Vec<Effect> {
        if !self.session.is_active() {
            warn!(from, event = event.name(), "Observer relay dropped, no active stream");
            return Vec::new();
        }

        match event {
            StreamEvent::Media { media } => {
                if let Err(error) = AudioChunk::from_base64(0, &media.payload, None) {
                    warn!(from, %error, "Observer sent an invalid media payload");
                    return Vec::new();
                }
                let chunk = self.session.next_media_chunk();
                vec![Effect::ReplyAndBroadcast(self.stamp(StreamEvent::media(media.payload, chunk)))]
            }
            StreamEvent::Mark { mark } => {
                self.session.push_mark(mark.name.clone());
                vec![Effect::ReplyAndBroadcast(self.stamp(StreamEvent::Mark { mark }))]
            }
            StreamEvent::Clear => self.on_clear(),
            other => {
                warn!(from, event = other.name(), "Observers may only relay media, mark and clear");
                Vec::new()
            }
        }
    }

    fn handle_pipeline_result(&mut self, generation: u64, result: Result<PipelineOutput, String>) -> Vec<Effect> {
        match coordinator::accept_reply(&mut self.session, generation, result) {
            ReplyOutcome::Stale { started, current } => {
                self.stats.record_stale();
                debug!(started, current, "Discarding stale pipeline reply");
                Vec::new()
            }
            ReplyOutcome::Failed(error) => vec![self.error_effect(error)],
            ReplyOutcome::Silent => {
                debug!(connection_id = %self.session.connection_id, "Pipeline produced nothing to say");
                Vec::new()
            }
            ReplyOutcome::Speak { media, mark } => {
                let media = self.stamp(media);
                let mark = self.stamp(mark);
                vec![Effect::ReplyAndBroadcast(media), Effect::ReplyAndBroadcast(mark)]
            }
        }
    }

    fn handle_close(&mut self) -> Vec<Effect> {
        persist(self.session.end_stream()).into_iter().collect()
    }
}

/// State machine for a browser observer.
pub struct BrowserHandler {
    connection_id: String,
    sequence_counter: u64,
    registry: Arc<ConnectionManager>,
}

impl BrowserHandler {
    pub fn new(connection_id: impl Into<String>, registry: Arc<ConnectionManager>) -> Self {
        Self {
            connection_id: connection_id.into(),
            sequence_counter: 1,
            registry,
        }
    }

    fn stamp(&mut self, event: StreamEvent) -> WireMessage {
        let sequence = self.sequence_counter;
        self.sequence_counter += 1;
        WireMessage {
            event,
            sequence_number: Some(sequence.to_string()),
            stream_sid: None,
        }
    }

    fn error_effect(&mut self, error: ProtocolError) -> Effect {
        warn!(
            connection_id = %self.connection_id,
            code = error.code.code(),
            message = %error.message,
            "Observer protocol error"
        );
        Effect::Reply(self.stamp(StreamEvent::error(&error)))
    }
}

impl InboundEventSink for BrowserHandler {
    fn role(&self) -> PeerRole {
        PeerRole::Observer
    }

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn handle_event(&mut self, message: WireMessage) -> Vec<Effect> {
        match message.event {
            StreamEvent::Connected { .. } => vec![Effect::Reply(self.stamp(StreamEvent::connected()))],
            event @ (StreamEvent::Media { .. } | StreamEvent::Mark { .. } | StreamEvent::Clear) => {
                let name = event.name();
                if self.registry.forward_to_primary(&self.connection_id, event) {
                    debug!(connection_id = %self.connection_id, event = name, "Relayed to primary");
                    Vec::new()
                } else {
                    let error = ProtocolError::new(ErrorCode::NoActiveStream, "No primary stream is connected");
                    vec![self.error_effect(error)]
                }
            }
            StreamEvent::Dtmf { dtmf } => vec![Effect::Reply(self.stamp(StreamEvent::Dtmf { dtmf }))],
            StreamEvent::Error { message, code } => {
                warn!(connection_id = %self.connection_id, code, %message, "Observer reported an error");
                Vec::new()
            }
            other => {
                let error = ProtocolError::new(
                    ErrorCode::UnknownEvent,
                    format!("Event {} is not accepted from observers", other.name()),
                );
                vec![self.error_effect(error)]
            }
        }
    }

    fn handle_decode_error(&mut self, error: ProtocolError) -> Vec<Effect> {
        vec![self.error_effect(error)]
    }

    fn handle_close(&mut self) -> Vec<Effect> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MediaFormat;
    use crate::pipeline::stubs::StaticContacts;
    use crate::protocol::messages::DtmfPayload;
    use std::collections::HashMap;

    const CALLER: &str = "+15550102000";

    fn handler_with_greeting(greeting: Option<&str>) -> ServiceHandler {
        let mut contacts = HashMap::new();
        if let Some(greeting) = greeting {
            contacts.insert(CALLER.to_string(), greeting.to_string());
        }
        ServiceHandler::new(
            "conn-1",
            AudioSettings::default(),
            Arc::new(StaticContacts(contacts)),
            Arc::new(PipelineStats::default()),
        )
    }

    fn handler() -> ServiceHandler {
        handler_with_greeting(None)
    }

    fn start_message(stream_sid: &str) -> WireMessage {
        WireMessage {
            event: StreamEvent::Start {
                start: StartMetadata {
                    account_sid: "AC1".to_string(),
                    call_sid: "CA1".to_string(),
                    stream_sid: stream_sid.to_string(),
                    from: Some("+1 (555) 010-2000".to_string()),
                    to: None,
                    tracks: vec!["inbound".to_string()],
                    media_format: MediaFormat::default(),
                    custom_parameters: None,
                },
            },
            sequence_number: Some("1".to_string()),
            stream_sid: Some(stream_sid.to_string()),
        }
    }

    fn media_message(chunk: Option<u64>, payload: &str) -> WireMessage {
        WireMessage {
            event: StreamEvent::Media {
                media: MediaPayload {
                    payload: payload.to_string(),
                    track: Some("inbound".to_string()),
                    chunk: chunk.map(|c| c.to_string()),
                    timestamp: None,
                },
            },
            sequence_number: None,
            stream_sid: Some("MZ1".to_string()),
        }
    }

    fn mark_message(name: &str) -> WireMessage {
        WireMessage::bare(StreamEvent::mark(name))
    }

    /// Messages written back to the peer, in order.
    fn replies(effects: &[Effect]) -> Vec<&WireMessage> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Reply(m) | Effect::ReplyAndBroadcast(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn error_code(effects: &[Effect]) -> Option<u16> {
        replies(effects).into_iter().find_map(|m| match &m.event {
            StreamEvent::Error { code, .. } => Some(*code),
            _ => None,
        })
    }

    #[test]
    fn test_connected_is_acknowledged() {
        let mut handler = handler();
        let effects = handler.handle_event(WireMessage::bare(StreamEvent::Connected {
            protocol: None,
            version: None,
        }));
        let sent = replies(&effects);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event.name(), "connected");
        assert_eq!(sent[0].sequence_number.as_deref(), Some("1"));
        assert!(sent[0].stream_sid.is_none());
    }

    #[test]
    fn test_start_acks_greets_and_marks() {
        let mut handler = handler_with_greeting(Some("//8="));
        let effects = handler.handle_event(start_message("MZ1"));
        let sent = replies(&effects);

        let names: Vec<&str> = sent.iter().map(|m| m.event.name()).collect();
        assert_eq!(names, vec!["start", "media", "mark"]);
        assert_eq!(sent[0].sequence_number.as_deref(), Some("1"));
        assert_eq!(sent[0].stream_sid.as_deref(), Some("MZ1"));
        assert_eq!(sent[2].event, StreamEvent::mark(INITIAL_MARK));

        assert_eq!(handler.session().stream().unwrap().peer.as_deref(), Some(CALLER));
        assert_eq!(handler.session().pending_marks().collect::<Vec<_>>(), vec![INITIAL_MARK]);
    }

    #[test]
    fn test_start_without_known_contact_skips_greeting() {
        let mut handler = handler();
        let effects = handler.handle_event(start_message("MZ1"));
        let names: Vec<&str> = replies(&effects).iter().map(|m| m.event.name()).collect();
        assert_eq!(names, vec!["start", "mark"]);
    }

    #[test]
    fn test_sequence_numbers_increase_and_reset_after_stop() {
        let mut handler = handler();
        let mut seen = Vec::new();

        for effects in [
            handler.handle_event(start_message("MZ1")),
            handler.handle_event(WireMessage::bare(StreamEvent::Dtmf {
                dtmf: DtmfPayload { digit: "5".to_string() },
            })),
            handler.handle_event(WireMessage::bare(StreamEvent::Stop {
                stop: StopMetadata::default(),
            })),
        ] {
            seen.extend(replies(&effects).iter().filter_map(|m| m.sequence()));
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);

        let effects = handler.handle_event(WireMessage::bare(StreamEvent::Connected {
            protocol: None,
            version: None,
        }));
        assert_eq!(replies(&effects)[0].sequence(), Some(1));
    }

    #[test]
    fn test_media_before_start_is_rejected() {
        let mut handler = handler();
        let effects = handler.handle_event(media_message(Some(0), "AA=="));
        assert_eq!(error_code(&effects), Some(1005));

        let effects = handler.handle_event(mark_message("m"));
        assert_eq!(error_code(&effects), Some(1005));

        let effects = handler.handle_event(WireMessage::bare(StreamEvent::Clear));
        assert_eq!(error_code(&effects), Some(1005));
    }

    #[test]
    fn test_invalid_payload_leaves_session_alone() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));

        let effects = handler.handle_event(media_message(Some(0), "not base64!"));
        assert_eq!(error_code(&effects), Some(1001));
        assert_eq!(handler.session().buffered_chunks(), 0);
        assert!(handler.session().is_active());
    }

    #[test]
    fn test_duplicate_chunk_is_rejected() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));

        assert!(error_code(&handler.handle_event(media_message(Some(3), "AA=="))).is_none());
        let effects = handler.handle_event(media_message(Some(3), "AQ=="));
        assert_eq!(error_code(&effects), Some(1004));
        assert_eq!(handler.session().buffered_chunks(), 1);
    }

    #[test]
    fn test_missing_index_after_max_chunk_is_rejected() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));

        assert!(error_code(&handler.handle_event(media_message(Some(u64::MAX), "AA=="))).is_none());
        let effects = handler.handle_event(media_message(None, "AQ=="));
        assert_eq!(error_code(&effects), Some(1001));
        assert_eq!(handler.session().buffered_chunks(), 1);

        // The session keeps going
        let effects = handler.handle_event(mark_message("boundary"));
        assert!(effects.iter().any(|e| matches!(e, Effect::Process(job) if job.audio == vec![0x00])));
    }

    #[test]
    fn test_media_is_mirrored_to_observers() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));
        let effects = handler.handle_event(media_message(Some(0), "AA=="));
        assert!(matches!(effects.as_slice(), [Effect::Broadcast(m)] if m.event.name() == "media"));
    }

    #[test]
    fn test_mark_with_empty_buffer_only_forwards() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));

        let effects = handler.handle_event(mark_message("boundary"));
        assert_eq!(effects.len(), 1);
        assert!(matches!(&effects[0], Effect::Broadcast(m) if m.event == StreamEvent::mark("boundary")));
    }

    #[test]
    fn test_mark_consolidates_buffered_chunks() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));
        handler.handle_event(media_message(Some(1), "Yg=="));
        handler.handle_event(media_message(Some(0), "SGk="));
        // No index: goes after the highest one
        handler.handle_event(media_message(None, "IQ=="));

        let effects = handler.handle_event(mark_message("boundary"));
        let job = effects
            .iter()
            .find_map(|e| match e {
                Effect::Process(job) => Some(job),
                _ => None,
            })
            .expect("mark should trigger the pipeline");
        assert_eq!(job.audio, b"Hib!".to_vec());
        assert_eq!(handler.session().buffered_chunks(), 0);
    }

    fn process_job(effects: Vec<Effect>) -> Option<UtteranceJob> {
        effects.into_iter().find_map(|e| match e {
            Effect::Process(job) => Some(job),
            _ => None,
        })
    }

    #[test]
    fn test_media_during_pipeline_run_starts_a_new_utterance() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));
        handler.handle_event(media_message(Some(0), "SGk="));
        let first = process_job(handler.handle_event(mark_message("utterance-1"))).unwrap();
        assert_eq!(first.audio, b"Hi".to_vec());

        // The caller keeps talking while the first reply is being produced
        assert!(error_code(&handler.handle_event(media_message(Some(0), "Yg=="))).is_none());
        let effects = handler.handle_pipeline_result(
            first.generation,
            Ok(PipelineOutput {
                transcript: "hi".to_string(),
                reply: "hello there".to_string(),
                audio: vec![0xFF; 80],
            }),
        );
        assert_eq!(replies(&effects).len(), 2);
        assert_eq!(handler.session().buffered_chunks(), 1);

        let second = process_job(handler.handle_event(mark_message("utterance-2"))).unwrap();
        assert_eq!(second.audio, b"b".to_vec());
        assert_eq!(second.generation, first.generation);
        assert_eq!(second.history.len(), 2);
        assert_eq!(second.peer.as_deref(), Some(CALLER));
    }

    #[test]
    fn test_pending_mark_is_acknowledged() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));
        handler.handle_event(mark_message(INITIAL_MARK));
        assert_eq!(handler.session().pending_marks().count(), 0);
    }

    #[test]
    fn test_clear_flushes_marks_then_acks() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));
        handler.handle_relay("observer", StreamEvent::mark("extra"));

        let effects = handler.handle_event(WireMessage::bare(StreamEvent::Clear));
        let events: Vec<&StreamEvent> = replies(&effects).iter().map(|m| &m.event).collect();
        assert_eq!(
            events,
            vec![&StreamEvent::mark(INITIAL_MARK), &StreamEvent::mark("extra"), &StreamEvent::Clear]
        );
        assert_eq!(handler.session().pending_marks().count(), 0);
    }

    #[test]
    fn test_pipeline_reply_is_spoken() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));
        let generation = handler.session().generation();

        let effects = handler.handle_pipeline_result(
            generation,
            Ok(PipelineOutput {
                transcript: "hello".to_string(),
                reply: "hi".to_string(),
                audio: vec![0xFF; 80],
            }),
        );
        let names: Vec<&str> = replies(&effects).iter().map(|m| m.event.name()).collect();
        assert_eq!(names, vec!["media", "mark"]);
        assert!(replies(&effects).iter().all(|m| m.stream_sid.as_deref() == Some("MZ1")));
    }

    #[test]
    fn test_stale_reply_is_discarded() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));
        let generation = handler.session().generation();
        handler.handle_event(WireMessage::bare(StreamEvent::Stop {
            stop: StopMetadata::default(),
        }));

        let effects = handler.handle_pipeline_result(
            generation,
            Ok(PipelineOutput {
                transcript: "hello".to_string(),
                reply: "hi".to_string(),
                audio: vec![0xFF; 80],
            }),
        );
        assert!(effects.is_empty());
        assert_eq!(handler.stats.snapshot().stale_replies_discarded, 1);
    }

    #[test]
    fn test_pipeline_failure_reports_1002() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));
        let generation = handler.session().generation();

        let effects = handler.handle_pipeline_result(generation, Err("stt offline".to_string()));
        assert_eq!(error_code(&effects), Some(1002));
        assert!(handler.session().is_active());
    }

    #[test]
    fn test_stop_persists_conversation() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));
        let generation = handler.session().generation();
        handler.handle_pipeline_result(
            generation,
            Ok(PipelineOutput {
                transcript: "hello".to_string(),
                reply: "hi".to_string(),
                audio: Vec::new(),
            }),
        );

        let effects = handler.handle_event(WireMessage::bare(StreamEvent::Stop {
            stop: StopMetadata::default(),
        }));
        let record = effects
            .iter()
            .find_map(|e| match e {
                Effect::PersistTranscript(record) => Some(record),
                _ => None,
            })
            .expect("stop should persist the transcript");
        assert_eq!(record.stream_id, "MZ1");
        assert_eq!(record.turns.len(), 2);
        assert!(!handler.session().is_active());
    }

    #[test]
    fn test_restart_drops_buffered_audio() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));
        handler.handle_event(media_message(Some(0), "AA=="));
        let first_generation = handler.session().generation();

        let effects = handler.handle_event(start_message("MZ2"));
        assert_eq!(replies(&effects)[0].sequence(), Some(1));
        assert_eq!(handler.session().stream_id(), Some("MZ2"));
        assert_eq!(handler.session().buffered_chunks(), 0);
        assert!(handler.session().generation() > first_generation);
    }

    #[test]
    fn test_unknown_frame_reports_1000() {
        let mut handler = handler();
        let error = WireMessage::decode(r#"{"event":"bogus"}"#).unwrap_err();
        let effects = handler.handle_decode_error(error);
        assert_eq!(error_code(&effects), Some(1000));
    }

    #[test]
    fn test_observer_relay_is_restamped() {
        let mut handler = handler();
        handler.handle_event(start_message("MZ1"));

        let effects = handler.handle_relay(
            "observer",
            StreamEvent::Media {
                media: MediaPayload {
                    payload: "//8=".to_string(),
                    track: None,
                    chunk: Some("99".to_string()),
                    timestamp: None,
                },
            },
        );
        let sent = replies(&effects);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].stream_sid.as_deref(), Some("MZ1"));
        match &sent[0].event {
            StreamEvent::Media { media } => assert_eq!(media.chunk.as_deref(), Some("1")),
            other => panic!("expected media, got {:?}", other),
        }
    }

    #[test]
    fn test_browser_without_primary_gets_1005() {
        let mut browser = BrowserHandler::new("obs-1", Arc::new(ConnectionManager::default()));
        let effects = browser.handle_event(media_message(Some(0), "AA=="));
        assert_eq!(error_code(&effects), Some(1005));
    }

    #[test]
    fn test_browser_cannot_start_streams() {
        let mut browser = BrowserHandler::new("obs-1", Arc::new(ConnectionManager::default()));
        let effects = browser.handle_event(start_message("MZ1"));
        assert_eq!(error_code(&effects), Some(1000));
        assert_eq!(browser.role(), PeerRole::Observer);
    }
}
