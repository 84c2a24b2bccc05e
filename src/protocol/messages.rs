//! # Wire Messages
//!
//! JSON events exchanged over the `/voicebot` and `/browser` WebSockets, one
//! event per text frame.
//!
//! ## Message Shape:
//! ```json
//! {"event": "media", "sequenceNumber": "4", "streamSid": "MZ...",
//!  "media": {"payload": "/////w==", "chunk": "2", "timestamp": "40"}}
//! ```
//! Every message carries `event`; most carry `sequenceNumber` (a decimal string)
//! and `streamSid`. The event-specific payload sits under a key named after the
//! event, except for `error` which carries `message` and `code` at the top level.
//!
//! Telephony providers are inconsistent about sending numbers as strings, so
//! `sequenceNumber`, `chunk` and `timestamp` accept either form.

use crate::audio::MediaFormat;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Numeric codes carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed JSON or an `event` tag we do not know
    UnknownEvent,
    /// Media payload is not canonical base64, or its chunk index is not a number
    InvalidPayload,
    /// Consolidation or one of the AI collaborators failed
    PipelineFailure,
    /// A primary connection is already active
    PrimaryBusy,
    /// Chunk index already buffered for the current utterance
    DuplicateChunk,
    /// media/mark/clear arrived before `start`
    NoActiveStream,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::UnknownEvent => 1000,
            ErrorCode::InvalidPayload => 1001,
            ErrorCode::PipelineFailure => 1002,
            ErrorCode::PrimaryBusy => 1003,
            ErrorCode::DuplicateChunk => 1004,
            ErrorCode::NoActiveStream => 1005,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1000 => Some(ErrorCode::UnknownEvent),
            1001 => Some(ErrorCode::InvalidPayload),
            1002 => Some(ErrorCode::PipelineFailure),
            1003 => Some(ErrorCode::PrimaryBusy),
            1004 => Some(ErrorCode::DuplicateChunk),
            1005 => Some(ErrorCode::NoActiveStream),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A protocol violation detected while handling one inbound message.
///
/// Turned into an `error` event for the sender; the session carries on.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ProtocolError {}

/// One framed wire message: the event plus its envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(flatten)]
    pub event: StreamEvent,

    #[serde(
        rename = "sequenceNumber",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_string"
    )]
    pub sequence_number: Option<String>,

    #[serde(rename = "streamSid", default, skip_serializing_if = "Option::is_none")]
    pub stream_sid: Option<String>,
}

impl WireMessage {
    /// Wrap an event without envelope fields.
    pub fn bare(event: StreamEvent) -> Self {
        Self {
            event,
            sequence_number: None,
            stream_sid: None,
        }
    }

    /// Parse one text frame. Anything that is not a known event maps to code 1000.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| {
            ProtocolError::new(ErrorCode::UnknownEvent, format!("Unrecognized message: {}", e))
        })
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Sequence number as an integer, when present and numeric.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence_number.as_deref().and_then(|s| s.parse().ok())
    }
}

/// The closed set of wire events, dispatched on the `event` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Start {
        start: StartMetadata,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        mark: MarkPayload,
    },
    Stop {
        #[serde(default)]
        stop: StopMetadata,
    },
    Clear,
    Dtmf {
        dtmf: DtmfPayload,
    },
    Error {
        message: String,
        code: u16,
    },
}

impl StreamEvent {
    /// Event name as it appears in the `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::Start { .. } => "start",
            StreamEvent::Media { .. } => "media",
            StreamEvent::Mark { .. } => "mark",
            StreamEvent::Stop { .. } => "stop",
            StreamEvent::Clear => "clear",
            StreamEvent::Dtmf { .. } => "dtmf",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn connected() -> Self {
        StreamEvent::Connected {
            protocol: Some("Call".to_string()),
            version: Some("1.0.0".to_string()),
        }
    }

    /// Outbound audio for the caller.
    pub fn media(payload: String, chunk: u64) -> Self {
        StreamEvent::Media {
            media: MediaPayload {
                payload,
                track: Some("outbound".to_string()),
                chunk: Some(chunk.to_string()),
                timestamp: None,
            },
        }
    }

    pub fn mark(name: impl Into<String>) -> Self {
        StreamEvent::Mark {
            mark: MarkPayload { name: name.into() },
        }
    }

    pub fn error(error: &ProtocolError) -> Self {
        StreamEvent::Error {
            message: error.message.clone(),
            code: error.code.code(),
        }
    }
}

/// Payload of a `start` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartMetadata {
    #[serde(rename = "accountSid", default)]
    pub account_sid: String,

    #[serde(rename = "callSid", default)]
    pub call_sid: String,

    #[serde(rename = "streamSid", default)]
    pub stream_sid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    #[serde(default)]
    pub tracks: Vec<String>,

    #[serde(rename = "mediaFormat", default)]
    pub media_format: MediaFormat,

    #[serde(
        rename = "customParameters",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub custom_parameters: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Payload of a `media` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    /// Base64 μ-law audio
    pub payload: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,

    /// Ordering index within the utterance
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub chunk: Option<String>,

    /// Milliseconds since stream start
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub timestamp: Option<String>,
}

impl MediaPayload {
    /// Chunk index, `Ok(None)` when absent, `Err` when present but not a number.
    pub fn chunk_index(&self) -> Result<Option<u64>, ProtocolError> {
        match self.chunk.as_deref() {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                ProtocolError::new(ErrorCode::InvalidPayload, format!("Chunk index is not a number: {:?}", raw))
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

/// Payload of a `stop` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopMetadata {
    #[serde(rename = "accountSid", default)]
    pub account_sid: String,

    #[serde(rename = "callSid", default)]
    pub call_sid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtmfPayload {
    pub digit: String,
}

/// Accept a JSON string or number, keeping it as text.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Text(String),
        Unsigned(u64),
        Signed(i64),
        Float(f64),
    }

    Ok(Option::<Lenient>::deserialize(deserializer)?.map(|value| match value {
        Lenient::Text(text) => text,
        Lenient::Unsigned(n) => n.to_string(),
        Lenient::Signed(n) => n.to_string(),
        Lenient::Float(n) => n.to_string(),
    }))
}
