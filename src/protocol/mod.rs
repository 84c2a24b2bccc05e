//! # Message Protocol Module
//!
//! Decodes and encodes the JSON wire events and drives the per-connection
//! state machine that reacts to them.
//!
//! ## Event Handling (primary stream):
//! | Event     | Needs a stream | Reaction                                          |
//! |-----------|----------------|---------------------------------------------------|
//! | connected | no             | `connected` ack                                   |
//! | start     | no             | `start` ack, optional greeting, initial `mark`    |
//! | media     | yes            | buffer the chunk                                  |
//! | mark      | yes            | cut the utterance (if any), forward the mark      |
//! | stop      | no             | `stop` ack, then reset                            |
//! | clear     | yes            | flush pending marks, `clear` ack                  |
//! | dtmf      | no             | `dtmf` ack                                        |
//! | other     | -              | `error` 1000                                      |

pub mod machine;     // Primary and observer state machines
pub mod messages;    // Wire event types

pub use machine::{BrowserHandler, Effect, InboundEventSink, ServiceHandler};
pub use messages::{ErrorCode, MediaPayload, ProtocolError, StreamEvent, WireMessage};
