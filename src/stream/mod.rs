//! # Stream Module
//!
//! Per-connection stream state and the shared registry of connections.
//!
//! ## Key Components:
//! - **Chunk Buffer**: inbound audio fragments between two marks
//! - **Stream Session**: counters, pending marks, generation, conversation
//! - **Coordinator**: cuts utterances at marks and turns replies into events
//! - **Connection Manager**: the single primary slot plus the observer set

pub mod buffer;         // Inbound chunk buffering and ordering
pub mod coordinator;    // Mark-driven utterance handling
pub mod registry;       // Shared connection registry
pub mod session;        // Per-connection stream state

pub use registry::{Broadcast, ConnectionManager, RelayToPrimary};
pub use session::{PeerRole, StreamIdentity, StreamSession};
