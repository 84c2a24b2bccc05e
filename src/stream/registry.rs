//! # Connection Manager
//!
//! Tracks who is connected: at most one primary telephony stream and any number
//! of browser observers. Lives in [`crate::state::AppState`] and is shared by
//! every connection actor.
//!
//! ## Thread Safety:
//! Both tables sit behind `parking_lot::Mutex`. Locks are held only long enough
//! to copy recipients out; messages are sent after the lock is released.

use crate::protocol::{StreamEvent, WireMessage};
use actix::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// A copy of primary-stream traffic for an observer.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct Broadcast(pub WireMessage);

/// An event an observer wants injected into the primary stream.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct RelayToPrimary {
    pub from: String,
    pub event: StreamEvent,
}

struct PrimarySlot {
    connection_id: String,
    recipient: Option<Recipient<RelayToPrimary>>,
}

/// Registry of live connections.
#[derive(Default)]
pub struct ConnectionManager {
    primary: Mutex<Option<PrimarySlot>>,
    observers: Mutex<HashMap<String, Recipient<Broadcast>>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("primary", &self.primary_id())
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl ConnectionManager {
    /// Claim the primary slot for `connection_id`.
    ///
    /// Check-and-set happens under one lock, so of two simultaneous attempts
    /// exactly one wins. The loser must be refused without touching anything.
    pub fn reserve_primary(&self, connection_id: &str) -> bool {
        let mut primary = self.primary.lock();
        if let Some(existing) = primary.as_ref() {
            tracing::warn!(
                existing = %existing.connection_id,
                rejected = %connection_id,
                "Primary slot already taken"
            );
            return false;
        }
        *primary = Some(PrimarySlot {
            connection_id: connection_id.to_string(),
            recipient: None,
        });
        true
    }

    /// Give the reserved primary a mailbox for observer relays.
    pub fn attach_primary(&self, connection_id: &str, recipient: Recipient<RelayToPrimary>) {
        let mut primary = self.primary.lock();
        match primary.as_mut() {
            Some(slot) if slot.connection_id == connection_id => slot.recipient = Some(recipient),
            _ => tracing::warn!(connection_id, "Attach for a primary that does not hold the slot"),
        }
    }

    /// Release the slot, but only if `connection_id` holds it.
    pub fn release_primary(&self, connection_id: &str) -> bool {
        let mut primary = self.primary.lock();
        if primary.as_ref().map(|slot| slot.connection_id.as_str()) == Some(connection_id) {
            *primary = None;
            true
        } else {
            false
        }
    }

    pub fn primary_id(&self) -> Option<String> {
        self.primary.lock().as_ref().map(|slot| slot.connection_id.clone())
    }

    pub fn has_primary(&self) -> bool {
        self.primary.lock().is_some()
    }

    pub fn register(&self, connection_id: &str, recipient: Recipient<Broadcast>) {
        let count = {
            let mut observers = self.observers.lock();
            observers.insert(connection_id.to_string(), recipient);
            observers.len()
        };
        tracing::info!(connection_id, observers = count, "Observer registered");
    }

    pub fn unregister(&self, connection_id: &str) -> bool {
        let removed = self.observers.lock().remove(connection_id).is_some();
        if removed {
            tracing::info!(connection_id, "Observer unregistered");
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Send a copy of `message` to every observer. Returns how many received it.
    ///
    /// Observers whose mailbox has closed are dropped from the registry.
    pub fn broadcast(&self, message: &WireMessage) -> usize {
        let recipients: Vec<(String, Recipient<Broadcast>)> = self
            .observers
            .lock()
            .iter()
            .map(|(id, recipient)| (id.clone(), recipient.clone()))
            .collect();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, recipient) in recipients {
            match recipient.try_send(Broadcast(message.clone())) {
                Ok(()) => delivered += 1,
                Err(SendError::Full(_)) => {
                    tracing::warn!(connection_id = %id, event = message.event.name(), "Observer mailbox full, dropping copy");
                }
                Err(SendError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            let mut observers = self.observers.lock();
            for id in closed {
                observers.remove(&id);
                tracing::debug!(connection_id = %id, "Pruned closed observer");
            }
        }

        delivered
    }

    /// Hand an observer's event to the primary stream.
    ///
    /// ## Returns:
    /// `false` when there is no primary, or it has not finished connecting.
    pub fn forward_to_primary(&self, from: &str, event: StreamEvent) -> bool {
        let recipient = self
            .primary
            .lock()
            .as_ref()
            .and_then(|slot| slot.recipient.clone());

        match recipient {
            Some(recipient) => recipient
                .try_send(RelayToPrimary {
                    from: from.to_string(),
                    event,
                })
                .is_ok(),
            None => false,
        }
    }
}
