//! Events dispatched by servicing a host.
//!
//! Each successful poll returns a fresh [`Event`] value. Nothing is reused
//! between polls, so an event kept around after the next poll still describes
//! what it described when it was returned.

use crate::core::constants::EventType;
use crate::handle::{PacketHandle, PeerHandle};

/// One event taken from a host's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Event {
    /// What happened.
    pub kind: EventType,
    /// Peer that generated the event; null only for `EventType::None`.
    pub peer: PeerHandle,
    /// Channel the event arrived on.
    pub channel_id: u8,
    /// Connection data on Connect, disconnect reason on Disconnect.
    pub data: u32,
    /// Received packet, present only for Receive. The caller owns it and
    /// must destroy it once done.
    pub packet: Option<PacketHandle>,
}

impl Event {
    pub fn is_connect(&self) -> bool {
        self.kind == EventType::Connect
    }

    pub fn is_disconnect(&self) -> bool {
        self.kind == EventType::Disconnect
    }

    pub fn is_receive(&self) -> bool {
        self.kind == EventType::Receive
    }
}

/// Result of a successful service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// An event was dispatched.
    Occurred(Event),
    /// Nothing arrived inside the timeout window.
    NoEvent,
}

impl ServiceOutcome {
    pub fn event(self) -> Option<Event> {
        match self {
            ServiceOutcome::Occurred(event) => Some(event),
            ServiceOutcome::NoEvent => None,
        }
    }
}
