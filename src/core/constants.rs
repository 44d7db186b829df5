//! Engine ABI constants.
//!
//! These values are part of the engine's binary contract and are mirrored
//! verbatim; changing any of them breaks compatibility with prebuilt engines.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

pub const ENGINE_VERSION_MAJOR: u32 = 2;
pub const ENGINE_VERSION_MINOR: u32 = 6;
pub const ENGINE_VERSION_PATCH: u32 = 5;

/// Packed engine version, `(major << 16) | (minor << 8) | patch`.
pub const ENGINE_VERSION: u32 =
    (ENGINE_VERSION_MAJOR << 16) | (ENGINE_VERSION_MINOR << 8) | ENGINE_VERSION_PATCH;

/// Delivery policy bits attached to a packet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketFlags(u32);

impl PacketFlags {
    pub const NONE: Self = Self(0);
    /// Must be received by the target peer and resent until delivered.
    pub const RELIABLE: Self = Self(1);
    /// Not sequenced with other packets; may arrive out of order.
    pub const UNSEQUENCED: Self = Self(1 << 1);
    /// The engine does not copy the payload; the caller keeps it alive.
    pub const NO_ALLOCATE: Self = Self(1 << 2);
    /// Fragment unreliably instead of promoting to reliable when oversized.
    pub const UNRELIABLE_FRAGMENT: Self = Self(1 << 3);
    /// Bypass the engine's throttle.
    pub const UNTHROTTLED: Self = Self(1 << 4);
    /// Set by the engine once every fragment has been sent.
    pub const SENT: Self = Self(1 << 8);

    const ALL: u32 = 1 | (1 << 1) | (1 << 2) | (1 << 3) | (1 << 4) | (1 << 8);

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keeps only the bits the engine defines.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PacketFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PacketFlags, &str); 6] = [
            (PacketFlags::RELIABLE, "RELIABLE"),
            (PacketFlags::UNSEQUENCED, "UNSEQUENCED"),
            (PacketFlags::NO_ALLOCATE, "NO_ALLOCATE"),
            (PacketFlags::UNRELIABLE_FRAGMENT, "UNRELIABLE_FRAGMENT"),
            (PacketFlags::UNTHROTTLED, "UNTHROTTLED"),
            (PacketFlags::SENT, "SENT"),
        ];

        if self.is_empty() {
            return f.write_str("PacketFlags(NONE)");
        }
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "PacketFlags({})", names.join(" | "))
    }
}

/// Connection state of a peer. Driven entirely by the engine; the bridge only observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum PeerState {
    Disconnected = 0,
    Connecting = 1,
    AcknowledgingConnect = 2,
    ConnectionPending = 3,
    ConnectionSucceeded = 4,
    Connected = 5,
    DisconnectLater = 6,
    Disconnecting = 7,
    AcknowledgingDisconnect = 8,
    Zombie = 9,
}

impl TryFrom<i32> for PeerState {
    type Error = i32;

    fn try_from(value: i32) -> std::result::Result<Self, i32> {
        Ok(match value {
            0 => PeerState::Disconnected,
            1 => PeerState::Connecting,
            2 => PeerState::AcknowledgingConnect,
            3 => PeerState::ConnectionPending,
            4 => PeerState::ConnectionSucceeded,
            5 => PeerState::Connected,
            6 => PeerState::DisconnectLater,
            7 => PeerState::Disconnecting,
            8 => PeerState::AcknowledgingDisconnect,
            9 => PeerState::Zombie,
            other => return Err(other),
        })
    }
}

/// Kind of event produced by servicing a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum EventType {
    #[default]
    None = 0,
    Connect = 1,
    Disconnect = 2,
    Receive = 3,
}

impl TryFrom<i32> for EventType {
    type Error = i32;

    fn try_from(value: i32) -> std::result::Result<Self, i32> {
        Ok(match value {
            0 => EventType::None,
            1 => EventType::Connect,
            2 => EventType::Disconnect,
            3 => EventType::Receive,
            other => return Err(other),
        })
    }
}
