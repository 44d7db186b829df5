//! # Engine Boundary
//!
//! The fixed set of calls the bridge is allowed to make into a transport
//! engine. Reliability, sequencing, congestion control and fragmentation all
//! live behind this trait; the bridge never duplicates them.
//!
//! ## Implementations
//! - **Native**: the ENet shared library, resolved at runtime with `libloading`
//! - **Loopback**: an in-process engine with the same observable contract,
//!   used for tests and for running without a native build
//!
//! Raw tokens (`RawHost`, `RawPeer`, `RawPacket`) are the engine's own object
//! identities, typically pointer values. They never leave the crate; callers
//! see generational handles instead.

pub mod loopback;
pub mod native;

use std::num::NonZeroUsize;

use crate::core::address::Address;
use crate::core::constants::{EventType, PacketFlags, PeerState};

macro_rules! raw_token {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroUsize);

        impl $name {
            /// Wraps a raw engine value; `None` for the null sentinel.
            pub fn new(raw: usize) -> Option<Self> {
                NonZeroUsize::new(raw).map(Self)
            }

            pub fn get(self) -> usize {
                self.0.get()
            }
        }
    };
}

raw_token!(
    /// Engine identity of a host.
    RawHost
);
raw_token!(
    /// Engine identity of a peer slot inside a host.
    RawPeer
);
raw_token!(
    /// Engine identity of a packet buffer.
    RawPacket
);

/// Event as reported by the engine, before handles are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventType,
    pub peer: Option<RawPeer>,
    pub channel_id: u8,
    pub data: u32,
    pub packet: Option<RawPacket>,
}

/// Outcome of a single engine service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawService {
    Event(RawEvent),
    Idle,
    Failed(i32),
}

/// The engine's C-style contract.
///
/// Create calls return `None` where the engine returns null; `peer_send`
/// returns the engine's status code untouched. Implementations must not
/// retain or interpret any state beyond what the engine itself exposes.
pub trait Engine: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    fn initialize(&self) -> i32;

    fn deinitialize(&self);

    fn host_create(
        &self,
        address: Option<&Address>,
        peer_limit: usize,
        channel_limit: usize,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> Option<RawHost>;

    fn host_destroy(&self, host: RawHost);

    fn host_connect(
        &self,
        host: RawHost,
        address: &Address,
        channel_count: usize,
        data: u32,
    ) -> Option<RawPeer>;

    /// Dispatches at most one event, blocking up to `timeout_ms`.
    fn host_service(&self, host: RawHost, timeout_ms: u32) -> RawService;

    fn host_flush(&self, host: RawHost);

    /// Queues `packet` for every connected peer; the engine takes ownership.
    fn host_broadcast(&self, host: RawHost, channel_id: u8, packet: RawPacket);

    fn packet_create(&self, data: &[u8], flags: PacketFlags) -> Option<RawPacket>;

    fn packet_destroy(&self, packet: RawPacket);

    /// 0 on success (ownership moves to the engine), negative on failure.
    fn peer_send(&self, peer: RawPeer, channel_id: u8, packet: RawPacket) -> i32;

    fn peer_disconnect(&self, peer: RawPeer, data: u32);

    fn peer_disconnect_later(&self, peer: RawPeer, data: u32);

    fn peer_disconnect_now(&self, peer: RawPeer, data: u32);

    fn peer_address(&self, peer: RawPeer) -> Address;

    fn peer_round_trip_time(&self, peer: RawPeer) -> u32;

    /// Raw state value; the bridge maps it onto [`PeerState`].
    fn peer_state(&self, peer: RawPeer) -> i32;

    fn packet_data(&self, packet: RawPacket) -> Vec<u8>;

    fn packet_len(&self, packet: RawPacket) -> usize;

    fn packet_flags(&self, packet: RawPacket) -> PacketFlags;
}

/// Maps an engine state value, treating anything unknown as a zombie peer.
pub(crate) fn peer_state_from_raw(raw: i32) -> PeerState {
    PeerState::try_from(raw).unwrap_or(PeerState::Zombie)
}
