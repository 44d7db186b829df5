//! # Loopback Engine
//!
//! An in-process engine honouring the same observable contract as the native
//! one: hosts bind addresses, peers connect and disconnect, packets travel
//! between hosts created on the same engine instance, and `host_service`
//! blocks for at most its timeout.
//!
//! Delivery is immediate and lossless. There is no retransmission, no
//! sequencing beyond FIFO and no throttling; those belong to a real engine.
//!
//! ## Delivery Model
//! - Outgoing work queues on the sending host and moves on `flush`/`service`
//! - A connection attempt with no listener stays `Connecting` until the
//!   connect timeout, then surfaces as a Disconnect event
//! - Received packets are fresh copies owned by whoever takes the event

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::{ServiceConfig, DEFAULT_CONNECT_TIMEOUT, MAX_CHANNEL_LIMIT, MAX_PEER_LIMIT};
use crate::core::address::Address;
use crate::core::constants::{EventType, PacketFlags, PeerState};
use crate::engine::{Engine, RawEvent, RawHost, RawPacket, RawPeer, RawService};

/// Round-trip time reported before a connection is established.
const INITIAL_ROUND_TRIP_TIME: u32 = 500;

/// First port handed to hosts created without an address.
const EPHEMERAL_PORT_BASE: u16 = 49152;

const SEND_FAILED: i32 = -1;
const SERVICE_FAILED: i32 = -1;

struct SimHost {
    address: Option<Address>,
    ephemeral: Address,
    peer_limit: usize,
    channel_limit: usize,
    peers: Vec<usize>,
    events: VecDeque<RawEvent>,
    outgoing: VecDeque<Outgoing>,
}

impl SimHost {
    fn public_address(&self) -> Address {
        self.address.unwrap_or(self.ephemeral)
    }
}

struct SimPeer {
    host: usize,
    remote: Option<usize>,
    address: Address,
    state: PeerState,
    channel_count: usize,
    connect_data: u32,
    round_trip_time: u32,
    deadline: Option<Instant>,
}

struct SimPacket {
    data: Vec<u8>,
    flags: PacketFlags,
}

enum Outgoing {
    Packet { peer: usize, channel: u8, packet: usize },
    Disconnect { peer: usize, data: u32 },
}

#[derive(Default)]
struct Network {
    next_id: usize,
    init_depth: u32,
    // Set when an event lands on any host; cleared once waiters are woken.
    pending_wakeup: bool,
    hosts: HashMap<usize, SimHost>,
    peers: HashMap<usize, SimPeer>,
    packets: HashMap<usize, SimPacket>,
}

fn is_unspecified(addr: &Address) -> bool {
    addr.host() == [0u8; 16] || (addr.is_ipv4_mapped() && addr.host()[12..] == [0, 0, 0, 0])
}

fn event(
    kind: EventType,
    peer: usize,
    channel_id: u8,
    data: u32,
    packet: Option<usize>,
) -> RawEvent {
    RawEvent {
        kind,
        peer: RawPeer::new(peer),
        channel_id,
        data,
        packet: packet.and_then(RawPacket::new),
    }
}

impl Network {
    fn alloc_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn push_event(&mut self, host: usize, ev: RawEvent) {
        if let Some(h) = self.hosts.get_mut(&host) {
            h.events.push_back(ev);
            self.pending_wakeup = true;
        }
    }

    fn port_in_use(&self, wanted: &Address) -> bool {
        self.hosts
            .values()
            .filter_map(|h| h.address.as_ref())
            .any(|bound| {
                bound.port() == wanted.port()
                    && (bound.host() == wanted.host()
                        || is_unspecified(bound)
                        || is_unspecified(wanted))
            })
    }

    fn find_listener(&self, target: &Address, exclude: usize) -> Option<usize> {
        self.hosts
            .iter()
            .filter(|(id, _)| **id != exclude)
            .find(|(_, h)| {
                h.address.as_ref().is_some_and(|bound| {
                    bound.port() == target.port()
                        && (bound.host() == target.host() || is_unspecified(bound))
                })
            })
            .map(|(id, _)| *id)
    }

    /// A disconnected or zombie peer slot on `host`, or a fresh one while
    /// under the limit.
    fn claim_peer_slot(&mut self, host: usize) -> Option<usize> {
        let h = self.hosts.get(&host)?;
        let reusable = h.peers.iter().copied().find(|p| {
            self.peers.get(p).is_some_and(|peer| {
                matches!(peer.state, PeerState::Disconnected | PeerState::Zombie)
            })
        });
        if reusable.is_some() {
            return reusable;
        }
        if h.peers.len() >= h.peer_limit {
            return None;
        }

        let id = self.alloc_id();
        self.peers.insert(
            id,
            SimPeer {
                host,
                remote: None,
                address: Address::default(),
                state: PeerState::Disconnected,
                channel_count: 1,
                connect_data: 0,
                round_trip_time: INITIAL_ROUND_TRIP_TIME,
                deadline: None,
            },
        );
        if let Some(h) = self.hosts.get_mut(&host) {
            h.peers.push(id);
        }
        Some(id)
    }

    fn drop_queued_packets(&mut self, peer: usize) {
        let Some(host) = self.peers.get(&peer).map(|p| p.host) else {
            return;
        };
        let mut dropped = Vec::new();
        if let Some(h) = self.hosts.get_mut(&host) {
            h.outgoing.retain(|item| match item {
                Outgoing::Packet { peer: p, packet, .. } if *p == peer => {
                    dropped.push(*packet);
                    false
                }
                _ => true,
            });
        }
        for packet in dropped {
            self.packets.remove(&packet);
        }
    }

    fn reset_peer(&mut self, peer: usize, state: PeerState) {
        if let Some(p) = self.peers.get_mut(&peer) {
            p.state = state;
            p.remote = None;
            p.deadline = None;
            p.round_trip_time = INITIAL_ROUND_TRIP_TIME;
        }
    }

    /// Tears down both ends of a connection, notifying each side.
    fn complete_disconnect(&mut self, peer: usize, data: u32) {
        let Some((host, remote, state)) = self.peers.get(&peer).map(|p| (p.host, p.remote, p.state))
        else {
            return;
        };
        if matches!(state, PeerState::Disconnected | PeerState::Zombie) {
            return;
        }
        if let Some(remote) = remote {
            if let Some(remote_host) = self.peers.get(&remote).map(|p| p.host) {
                self.reset_peer(remote, PeerState::Disconnected);
                self.push_event(remote_host, event(EventType::Disconnect, remote, 0, data, None));
            }
        }
        self.reset_peer(peer, PeerState::Disconnected);
        self.push_event(host, event(EventType::Disconnect, peer, 0, 0, None));
    }

    fn try_accept(&mut self, host: usize, peer: usize) {
        let Some(target) = self.peers.get(&peer).map(|p| p.address) else {
            return;
        };
        let Some(listener) = self.find_listener(&target, host) else {
            return;
        };
        let Some(remote) = self.claim_peer_slot(listener) else {
            trace!(listener, "Listener has no free peer slot");
            return;
        };

        let origin = match self.hosts.get(&host) {
            Some(h) => h.public_address(),
            None => return,
        };
        let listener_channels = self.hosts.get(&listener).map_or(1, |h| h.channel_limit);
        let (channel_count, connect_data) = match self.peers.get_mut(&peer) {
            Some(p) => {
                p.state = PeerState::Connected;
                p.remote = Some(remote);
                p.deadline = None;
                p.round_trip_time = 1;
                p.channel_count = p.channel_count.min(listener_channels);
                (p.channel_count, p.connect_data)
            }
            None => return,
        };
        if let Some(r) = self.peers.get_mut(&remote) {
            r.state = PeerState::Connected;
            r.remote = Some(peer);
            r.address = origin;
            r.channel_count = channel_count;
            r.connect_data = connect_data;
            r.round_trip_time = 1;
            r.deadline = None;
        }

        self.push_event(listener, event(EventType::Connect, remote, 0, connect_data, None));
        self.push_event(host, event(EventType::Connect, peer, 0, 0, None));
        debug!(host, peer, listener, remote, "Loopback connection established");
    }

    fn deliver(&mut self, peer: usize, channel: u8, packet: usize) {
        let Some(SimPacket { data, flags }) = self.packets.remove(&packet) else {
            return;
        };
        let link = self
            .peers
            .get(&peer)
            .filter(|p| matches!(p.state, PeerState::Connected | PeerState::DisconnectLater))
            .and_then(|p| p.remote)
            .and_then(|remote| self.peers.get(&remote).map(|r| (remote, r.host)));

        if let Some((remote, remote_host)) = link {
            let copy = self.alloc_id();
            self.packets.insert(
                copy,
                SimPacket {
                    data,
                    flags: flags.without(PacketFlags::SENT),
                },
            );
            self.push_event(remote_host, event(EventType::Receive, remote, channel, 0, Some(copy)));
        }
    }

    fn flush(&mut self, host: usize) {
        let connecting: Vec<usize> = match self.hosts.get(&host) {
            Some(h) => h
                .peers
                .iter()
                .copied()
                .filter(|p| {
                    self.peers
                        .get(p)
                        .is_some_and(|peer| peer.state == PeerState::Connecting)
                })
                .collect(),
            None => return,
        };
        for peer in connecting {
            self.try_accept(host, peer);
        }

        while let Some(item) = self.hosts.get_mut(&host).and_then(|h| h.outgoing.pop_front()) {
            match item {
                Outgoing::Packet {
                    peer,
                    channel,
                    packet,
                } => self.deliver(peer, channel, packet),
                Outgoing::Disconnect { peer, data } => self.complete_disconnect(peer, data),
            }
        }
    }

    /// Times out unanswered connection attempts; returns the nearest pending deadline.
    fn expire(&mut self, host: usize, now: Instant) -> Option<Instant> {
        let peers = self.hosts.get(&host).map(|h| h.peers.clone()).unwrap_or_default();
        let mut next = None;
        for peer in peers {
            let Some(deadline) = self.peers.get(&peer).and_then(|p| p.deadline) else {
                continue;
            };
            if deadline <= now {
                self.reset_peer(peer, PeerState::Disconnected);
                self.push_event(host, event(EventType::Disconnect, peer, 0, 0, None));
                debug!(host, peer, "Loopback connection attempt timed out");
            } else {
                next = Some(next.map_or(deadline, |n: Instant| n.min(deadline)));
            }
        }
        next
    }
}

/// In-process engine; see the module docs for its delivery model.
pub struct LoopbackEngine {
    net: Mutex<Network>,
    wakeup: Condvar,
    connect_timeout: Duration,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Engine whose unanswered connects give up after
    /// `config.connect_timeout`.
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::with_connect_timeout(config.connect_timeout)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            net: Mutex::new(Network::default()),
            wakeup: Condvar::new(),
            connect_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Network> {
        self.net.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Packets currently allocated, whether caller- or engine-owned.
    pub fn live_packets(&self) -> usize {
        self.lock().packets.len()
    }

    /// Hosts currently alive.
    pub fn live_hosts(&self) -> usize {
        self.lock().hosts.len()
    }

    /// Current `initialize` nesting depth.
    pub fn init_depth(&self) -> u32 {
        self.lock().init_depth
    }
}

impl Engine for LoopbackEngine {
    fn name(&self) -> &str {
        "loopback"
    }

    fn initialize(&self) -> i32 {
        self.lock().init_depth += 1;
        0
    }

    fn deinitialize(&self) {
        let mut net = self.lock();
        net.init_depth = net.init_depth.saturating_sub(1);
    }

    fn host_create(
        &self,
        address: Option<&Address>,
        peer_limit: usize,
        channel_limit: usize,
        _incoming_bandwidth: u32,
        _outgoing_bandwidth: u32,
    ) -> Option<RawHost> {
        if peer_limit > MAX_PEER_LIMIT {
            return None;
        }
        let mut net = self.lock();
        if let Some(addr) = address {
            if addr.port() != 0 && net.port_in_use(addr) {
                debug!(%addr, "Loopback address already bound");
                return None;
            }
        }

        let id = net.alloc_id();
        let channel_limit = match channel_limit {
            0 => MAX_CHANNEL_LIMIT,
            n => n.min(MAX_CHANNEL_LIMIT),
        };
        let ephemeral_port = EPHEMERAL_PORT_BASE.wrapping_add((id % 16384) as u16);
        net.hosts.insert(
            id,
            SimHost {
                address: address.copied(),
                ephemeral: Address::from_ipv4(127, 0, 0, 1, ephemeral_port),
                peer_limit,
                channel_limit,
                peers: Vec::new(),
                events: VecDeque::new(),
                outgoing: VecDeque::new(),
            },
        );
        RawHost::new(id)
    }

    fn host_destroy(&self, host: RawHost) {
        let mut net = self.lock();
        let Some(h) = net.hosts.remove(&host.get()) else {
            return;
        };

        for item in &h.outgoing {
            if let Outgoing::Packet { packet, .. } = item {
                net.packets.remove(packet);
            }
        }
        for ev in &h.events {
            if let Some(packet) = ev.packet {
                net.packets.remove(&packet.get());
            }
        }
        for peer in &h.peers {
            if let Some(p) = net.peers.remove(peer) {
                if let Some(remote) = p.remote {
                    if let Some(remote_host) = net.peers.get(&remote).map(|r| r.host) {
                        net.reset_peer(remote, PeerState::Disconnected);
                        let closed = event(EventType::Disconnect, remote, 0, 0, None);
                        net.push_event(remote_host, closed);
                    }
                }
            }
        }
        drop(net);
        self.wakeup.notify_all();
    }

    fn host_connect(
        &self,
        host: RawHost,
        address: &Address,
        channel_count: usize,
        data: u32,
    ) -> Option<RawPeer> {
        let mut net = self.lock();
        let channel_limit = net.hosts.get(&host.get())?.channel_limit;
        let peer = net.claim_peer_slot(host.get())?;
        let deadline = Instant::now() + self.connect_timeout;

        let p = net.peers.get_mut(&peer)?;
        p.state = PeerState::Connecting;
        p.remote = None;
        p.address = *address;
        p.channel_count = channel_count.clamp(1, channel_limit);
        p.connect_data = data;
        p.round_trip_time = INITIAL_ROUND_TRIP_TIME;
        p.deadline = Some(deadline);
        RawPeer::new(peer)
    }

    fn host_service(&self, host: RawHost, timeout_ms: u32) -> RawService {
        let until = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        let mut net = self.lock();

        loop {
            if !net.hosts.contains_key(&host.get()) {
                return RawService::Failed(SERVICE_FAILED);
            }
            net.flush(host.get());
            let now = Instant::now();
            let next_deadline = net.expire(host.get(), now);
            if std::mem::take(&mut net.pending_wakeup) {
                self.wakeup.notify_all();
            }

            if let Some(ev) = net
                .hosts
                .get_mut(&host.get())
                .and_then(|h| h.events.pop_front())
            {
                return RawService::Event(ev);
            }
            if now >= until {
                return RawService::Idle;
            }

            let wake_at = next_deadline.map_or(until, |d| d.min(until));
            let wait = wake_at.saturating_duration_since(now);
            net = self
                .wakeup
                .wait_timeout(net, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn host_flush(&self, host: RawHost) {
        let mut net = self.lock();
        net.flush(host.get());
        if std::mem::take(&mut net.pending_wakeup) {
            self.wakeup.notify_all();
        }
    }

    fn host_broadcast(&self, host: RawHost, channel_id: u8, packet: RawPacket) {
        let mut net = self.lock();
        let Some(original) = net.packets.remove(&packet.get()) else {
            return;
        };
        let targets: Vec<usize> = match net.hosts.get(&host.get()) {
            Some(h) => h
                .peers
                .iter()
                .copied()
                .filter(|p| {
                    net.peers.get(p).is_some_and(|peer| {
                        peer.state == PeerState::Connected
                            && usize::from(channel_id) < peer.channel_count
                    })
                })
                .collect(),
            None => return,
        };

        for peer in targets {
            let copy = net.alloc_id();
            net.packets.insert(
                copy,
                SimPacket {
                    data: original.data.clone(),
                    flags: original.flags | PacketFlags::SENT,
                },
            );
            if let Some(h) = net.hosts.get_mut(&host.get()) {
                h.outgoing.push_back(Outgoing::Packet {
                    peer,
                    channel: channel_id,
                    packet: copy,
                });
            }
        }
    }

    fn packet_create(&self, data: &[u8], flags: PacketFlags) -> Option<RawPacket> {
        // `data` is always copied, so the no-allocate hint never survives.
        let mut net = self.lock();
        let id = net.alloc_id();
        net.packets.insert(
            id,
            SimPacket {
                data: data.to_vec(),
                flags: flags.without(PacketFlags::NO_ALLOCATE),
            },
        );
        RawPacket::new(id)
    }

    fn packet_destroy(&self, packet: RawPacket) {
        self.lock().packets.remove(&packet.get());
    }

    fn peer_send(&self, peer: RawPeer, channel_id: u8, packet: RawPacket) -> i32 {
        let mut net = self.lock();
        let host = match net.peers.get(&peer.get()) {
            Some(p)
                if p.state == PeerState::Connected
                    && usize::from(channel_id) < p.channel_count =>
            {
                p.host
            }
            _ => return SEND_FAILED,
        };
        match net.packets.get_mut(&packet.get()) {
            Some(p) => p.flags |= PacketFlags::SENT,
            None => return SEND_FAILED,
        }
        match net.hosts.get_mut(&host) {
            Some(h) => {
                h.outgoing.push_back(Outgoing::Packet {
                    peer: peer.get(),
                    channel: channel_id,
                    packet: packet.get(),
                });
                0
            }
            None => SEND_FAILED,
        }
    }

    fn peer_disconnect(&self, peer: RawPeer, data: u32) {
        let mut net = self.lock();
        let Some((host, state)) = net.peers.get(&peer.get()).map(|p| (p.host, p.state)) else {
            return;
        };
        match state {
            PeerState::Connected | PeerState::DisconnectLater => {
                net.drop_queued_packets(peer.get());
                if let Some(p) = net.peers.get_mut(&peer.get()) {
                    p.state = PeerState::Disconnecting;
                }
                if let Some(h) = net.hosts.get_mut(&host) {
                    h.outgoing.push_back(Outgoing::Disconnect {
                        peer: peer.get(),
                        data,
                    });
                }
            }
            PeerState::Disconnected | PeerState::Disconnecting | PeerState::Zombie => {}
            _ => net.reset_peer(peer.get(), PeerState::Disconnected),
        }
    }

    fn peer_disconnect_later(&self, peer: RawPeer, data: u32) {
        let mut net = self.lock();
        let Some((host, state)) = net.peers.get(&peer.get()).map(|p| (p.host, p.state)) else {
            return;
        };
        if state != PeerState::Connected {
            drop(net);
            return self.peer_disconnect(peer, data);
        }
        if let Some(p) = net.peers.get_mut(&peer.get()) {
            p.state = PeerState::DisconnectLater;
        }
        if let Some(h) = net.hosts.get_mut(&host) {
            h.outgoing.push_back(Outgoing::Disconnect {
                peer: peer.get(),
                data,
            });
        }
    }

    fn peer_disconnect_now(&self, peer: RawPeer, _data: u32) {
        let mut net = self.lock();
        let Some(remote) = net.peers.get(&peer.get()).map(|p| p.remote) else {
            return;
        };
        net.drop_queued_packets(peer.get());
        // The remote end is torn down without an event and its slot is free again.
        if let Some(remote) = remote {
            net.drop_queued_packets(remote);
            net.reset_peer(remote, PeerState::Disconnected);
        }
        net.reset_peer(peer.get(), PeerState::Disconnected);
    }

    fn peer_address(&self, peer: RawPeer) -> Address {
        self.lock()
            .peers
            .get(&peer.get())
            .map(|p| p.address)
            .unwrap_or_default()
    }

    fn peer_round_trip_time(&self, peer: RawPeer) -> u32 {
        self.lock()
            .peers
            .get(&peer.get())
            .map_or(0, |p| p.round_trip_time)
    }

    fn peer_state(&self, peer: RawPeer) -> i32 {
        self.lock()
            .peers
            .get(&peer.get())
            .map_or(PeerState::Disconnected as i32, |p| p.state as i32)
    }

    fn packet_data(&self, packet: RawPacket) -> Vec<u8> {
        self.lock()
            .packets
            .get(&packet.get())
            .map(|p| p.data.clone())
            .unwrap_or_default()
    }

    fn packet_len(&self, packet: RawPacket) -> usize {
        self.lock()
            .packets
            .get(&packet.get())
            .map_or(0, |p| p.data.len())
    }

    fn packet_flags(&self, packet: RawPacket) -> PacketFlags {
        self.lock()
            .packets
            .get(&packet.get())
            .map_or(PacketFlags::NONE, |p| p.flags)
    }
}
