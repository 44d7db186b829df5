//! # Binding API
//!
//! [`Bridge`] is the caller-facing surface over an [`Engine`]. It owns the
//! handle registries, turns every engine sentinel into an `Err`, and decides
//! which operations may run concurrently.
//!
//! ## Ownership Rules
//! - Hosts live from [`Bridge::host_create`] until [`Bridge::host_destroy`];
//!   destroying a host invalidates every peer handle obtained through it
//! - Packets are caller-owned from [`Bridge::packet_create`] (or a Receive
//!   event) until destroyed, sent successfully, or broadcast
//! - A failed send leaves the packet caller-owned
//! - Destroying the null handle is a no-op
//!
//! ## Concurrency
//! Each host carries its own lock. Every operation on a host or one of its
//! peers takes that lock, so the engine never sees concurrent calls for the
//! same host, and `host_destroy` waits for an in-flight `host_service`.
//! Distinct hosts proceed in parallel. The registry lock is never held while
//! the engine blocks.
//!
//! ## Example Usage
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use enet_bridge::bridge::Bridge;
//! use enet_bridge::core::address::Address;
//! use enet_bridge::engine::loopback::LoopbackEngine;
//!
//! let bridge = Bridge::with_engine(Arc::new(LoopbackEngine::new())).unwrap();
//! let addr = Address::from_ipv4(127, 0, 0, 1, 7777);
//! let server = bridge.host_create(Some(&addr), 8, 2, 0, 0).unwrap();
//! let outcome = bridge.host_service(server, Duration::ZERO).unwrap();
//! assert!(outcome.event().is_none());
//! bridge.host_destroy(server).unwrap();
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, instrument, trace, warn};

use crate::config::{BridgeConfig, HostConfig};
use crate::core::address::Address;
use crate::core::constants::{EventType, PacketFlags, PeerState};
use crate::core::event::{Event, ServiceOutcome};
use crate::engine::{peer_state_from_raw, Engine, RawEvent, RawHost, RawPacket, RawPeer, RawService};
use crate::error::{BridgeError, Result};
use crate::handle::{
    HostHandle, HostKind, PacketHandle, PacketKind, PeerHandle, PeerKind, Registry, ResourceKind,
};
use crate::loader;
use crate::utils::metrics::BridgeMetrics;

struct HostEntry {
    raw: RawHost,
    serial: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerStage {
    Connecting,
    Connected,
    Closed,
}

struct PeerEntry {
    raw: RawPeer,
    host: HostHandle,
    stage: PeerStage,
}

#[derive(Default)]
struct Registries {
    hosts: Registry<HostKind, HostEntry>,
    peers: Registry<PeerKind, PeerEntry>,
    peer_index: HashMap<RawPeer, PeerHandle>,
    packets: Registry<PacketKind, RawPacket>,
}

impl Registries {
    fn issue_peer(&mut self, raw: RawPeer, host: HostHandle, stage: PeerStage) -> PeerHandle {
        let handle = self.peers.insert(PeerEntry { raw, host, stage });
        self.peer_index.insert(raw, handle);
        handle
    }

    /// Invalidates the handle currently bound to an engine peer slot.
    fn retire_peer(&mut self, raw: RawPeer) {
        if let Some(old) = self.peer_index.remove(&raw) {
            let _ = self.peers.remove(old);
            trace!(peer = %old, "Retired peer handle");
        }
    }

    /// Maps an event's engine peer onto a handle.
    ///
    /// A handle names one connection: a Connect on a slot that already
    /// completed or closed a connection issues a new handle.
    fn peer_for_event(&mut self, raw: RawPeer, host: HostHandle, kind: EventType) -> PeerHandle {
        let existing = self
            .peer_index
            .get(&raw)
            .copied()
            .filter(|h| self.peers.get(*h).is_ok_and(|e| e.host == host));

        let Some(handle) = existing else {
            self.retire_peer(raw);
            let stage = match kind {
                EventType::Disconnect => PeerStage::Closed,
                _ => PeerStage::Connected,
            };
            return self.issue_peer(raw, host, stage);
        };

        let Ok(entry) = self.peers.get_mut(handle) else {
            return handle;
        };
        match kind {
            EventType::Connect if entry.stage == PeerStage::Connecting => {
                entry.stage = PeerStage::Connected;
                handle
            }
            EventType::Connect => {
                self.retire_peer(raw);
                self.issue_peer(raw, host, PeerStage::Connected)
            }
            EventType::Disconnect => {
                entry.stage = PeerStage::Closed;
                handle
            }
            _ => handle,
        }
    }

    fn drop_peers_of(&mut self, host: HostHandle) -> usize {
        let gone = self.peers.extract_if(|entry| entry.host == host);
        for (_, entry) in &gone {
            self.peer_index.remove(&entry.raw);
        }
        gone.len()
    }
}

/// Handle-based access to a transport engine.
pub struct Bridge {
    engine: Arc<dyn Engine>,
    state: Mutex<Registries>,
    max_service_timeout: Duration,
    host_defaults: HostConfig,
    metrics: BridgeMetrics,
}

impl Bridge {
    /// Bootstraps the process-wide engine and initializes it.
    pub fn open(config: &BridgeConfig) -> Result<Self> {
        for issue in config.validate() {
            warn!(%issue, "Configuration issue");
        }
        let engine = loader::bootstrap_with(&config.loader)?;
        Self::with_engine_and_config(engine, config)
    }

    /// Like [`Bridge::open`], with bundled engine binaries as the fallback
    /// when the system library cannot be loaded.
    pub fn open_with(
        config: &BridgeConfig,
        artifacts: impl loader::ArtifactSource + 'static,
    ) -> Result<Self> {
        for issue in config.validate() {
            warn!(%issue, "Configuration issue");
        }
        let engine = loader::bootstrap_with_artifacts(&config.loader, artifacts)?;
        Self::with_engine_and_config(engine, config)
    }

    /// Initializes `engine` with default settings.
    pub fn with_engine(engine: Arc<dyn Engine>) -> Result<Self> {
        Self::with_engine_and_config(engine, &BridgeConfig::default())
    }

    pub fn with_engine_and_config(engine: Arc<dyn Engine>, config: &BridgeConfig) -> Result<Self> {
        let code = engine.initialize();
        if code != 0 {
            return Err(BridgeError::InitializationFailed(code));
        }
        debug!(engine = engine.name(), "Engine initialized");
        Ok(Self {
            engine,
            state: Mutex::new(Registries::default()),
            max_service_timeout: config.service.max_timeout,
            host_defaults: config.host.clone(),
            metrics: BridgeMetrics::new(),
        })
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    pub fn live_hosts(&self) -> usize {
        self.registries().hosts.len()
    }

    pub fn live_peers(&self) -> usize {
        self.registries().peers.len()
    }

    /// Packets currently owned by the caller.
    pub fn live_packets(&self) -> usize {
        self.registries().packets.len()
    }

    fn registries(&self) -> MutexGuard<'_, Registries> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stale(&self, err: BridgeError) -> BridgeError {
        if matches!(err, BridgeError::StaleHandle(_)) {
            BridgeMetrics::incr(&self.metrics.stale_handles);
        }
        err
    }

    /// Runs `op` holding `host`'s lock, after re-checking the host is live.
    fn on_host<R>(&self, host: HostHandle, op: impl FnOnce(RawHost) -> Result<R>) -> Result<R> {
        let serial = self
            .registries()
            .hosts
            .get(host)
            .map(|entry| Arc::clone(&entry.serial))
            .map_err(|e| self.stale(e))?;
        let _serial = serial.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = self
            .registries()
            .hosts
            .get(host)
            .map(|entry| entry.raw)
            .map_err(|e| self.stale(e))?;
        op(raw)
    }

    fn on_peer<R>(&self, peer: PeerHandle, op: impl FnOnce(RawPeer) -> Result<R>) -> Result<R> {
        let host = self
            .registries()
            .peers
            .get(peer)
            .map(|entry| entry.host)
            .map_err(|e| self.stale(e))?;
        self.on_host(host, |_| {
            let raw = self
                .registries()
                .peers
                .get(peer)
                .map(|entry| entry.raw)
                .map_err(|e| self.stale(e))?;
            op(raw)
        })
        .map_err(|e| match e {
            BridgeError::StaleHandle(ResourceKind::Host) => {
                BridgeError::StaleHandle(ResourceKind::Peer)
            }
            other => other,
        })
    }

    /// Creates a host. `None` makes an outbound-only client host.
    ///
    /// Limits are passed to the engine unchecked; it alone decides what it
    /// accepts.
    #[instrument(skip(self), level = "debug")]
    pub fn host_create(
        &self,
        address: Option<&Address>,
        peer_limit: usize,
        channel_limit: usize,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> Result<HostHandle> {
        let raw = self
            .engine
            .host_create(address, peer_limit, channel_limit, incoming_bandwidth, outgoing_bandwidth)
            .ok_or(BridgeError::AllocationFailure(ResourceKind::Host))?;

        let handle = self.registries().hosts.insert(HostEntry {
            raw,
            serial: Arc::new(Mutex::new(())),
        });
        BridgeMetrics::incr(&self.metrics.hosts_created);
        debug!(host = %handle, "Host created");
        Ok(handle)
    }

    /// Creates a host from `config`, or from the bridge's defaults when `None`.
    pub fn host_create_from_config(&self, config: Option<&HostConfig>) -> Result<HostHandle> {
        let config = config.unwrap_or(&self.host_defaults);
        let address = config
            .bind_address
            .as_deref()
            .map(str::parse::<Address>)
            .transpose()?;
        self.host_create(
            address.as_ref(),
            config.peer_limit,
            config.channel_limit,
            config.incoming_bandwidth,
            config.outgoing_bandwidth,
        )
    }

    /// Destroys a host and invalidates its peers. Null is a no-op.
    #[instrument(skip(self), level = "debug")]
    pub fn host_destroy(&self, host: HostHandle) -> Result<()> {
        if host.is_null() {
            return Ok(());
        }
        self.on_host(host, |raw| {
            let peers = {
                let mut reg = self.registries();
                reg.hosts.remove(host)?;
                reg.drop_peers_of(host)
            };
            self.engine.host_destroy(raw);
            BridgeMetrics::incr(&self.metrics.hosts_destroyed);
            debug!(peers, "Host destroyed");
            Ok(())
        })
    }

    /// Starts connecting to `address`.
    ///
    /// The handle is usable at once; the connection exists only after a
    /// Connect event names it.
    #[instrument(skip(self), level = "debug")]
    pub fn host_connect(
        &self,
        host: HostHandle,
        address: &Address,
        channel_count: usize,
        data: u32,
    ) -> Result<PeerHandle> {
        self.on_host(host, |raw_host| {
            let raw_peer = self
                .engine
                .host_connect(raw_host, address, channel_count, data)
                .ok_or(BridgeError::AllocationFailure(ResourceKind::Peer))?;

            let mut reg = self.registries();
            reg.retire_peer(raw_peer);
            let peer = reg.issue_peer(raw_peer, host, PeerStage::Connecting);
            BridgeMetrics::incr(&self.metrics.connects_started);
            debug!(%peer, "Connection started");
            Ok(peer)
        })
    }

    /// Dispatches at most one event, blocking up to `timeout`.
    ///
    /// `Duration::ZERO` polls. The timeout is capped at the configured
    /// maximum so the call always returns. An `Err(ServiceError)` means the
    /// host is unusable and should be destroyed.
    pub fn host_service(&self, host: HostHandle, timeout: Duration) -> Result<ServiceOutcome> {
        let timeout = timeout.min(self.max_service_timeout);
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);

        self.on_host(host, |raw_host| match self.engine.host_service(raw_host, timeout_ms) {
            RawService::Idle => {
                self.metrics.event(EventType::None);
                Ok(ServiceOutcome::NoEvent)
            }
            RawService::Failed(code) => {
                BridgeMetrics::incr(&self.metrics.service_errors);
                warn!(%host, code, "Host service failed");
                Err(BridgeError::ServiceError(code))
            }
            RawService::Event(raw) => Ok(self.dispatch(host, raw)),
        })
    }

    fn dispatch(&self, host: HostHandle, raw: RawEvent) -> ServiceOutcome {
        if raw.kind == EventType::None {
            self.metrics.event(EventType::None);
            return ServiceOutcome::NoEvent;
        }

        let mut reg = self.registries();
        let peer = raw
            .peer
            .map_or(PeerHandle::NULL, |p| reg.peer_for_event(p, host, raw.kind));
        let packet = match (raw.kind, raw.packet) {
            (EventType::Receive, Some(p)) => Some(reg.packets.insert(p)),
            (_, Some(p)) => {
                // Only Receive carries a payload; anything else is the engine's to free.
                warn!(kind = ?raw.kind, "Engine attached a packet to a non-receive event");
                self.engine.packet_destroy(p);
                None
            }
            (_, None) => None,
        };
        drop(reg);

        self.metrics.event(raw.kind);
        let event = Event {
            kind: raw.kind,
            peer,
            channel_id: raw.channel_id,
            data: raw.data,
            packet,
        };
        trace!(%host, ?event, "Event dispatched");
        ServiceOutcome::Occurred(event)
    }

    /// Sends queued outgoing packets now. Does not wait for acknowledgement.
    pub fn host_flush(&self, host: HostHandle) -> Result<()> {
        self.on_host(host, |raw| {
            self.engine.host_flush(raw);
            Ok(())
        })
    }

    /// Queues `packet` for every connected peer of `host`.
    ///
    /// The packet leaves caller ownership whether or not any peer is
    /// connected.
    pub fn host_broadcast(
        &self,
        host: HostHandle,
        channel_id: u8,
        packet: PacketHandle,
    ) -> Result<()> {
        self.on_host(host, |raw_host| {
            let raw_packet = self.registries().packets.remove(packet).map_err(|e| self.stale(e))?;
            self.engine.host_broadcast(raw_host, channel_id, raw_packet);
            BridgeMetrics::incr(&self.metrics.packets_broadcast);
            trace!(%host, %packet, channel_id, "Packet broadcast");
            Ok(())
        })
    }

    /// Copies `data` into a new engine packet.
    pub fn packet_create(&self, data: &[u8], flags: PacketFlags) -> Result<PacketHandle> {
        let raw = self
            .engine
            .packet_create(data, flags)
            .ok_or(BridgeError::AllocationFailure(ResourceKind::Packet))?;
        let handle = self.registries().packets.insert(raw);
        BridgeMetrics::incr(&self.metrics.packets_created);
        trace!(packet = %handle, len = data.len(), ?flags, "Packet created");
        Ok(handle)
    }

    /// Frees a caller-owned packet. Null is a no-op.
    pub fn packet_destroy(&self, packet: PacketHandle) -> Result<()> {
        if packet.is_null() {
            return Ok(());
        }
        let raw = self.registries().packets.remove(packet).map_err(|e| self.stale(e))?;
        self.engine.packet_destroy(raw);
        BridgeMetrics::incr(&self.metrics.packets_destroyed);
        Ok(())
    }

    fn with_packet<R>(&self, packet: PacketHandle, read: impl FnOnce(RawPacket) -> R) -> Result<R> {
        let reg = self.registries();
        let raw = *reg.packets.get(packet).map_err(|e| self.stale(e))?;
        Ok(read(raw))
    }

    /// A copy of the packet's payload.
    pub fn packet_data(&self, packet: PacketHandle) -> Result<Bytes> {
        self.with_packet(packet, |raw| Bytes::from(self.engine.packet_data(raw)))
    }

    pub fn packet_len(&self, packet: PacketHandle) -> Result<usize> {
        self.with_packet(packet, |raw| self.engine.packet_len(raw))
    }

    pub fn packet_flags(&self, packet: PacketHandle) -> Result<PacketFlags> {
        self.with_packet(packet, |raw| self.engine.packet_flags(raw))
    }

    /// Payload of a Receive event; `None` for other events.
    pub fn event_packet_data(&self, event: &Event) -> Result<Option<Bytes>> {
        event.packet.map(|p| self.packet_data(p)).transpose()
    }

    /// Queues `packet` to `peer`.
    ///
    /// On success the engine owns the packet and the handle goes stale. On
    /// `Err(SendRejected)` the caller still owns it and must destroy it.
    pub fn peer_send(&self, peer: PeerHandle, channel_id: u8, packet: PacketHandle) -> Result<()> {
        self.on_peer(peer, |raw_peer| {
            let mut reg = self.registries();
            let raw_packet = *reg.packets.get(packet).map_err(|e| self.stale(e))?;

            let status = self.engine.peer_send(raw_peer, channel_id, raw_packet);
            if status < 0 {
                BridgeMetrics::incr(&self.metrics.sends_rejected);
                debug!(%peer, %packet, status, "Send rejected");
                return Err(BridgeError::SendRejected(status));
            }

            reg.packets.remove(packet)?;
            BridgeMetrics::incr(&self.metrics.packets_sent);
            trace!(%peer, %packet, channel_id, "Packet sent");
            Ok(())
        })
    }

    /// Requests a disconnect; the remote sees `data` in its Disconnect event.
    pub fn peer_disconnect(&self, peer: PeerHandle, data: u32) -> Result<()> {
        self.on_peer(peer, |raw| {
            self.engine.peer_disconnect(raw, data);
            debug!(%peer, data, "Disconnect requested");
            Ok(())
        })
    }

    /// Disconnects once every queued outgoing packet has been sent.
    pub fn peer_disconnect_later(&self, peer: PeerHandle, data: u32) -> Result<()> {
        self.on_peer(peer, |raw| {
            self.engine.peer_disconnect_later(raw, data);
            debug!(%peer, data, "Deferred disconnect requested");
            Ok(())
        })
    }

    /// Drops the connection at once. Neither side gets an event.
    pub fn peer_disconnect_now(&self, peer: PeerHandle, data: u32) -> Result<()> {
        self.on_peer(peer, |raw| {
            self.engine.peer_disconnect_now(raw, data);
            if let Ok(entry) = self.registries().peers.get_mut(peer) {
                entry.stage = PeerStage::Closed;
            }
            debug!(%peer, data, "Peer reset");
            Ok(())
        })
    }

    pub fn peer_address(&self, peer: PeerHandle) -> Result<Address> {
        self.on_peer(peer, |raw| Ok(self.engine.peer_address(raw)))
    }

    /// Mean round-trip time as measured by the engine.
    pub fn peer_round_trip_time(&self, peer: PeerHandle) -> Result<Duration> {
        self.on_peer(peer, |raw| {
            Ok(Duration::from_millis(u64::from(self.engine.peer_round_trip_time(raw))))
        })
    }

    pub fn peer_state(&self, peer: PeerHandle) -> Result<PeerState> {
        self.on_peer(peer, |raw| Ok(peer_state_from_raw(self.engine.peer_state(raw))))
    }

    /// The host a peer belongs to.
    pub fn peer_host(&self, peer: PeerHandle) -> Result<HostHandle> {
        self.registries()
            .peers
            .get(peer)
            .map(|entry| entry.host)
            .map_err(|e| self.stale(e))
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let reg = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);

        let hosts = reg.hosts.extract_if(|_| true);
        if !hosts.is_empty() {
            warn!(count = hosts.len(), "Destroying hosts still open at shutdown");
        }
        for (_, entry) in hosts {
            self.engine.host_destroy(entry.raw);
        }
        reg.peers.extract_if(|_| true);
        reg.peer_index.clear();

        let packets = reg.packets.extract_if(|_| true);
        if !packets.is_empty() {
            warn!(count = packets.len(), "Destroying packets still owned at shutdown");
        }
        for (_, raw) in packets {
            self.engine.packet_destroy(raw);
        }

        self.metrics.log_metrics();
        self.engine.deinitialize();
        debug!(engine = self.engine.name(), "Engine deinitialized");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::engine::loopback::LoopbackEngine;

    fn bridge() -> (Arc<LoopbackEngine>, Bridge) {
        let engine = Arc::new(LoopbackEngine::new());
        let bridge = Bridge::with_engine(engine.clone()).unwrap();
        (engine, bridge)
    }

    #[test]
    fn test_null_handles() {
        let (_, bridge) = bridge();
        bridge.host_destroy(HostHandle::NULL).unwrap();
        bridge.host_destroy(HostHandle::NULL).unwrap();
        bridge.packet_destroy(PacketHandle::NULL).unwrap();
        assert!(matches!(
            bridge.peer_state(PeerHandle::NULL),
            Err(BridgeError::StaleHandle(ResourceKind::Peer))
        ));
        assert!(matches!(
            bridge.host_flush(HostHandle::NULL),
            Err(BridgeError::StaleHandle(ResourceKind::Host))
        ));
    }

    #[test]
    fn test_double_destroy_is_detected() {
        let (_, bridge) = bridge();
        let host = bridge.host_create(None, 1, 1, 0, 0).unwrap();
        bridge.host_destroy(host).unwrap();
        assert!(matches!(
            bridge.host_destroy(host),
            Err(BridgeError::StaleHandle(ResourceKind::Host))
        ));
        assert_eq!(bridge.metrics().snapshot().stale_handles, 1);
    }

    #[test]
    fn test_host_destroy_invalidates_peers() {
        let (_, bridge) = bridge();
        let host = bridge.host_create(None, 2, 2, 0, 0).unwrap();
        let peer = bridge
            .host_connect(host, &Address::from_ipv4(127, 0, 0, 1, 4999), 2, 0)
            .unwrap();
        assert_eq!(bridge.peer_host(peer).unwrap(), host);

        bridge.host_destroy(host).unwrap();
        assert_eq!(bridge.live_peers(), 0);
        assert!(matches!(
            bridge.peer_disconnect(peer, 0),
            Err(BridgeError::StaleHandle(ResourceKind::Peer))
        ));
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let (_, bridge) = bridge();
        let addr = Address::from_ipv4(127, 0, 0, 1, 6100);
        let first = bridge.host_create(Some(&addr), 1, 1, 0, 0).unwrap();
        assert!(matches!(
            bridge.host_create(Some(&addr), 1, 1, 0, 0),
            Err(BridgeError::AllocationFailure(ResourceKind::Host))
        ));

        let full = bridge.host_create(None, 1, 1, 0, 0).unwrap();
        bridge.host_connect(full, &addr, 1, 0).unwrap();
        assert!(matches!(
            bridge.host_connect(full, &addr, 1, 0),
            Err(BridgeError::AllocationFailure(ResourceKind::Peer))
        ));

        bridge.host_destroy(first).unwrap();
        bridge.host_destroy(full).unwrap();
    }

    #[test]
    fn test_drop_releases_everything() {
        let engine = Arc::new(LoopbackEngine::new());
        {
            let bridge = Bridge::with_engine(engine.clone()).unwrap();
            bridge.host_create(None, 1, 1, 0, 0).unwrap();
            bridge.packet_create(b"leak", PacketFlags::NONE).unwrap();
            assert_eq!(engine.init_depth(), 1);
        }
        assert_eq!(engine.live_hosts(), 0);
        assert_eq!(engine.live_packets(), 0);
        assert_eq!(engine.init_depth(), 0);
    }

    #[test]
    fn test_host_from_config() {
        let (_, bridge) = bridge();
        let config = HostConfig {
            bind_address: Some("127.0.0.1:6200".into()),
            ..HostConfig::default()
        };
        let host = bridge.host_create_from_config(Some(&config)).unwrap();
        bridge.host_destroy(host).unwrap();

        let bad = HostConfig {
            bind_address: Some("nonsense".into()),
            ..HostConfig::default()
        };
        assert!(matches!(
            bridge.host_create_from_config(Some(&bad)),
            Err(BridgeError::InvalidAddress(_))
        ));

        let client = bridge.host_create_from_config(None).unwrap();
        bridge.host_destroy(client).unwrap();
    }
}
