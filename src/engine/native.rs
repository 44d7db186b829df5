//! # Native Engine
//!
//! The ENet 2.x C API, resolved symbol by symbol from a shared library at
//! runtime.
//!
//! Struct mirrors below follow the engine headers field for field; they are
//! only ever read through pointers the engine handed us.

use std::ffi::{c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;
use tracing::{debug, warn};

use crate::core::address::{Address, HOST_LEN};
use crate::core::constants::{EventType, PacketFlags};
use crate::engine::{Engine, RawEvent, RawHost, RawPacket, RawPeer, RawService};
use crate::error::{constants, BridgeError, Result};

/// `struct in6_addr`: word-aligned everywhere but Windows.
#[cfg_attr(not(windows), repr(C, align(4)))]
#[cfg_attr(windows, repr(C))]
#[derive(Debug, Clone, Copy, Default)]
struct In6Addr([u8; HOST_LEN]);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct ENetAddress {
    host: In6Addr,
    port: u16,
    sin6_scope_id: u16,
}

impl From<&Address> for ENetAddress {
    fn from(addr: &Address) -> Self {
        Self {
            host: In6Addr(addr.host()),
            port: addr.port(),
            sin6_scope_id: addr.scope_id(),
        }
    }
}

impl From<&ENetAddress> for Address {
    fn from(addr: &ENetAddress) -> Self {
        Address::new(addr.host.0, addr.port, addr.sin6_scope_id)
    }
}

/// Leading fields of `ENetPeer`, up to and including its address.
#[repr(C)]
#[allow(dead_code)]
struct ENetPeerHead {
    dispatch_next: *mut c_void,
    dispatch_previous: *mut c_void,
    host: *mut c_void,
    outgoing_peer_id: u16,
    incoming_peer_id: u16,
    connect_id: u32,
    outgoing_session_id: u8,
    incoming_session_id: u8,
    address: ENetAddress,
}

#[repr(C)]
struct ENetEvent {
    kind: c_int,
    peer: *mut c_void,
    channel_id: u8,
    data: u32,
    packet: *mut ENetPacket,
}

#[repr(C)]
#[allow(dead_code)]
struct ENetPacket {
    reference_count: usize,
    flags: u32,
    data: *mut u8,
    data_length: usize,
    free_callback: Option<unsafe extern "C" fn(*mut ENetPacket)>,
    user_data: *mut c_void,
}

type InitializeFn = unsafe extern "C" fn() -> c_int;
type DeinitializeFn = unsafe extern "C" fn();
type HostCreateFn =
    unsafe extern "C" fn(*const ENetAddress, usize, usize, u32, u32) -> *mut c_void;
type HostDestroyFn = unsafe extern "C" fn(*mut c_void);
type HostConnectFn =
    unsafe extern "C" fn(*mut c_void, *const ENetAddress, usize, u32) -> *mut c_void;
type HostServiceFn = unsafe extern "C" fn(*mut c_void, *mut ENetEvent, u32) -> c_int;
type HostFlushFn = unsafe extern "C" fn(*mut c_void);
type HostBroadcastFn = unsafe extern "C" fn(*mut c_void, u8, *mut ENetPacket);
type PacketCreateFn = unsafe extern "C" fn(*const c_void, usize, u32) -> *mut ENetPacket;
type PacketDestroyFn = unsafe extern "C" fn(*mut ENetPacket);
type PeerSendFn = unsafe extern "C" fn(*mut c_void, u8, *mut ENetPacket) -> c_int;
type PeerDisconnectFn = unsafe extern "C" fn(*mut c_void, u32);
type PeerGetRttFn = unsafe extern "C" fn(*mut c_void) -> u32;
type PeerGetStateFn = unsafe extern "C" fn(*mut c_void) -> c_int;

struct Api {
    initialize: InitializeFn,
    deinitialize: DeinitializeFn,
    host_create: HostCreateFn,
    host_destroy: HostDestroyFn,
    host_connect: HostConnectFn,
    host_service: HostServiceFn,
    host_flush: HostFlushFn,
    host_broadcast: HostBroadcastFn,
    packet_create: PacketCreateFn,
    packet_destroy: PacketDestroyFn,
    peer_send: PeerSendFn,
    peer_disconnect: PeerDisconnectFn,
    peer_disconnect_later: PeerDisconnectFn,
    peer_disconnect_now: PeerDisconnectFn,
    peer_get_rtt: PeerGetRttFn,
    peer_get_state: PeerGetStateFn,
}

/// Copies a function pointer out of the library.
///
/// # Safety
/// `T` must match the C signature of `name`.
unsafe fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T> {
    let mut cname = Vec::with_capacity(name.len() + 1);
    cname.extend_from_slice(name.as_bytes());
    cname.push(0);
    library
        .get::<T>(&cname)
        .map(|sym| *sym)
        .map_err(|e| {
            BridgeError::EngineUnavailable(format!(
                "{}: {name}: {e}",
                constants::ERR_MISSING_SYMBOL
            ))
        })
}

impl Api {
    /// # Safety
    /// `library` must be an ENet 2.x build exporting the C API.
    unsafe fn resolve(library: &Library) -> Result<Self> {
        Ok(Self {
            initialize: symbol(library, "enet_initialize")?,
            deinitialize: symbol(library, "enet_deinitialize")?,
            host_create: symbol(library, "enet_host_create")?,
            host_destroy: symbol(library, "enet_host_destroy")?,
            host_connect: symbol(library, "enet_host_connect")?,
            host_service: symbol(library, "enet_host_service")?,
            host_flush: symbol(library, "enet_host_flush")?,
            host_broadcast: symbol(library, "enet_host_broadcast")?,
            packet_create: symbol(library, "enet_packet_create")?,
            packet_destroy: symbol(library, "enet_packet_destroy")?,
            peer_send: symbol(library, "enet_peer_send")?,
            peer_disconnect: symbol(library, "enet_peer_disconnect")?,
            peer_disconnect_later: symbol(library, "enet_peer_disconnect_later")?,
            peer_disconnect_now: symbol(library, "enet_peer_disconnect_now")?,
            peer_get_rtt: symbol(library, "enet_peer_get_rtt")?,
            peer_get_state: symbol(library, "enet_peer_get_state")?,
        })
    }
}

/// A loaded ENet shared library.
///
/// Raw tokens handed out by this engine are the engine's own pointers. The
/// bridge guarantees they are only passed back while live.
pub struct NativeEngine {
    api: Api,
    // Declared last: the resolved function pointers above must not outlive it.
    _library: Library,
}

impl NativeEngine {
    /// Opens `name` through the platform's library search path.
    pub fn open_system(name: &str) -> Result<Self> {
        let file = libloading::library_filename(name);
        // SAFETY: loading runs the library's initialisers; ENet has none with
        // preconditions.
        let library = unsafe { Library::new(&file) }.map_err(|e| {
            BridgeError::EngineUnavailable(format!("{}: {e}", file.to_string_lossy()))
        })?;
        Self::from_library(library, PathBuf::from(file))
    }

    /// Opens the library at an explicit path.
    pub fn open_path(path: &Path) -> Result<Self> {
        // SAFETY: as above.
        let library = unsafe { Library::new(path) }
            .map_err(|e| BridgeError::EngineUnavailable(format!("{}: {e}", path.display())))?;
        Self::from_library(library, path.to_path_buf())
    }

    fn from_library(library: Library, origin: PathBuf) -> Result<Self> {
        // SAFETY: the type aliases above mirror the ENet 2.x headers.
        let api = unsafe { Api::resolve(&library)? };
        debug!(origin = %origin.display(), "Resolved engine symbols");
        Ok(Self {
            api,
            _library: library,
        })
    }
}

fn host_ptr(host: RawHost) -> *mut c_void {
    host.get() as *mut c_void
}

fn peer_ptr(peer: RawPeer) -> *mut c_void {
    peer.get() as *mut c_void
}

/// Copies the address out of an `ENetPeer`, scope id included.
///
/// # Safety
/// `peer` must point at a live `ENetPeer`.
unsafe fn read_peer_address(peer: *const c_void) -> Address {
    Address::from(&(*peer.cast::<ENetPeerHead>()).address)
}

fn packet_ptr(packet: RawPacket) -> *mut ENetPacket {
    packet.get() as *mut ENetPacket
}

impl Engine for NativeEngine {
    fn name(&self) -> &str {
        "native"
    }

    fn initialize(&self) -> i32 {
        // SAFETY: no preconditions.
        unsafe { (self.api.initialize)() }
    }

    fn deinitialize(&self) {
        // SAFETY: no preconditions.
        unsafe { (self.api.deinitialize)() }
    }

    fn host_create(
        &self,
        address: Option<&Address>,
        peer_limit: usize,
        channel_limit: usize,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> Option<RawHost> {
        let native = address.map(ENetAddress::from);
        let addr_ptr = native
            .as_ref()
            .map_or(ptr::null(), |a| a as *const ENetAddress);
        // SAFETY: addr_ptr is null or points at a live ENetAddress for the call.
        let host = unsafe {
            (self.api.host_create)(
                addr_ptr,
                peer_limit,
                channel_limit,
                incoming_bandwidth,
                outgoing_bandwidth,
            )
        };
        RawHost::new(host as usize)
    }

    fn host_destroy(&self, host: RawHost) {
        // SAFETY: host came from host_create and has not been destroyed.
        unsafe { (self.api.host_destroy)(host_ptr(host)) }
    }

    fn host_connect(
        &self,
        host: RawHost,
        address: &Address,
        channel_count: usize,
        data: u32,
    ) -> Option<RawPeer> {
        let native = ENetAddress::from(address);
        // SAFETY: host is live; native outlives the call.
        let peer = unsafe { (self.api.host_connect)(host_ptr(host), &native, channel_count, data) };
        RawPeer::new(peer as usize)
    }

    fn host_service(&self, host: RawHost, timeout_ms: u32) -> RawService {
        let mut event = ENetEvent {
            kind: 0,
            peer: ptr::null_mut(),
            channel_id: 0,
            data: 0,
            packet: ptr::null_mut(),
        };
        // SAFETY: host is live; event is a valid out-pointer.
        let status = unsafe { (self.api.host_service)(host_ptr(host), &mut event, timeout_ms) };

        match status {
            s if s < 0 => RawService::Failed(s),
            0 => RawService::Idle,
            _ => {
                let kind = EventType::try_from(event.kind).unwrap_or_else(|raw| {
                    warn!(raw, "Engine reported an unknown event type");
                    EventType::None
                });
                RawService::Event(RawEvent {
                    kind,
                    peer: RawPeer::new(event.peer as usize),
                    channel_id: event.channel_id,
                    data: event.data,
                    packet: RawPacket::new(event.packet as usize),
                })
            }
        }
    }

    fn host_flush(&self, host: RawHost) {
        // SAFETY: host is live.
        unsafe { (self.api.host_flush)(host_ptr(host)) }
    }

    fn host_broadcast(&self, host: RawHost, channel_id: u8, packet: RawPacket) {
        // SAFETY: host and packet are live; the engine takes the packet.
        unsafe { (self.api.host_broadcast)(host_ptr(host), channel_id, packet_ptr(packet)) }
    }

    fn packet_create(&self, data: &[u8], flags: PacketFlags) -> Option<RawPacket> {
        // The engine must copy: `data` is only borrowed for this call.
        let flags = flags.without(PacketFlags::NO_ALLOCATE);
        // SAFETY: data is valid for data.len() bytes during the call.
        let packet = unsafe {
            (self.api.packet_create)(data.as_ptr().cast::<c_void>(), data.len(), flags.bits())
        };
        RawPacket::new(packet as usize)
    }

    fn packet_destroy(&self, packet: RawPacket) {
        // SAFETY: packet is live and owned by the caller.
        unsafe { (self.api.packet_destroy)(packet_ptr(packet)) }
    }

    fn peer_send(&self, peer: RawPeer, channel_id: u8, packet: RawPacket) -> i32 {
        // SAFETY: peer and packet are live.
        unsafe { (self.api.peer_send)(peer_ptr(peer), channel_id, packet_ptr(packet)) }
    }

    fn peer_disconnect(&self, peer: RawPeer, data: u32) {
        // SAFETY: peer is live.
        unsafe { (self.api.peer_disconnect)(peer_ptr(peer), data) }
    }

    fn peer_disconnect_later(&self, peer: RawPeer, data: u32) {
        // SAFETY: peer is live.
        unsafe { (self.api.peer_disconnect_later)(peer_ptr(peer), data) }
    }

    fn peer_disconnect_now(&self, peer: RawPeer, data: u32) {
        // SAFETY: peer is live.
        unsafe { (self.api.peer_disconnect_now)(peer_ptr(peer), data) }
    }

    fn peer_address(&self, peer: RawPeer) -> Address {
        // SAFETY: peer is live and points at an ENetPeer.
        unsafe { read_peer_address(peer_ptr(peer)) }
    }

    fn peer_round_trip_time(&self, peer: RawPeer) -> u32 {
        // SAFETY: peer is live.
        unsafe { (self.api.peer_get_rtt)(peer_ptr(peer)) }
    }

    fn peer_state(&self, peer: RawPeer) -> i32 {
        // SAFETY: peer is live.
        unsafe { (self.api.peer_get_state)(peer_ptr(peer)) }
    }

    fn packet_data(&self, packet: RawPacket) -> Vec<u8> {
        // SAFETY: packet is live; data/data_length describe its buffer.
        unsafe {
            let p = &*packet_ptr(packet);
            if p.data.is_null() {
                return Vec::new();
            }
            std::slice::from_raw_parts(p.data, p.data_length).to_vec()
        }
    }

    fn packet_len(&self, packet: RawPacket) -> usize {
        // SAFETY: packet is live.
        unsafe { (*packet_ptr(packet)).data_length }
    }

    fn packet_flags(&self, packet: RawPacket) -> PacketFlags {
        // SAFETY: packet is live.
        PacketFlags::from_bits_truncate(unsafe { (*packet_ptr(packet)).flags })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_address_mirror_layout() {
        assert_eq!(size_of::<ENetAddress>(), 20);
        assert_eq!(offset_of!(ENetAddress, port), 16);
        assert_eq!(offset_of!(ENetAddress, sin6_scope_id), 18);
    }

    #[test]
    fn test_packet_mirror_layout() {
        let word = size_of::<usize>();
        assert_eq!(offset_of!(ENetPacket, flags), word);
        assert_eq!(offset_of!(ENetPacket, data), 2 * word);
        assert_eq!(offset_of!(ENetPacket, data_length), 3 * word);
    }

    #[test]
    #[cfg(all(unix, target_pointer_width = "64"))]
    fn test_peer_mirror_layout() {
        assert_eq!(offset_of!(ENetPeerHead, connect_id), 28);
        assert_eq!(offset_of!(ENetPeerHead, address), 36);
    }

    #[test]
    fn test_peer_address_keeps_scope_id() {
        let mut host = [0u8; HOST_LEN];
        host[0] = 0xfe;
        host[1] = 0x80;
        host[15] = 1;
        let peer = ENetPeerHead {
            dispatch_next: ptr::null_mut(),
            dispatch_previous: ptr::null_mut(),
            host: ptr::null_mut(),
            outgoing_peer_id: 0,
            incoming_peer_id: 0,
            connect_id: 0,
            outgoing_session_id: 0,
            incoming_session_id: 0,
            address: ENetAddress::from(&Address::new(host, 9000, 3)),
        };

        // SAFETY: `peer` is a live ENetPeer prefix.
        let addr = unsafe { read_peer_address(ptr::addr_of!(peer).cast::<c_void>()) };
        assert_eq!(addr.host(), host);
        assert_eq!(addr.port(), 9000);
        assert_eq!(addr.scope_id(), 3);
        assert_eq!(addr.to_string(), "fe80:0000:0000:0000:0000:0000:0000:0001%3:9000");
    }

    #[test]
    fn test_missing_library_is_engine_unavailable() {
        let err = NativeEngine::open_path(Path::new("/nonexistent/libenet-jni.so"))
            .err()
            .map(|e| e.is_fatal());
        assert_eq!(err, Some(true));
    }
}
