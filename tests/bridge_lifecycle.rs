//! End-to-end tests of the binding API over the loopback engine
//!
//! Covers connection setup, event dispatch, packet ownership transfer and the
//! three disconnect policies.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use enet_bridge::core::constants::EventType;
use enet_bridge::engine::loopback::LoopbackEngine;
use enet_bridge::handle::ResourceKind;
use enet_bridge::{
    Address, Bridge, BridgeConfig, BridgeError, Event, HostHandle, PacketFlags, PeerHandle,
    PeerState, ServiceOutcome,
};

const STEP: Duration = Duration::from_millis(10);

fn setup() -> (Arc<LoopbackEngine>, Bridge) {
    let engine = Arc::new(LoopbackEngine::new());
    let bridge = Bridge::with_engine(engine.clone()).expect("loopback engine initializes");
    (engine, bridge)
}

fn next_event(bridge: &Bridge, host: HostHandle) -> Event {
    for _ in 0..100 {
        if let ServiceOutcome::Occurred(event) = bridge.host_service(host, STEP).unwrap() {
            return event;
        }
    }
    panic!("no event on {host}");
}

fn assert_quiet(bridge: &Bridge, host: HostHandle) {
    let outcome = bridge.host_service(host, Duration::from_millis(20)).unwrap();
    assert_eq!(outcome, ServiceOutcome::NoEvent, "unexpected event on {host}");
}

struct Link {
    server: HostHandle,
    client: HostHandle,
    /// Client-side handle for the server.
    to_server: PeerHandle,
    /// Server-side handle for the client.
    to_client: PeerHandle,
}

fn connect(bridge: &Bridge, port: u16, data: u32) -> Link {
    let addr = Address::from_ipv4(127, 0, 0, 1, port);
    let server = bridge.host_create(Some(&addr), 8, 4, 0, 0).unwrap();
    let client = bridge.host_create(None, 1, 4, 0, 0).unwrap();
    let to_server = bridge.host_connect(client, &addr, 4, data).unwrap();

    let event = next_event(bridge, client);
    assert_eq!(event.kind, EventType::Connect);
    assert_eq!(event.peer, to_server);

    let event = next_event(bridge, server);
    assert_eq!(event.kind, EventType::Connect);
    assert_eq!(event.data, data);

    Link {
        server,
        client,
        to_server,
        to_client: event.peer,
    }
}

#[test]
fn test_connect_dispatches_both_sides() {
    let (_, bridge) = setup();
    let link = connect(&bridge, 7101, 99);

    assert_eq!(bridge.peer_state(link.to_server).unwrap(), PeerState::Connected);
    assert_eq!(bridge.peer_state(link.to_client).unwrap(), PeerState::Connected);
    assert_eq!(
        bridge.peer_address(link.to_server).unwrap(),
        Address::from_ipv4(127, 0, 0, 1, 7101)
    );
    assert_eq!(bridge.peer_host(link.to_client).unwrap(), link.server);
    assert!(bridge.peer_round_trip_time(link.to_server).unwrap() < Duration::from_millis(500));

    let snapshot = bridge.metrics().snapshot();
    assert_eq!(snapshot.events_connect, 2);
    assert_eq!(snapshot.connects_started, 1);
}

#[test]
fn test_unanswered_connect_is_never_connect() {
    let (_, bridge) = setup();
    let host = bridge.host_create(None, 1, 2, 0, 0).unwrap();
    let peer = bridge
        .host_connect(host, &Address::from_ipv4(127, 0, 0, 1, 1), 2, 0)
        .unwrap();

    match bridge.host_service(host, Duration::from_millis(50)).unwrap() {
        ServiceOutcome::NoEvent => {}
        ServiceOutcome::Occurred(event) => {
            assert_eq!(event.kind, EventType::Disconnect);
            assert_eq!(event.peer, peer);
        }
    }
    bridge.host_destroy(host).unwrap();
}

#[test]
fn test_connect_timeout_reports_disconnect() {
    let config = BridgeConfig::default_with_overrides(|c| {
        c.service.connect_timeout = Duration::from_millis(30);
    });
    let engine = Arc::new(LoopbackEngine::from_config(&config.service));
    let bridge = Bridge::with_engine_and_config(engine, &config).unwrap();
    let host = bridge.host_create(None, 1, 2, 0, 0).unwrap();
    let peer = bridge
        .host_connect(host, &Address::from_ipv4(127, 0, 0, 1, 2), 2, 0)
        .unwrap();

    let event = next_event(&bridge, host);
    assert!(event.is_disconnect());
    assert_eq!(event.peer, peer);
    assert_eq!(bridge.peer_state(peer).unwrap(), PeerState::Disconnected);
}

#[test]
fn test_send_and_receive() {
    let (engine, bridge) = setup();
    let link = connect(&bridge, 7102, 0);

    let packet = bridge.packet_create(b"hello", PacketFlags::RELIABLE).unwrap();
    assert_eq!(bridge.packet_len(packet).unwrap(), 5);
    bridge.peer_send(link.to_server, 3, packet).unwrap();
    bridge.host_flush(link.client).unwrap();

    let event = next_event(&bridge, link.server);
    assert!(event.is_receive());
    assert_eq!(event.peer, link.to_client);
    assert_eq!(event.channel_id, 3);

    let received = event.packet.expect("receive carries a packet");
    assert_eq!(&bridge.packet_data(received).unwrap()[..], b"hello");
    assert_eq!(bridge.event_packet_data(&event).unwrap().as_deref(), Some(&b"hello"[..]));
    let flags = bridge.packet_flags(received).unwrap();
    assert!(flags.contains(PacketFlags::RELIABLE));
    assert!(!flags.contains(PacketFlags::SENT));

    bridge.packet_destroy(received).unwrap();
    assert_eq!(bridge.live_packets(), 0);
    assert_eq!(engine.live_packets(), 0);
}

#[test]
fn test_successful_send_transfers_ownership() {
    let (_, bridge) = setup();
    let link = connect(&bridge, 7103, 0);

    let packet = bridge.packet_create(b"owned", PacketFlags::RELIABLE).unwrap();
    bridge.peer_send(link.to_server, 0, packet).unwrap();

    // The engine owns it now; the old handle no longer names anything.
    assert_eq!(bridge.live_packets(), 0);
    assert!(matches!(
        bridge.packet_destroy(packet),
        Err(BridgeError::StaleHandle(ResourceKind::Packet))
    ));
    assert!(matches!(
        bridge.peer_send(link.to_server, 0, packet),
        Err(BridgeError::StaleHandle(ResourceKind::Packet))
    ));
}

#[test]
fn test_rejected_send_keeps_ownership() {
    let (engine, bridge) = setup();
    let host = bridge.host_create(None, 1, 2, 0, 0).unwrap();
    let pending = bridge
        .host_connect(host, &Address::from_ipv4(127, 0, 0, 1, 3), 2, 0)
        .unwrap();

    let packet = bridge.packet_create(b"early", PacketFlags::RELIABLE).unwrap();
    assert!(matches!(
        bridge.peer_send(pending, 0, packet),
        Err(BridgeError::SendRejected(code)) if code < 0
    ));
    assert_eq!(bridge.metrics().snapshot().sends_rejected, 1);

    assert_eq!(&bridge.packet_data(packet).unwrap()[..], b"early");
    bridge.packet_destroy(packet).unwrap();
    assert_eq!(engine.live_packets(), 0);
}

#[test]
fn test_send_on_unknown_channel_is_rejected() {
    let (_, bridge) = setup();
    let link = connect(&bridge, 7104, 0);

    let packet = bridge.packet_create(b"x", PacketFlags::NONE).unwrap();
    assert!(matches!(
        bridge.peer_send(link.to_server, 200, packet),
        Err(BridgeError::SendRejected(_))
    ));
    bridge.packet_destroy(packet).unwrap();
}

#[test]
fn test_create_then_destroy_leaves_others_alone() {
    let (_, bridge) = setup();
    let keep = bridge.packet_create(b"keep", PacketFlags::UNSEQUENCED).unwrap();
    let gone = bridge.packet_create(b"gone", PacketFlags::RELIABLE).unwrap();
    bridge.packet_destroy(gone).unwrap();

    assert_eq!(&bridge.packet_data(keep).unwrap()[..], b"keep");
    assert_eq!(bridge.packet_flags(keep).unwrap(), PacketFlags::UNSEQUENCED);
    assert!(bridge.packet_data(gone).is_err());
    bridge.packet_destroy(keep).unwrap();
}

#[test]
fn test_destroy_null_is_repeatable() {
    let (_, bridge) = setup();
    for _ in 0..3 {
        bridge.host_destroy(HostHandle::NULL).unwrap();
        bridge.packet_destroy(Default::default()).unwrap();
    }
}

#[test]
fn test_disconnect_notifies_remote() {
    let (_, bridge) = setup();
    let link = connect(&bridge, 7105, 0);

    bridge.peer_disconnect(link.to_server, 42).unwrap();
    let event = next_event(&bridge, link.client);
    assert!(event.is_disconnect());
    assert_eq!(event.peer, link.to_server);

    let event = next_event(&bridge, link.server);
    assert!(event.is_disconnect());
    assert_eq!(event.peer, link.to_client);
    assert_eq!(event.data, 42);

    // Handles outlive the connection until the slot is reused.
    assert_eq!(bridge.peer_state(link.to_client).unwrap(), PeerState::Disconnected);
}

#[test]
fn test_disconnect_later_drains_queue_first() {
    let (_, bridge) = setup();
    let link = connect(&bridge, 7106, 0);

    for payload in [&b"one"[..], b"two"] {
        let packet = bridge.packet_create(payload, PacketFlags::RELIABLE).unwrap();
        bridge.peer_send(link.to_server, 0, packet).unwrap();
    }
    bridge.peer_disconnect_later(link.to_server, 7).unwrap();
    assert_eq!(bridge.peer_state(link.to_server).unwrap(), PeerState::DisconnectLater);
    bridge.host_flush(link.client).unwrap();

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let event = next_event(&bridge, link.server);
        if let Some(packet) = event.packet {
            bridge.packet_destroy(packet).unwrap();
        }
        kinds.push((event.kind, event.data));
    }
    assert_eq!(
        kinds,
        vec![
            (EventType::Receive, 0),
            (EventType::Receive, 0),
            (EventType::Disconnect, 7)
        ]
    );
}

#[test]
fn test_disconnect_now_is_silent() {
    let (_, bridge) = setup();
    let link = connect(&bridge, 7107, 0);

    bridge.peer_disconnect_now(link.to_server, 1).unwrap();
    assert_eq!(bridge.peer_state(link.to_server).unwrap(), PeerState::Disconnected);
    assert_quiet(&bridge, link.client);
    assert_quiet(&bridge, link.server);
    assert_eq!(bridge.peer_state(link.to_client).unwrap(), PeerState::Disconnected);
}

#[test]
fn test_disconnect_now_frees_the_listener_slot() {
    let (_, bridge) = setup();
    let addr = Address::from_ipv4(127, 0, 0, 1, 7111);
    let server = bridge.host_create(Some(&addr), 1, 2, 0, 0).unwrap();

    let first = bridge.host_create(None, 1, 2, 0, 0).unwrap();
    let to_server = bridge.host_connect(first, &addr, 2, 0).unwrap();
    assert!(next_event(&bridge, first).is_connect());
    let first_on_server = next_event(&bridge, server);
    assert!(first_on_server.is_connect());

    bridge.peer_disconnect_now(to_server, 0).unwrap();

    let second = bridge.host_create(None, 1, 2, 0, 0).unwrap();
    let again = bridge.host_connect(second, &addr, 2, 0).unwrap();
    let event = next_event(&bridge, second);
    assert!(event.is_connect(), "listener never accepted: {event:?}");
    assert_eq!(event.peer, again);
    assert_eq!(bridge.peer_state(again).unwrap(), PeerState::Connected);

    let event = next_event(&bridge, server);
    assert!(event.is_connect());
    assert_ne!(event.peer, first_on_server.peer);
    assert_eq!(bridge.peer_state(event.peer).unwrap(), PeerState::Connected);
    assert!(bridge.peer_state(first_on_server.peer).is_err());
}

#[test]
fn test_broadcast_reaches_every_peer() {
    let (engine, bridge) = setup();
    let addr = Address::from_ipv4(127, 0, 0, 1, 7108);
    let server = bridge.host_create(Some(&addr), 4, 2, 0, 0).unwrap();
    let clients: Vec<HostHandle> = (0..3)
        .map(|_| {
            let client = bridge.host_create(None, 1, 2, 0, 0).unwrap();
            bridge.host_connect(client, &addr, 2, 0).unwrap();
            assert!(next_event(&bridge, client).is_connect());
            client
        })
        .collect();
    for _ in 0..3 {
        assert!(next_event(&bridge, server).is_connect());
    }

    let packet = bridge.packet_create(b"all", PacketFlags::RELIABLE).unwrap();
    bridge.host_broadcast(server, 1, packet).unwrap();
    assert!(bridge.packet_destroy(packet).is_err());
    bridge.host_flush(server).unwrap();

    for client in &clients {
        let event = next_event(&bridge, *client);
        assert!(event.is_receive());
        assert_eq!(event.channel_id, 1);
        let received = event.packet.unwrap();
        assert_eq!(&bridge.packet_data(received).unwrap()[..], b"all");
        bridge.packet_destroy(received).unwrap();
    }
    assert_eq!(engine.live_packets(), 0);
    assert_eq!(bridge.metrics().snapshot().packets_broadcast, 1);
}

#[test]
fn test_host_destroy_notifies_remote_and_invalidates_peers() {
    let (_, bridge) = setup();
    let link = connect(&bridge, 7109, 0);

    bridge.host_destroy(link.client).unwrap();
    assert!(matches!(
        bridge.peer_state(link.to_server),
        Err(BridgeError::StaleHandle(ResourceKind::Peer))
    ));
    assert!(matches!(
        bridge.host_service(link.client, Duration::ZERO),
        Err(BridgeError::StaleHandle(ResourceKind::Host))
    ));

    let event = next_event(&bridge, link.server);
    assert!(event.is_disconnect());
    assert_eq!(event.peer, link.to_client);
}

#[test]
fn test_reused_slot_gets_fresh_handle() {
    let (_, bridge) = setup();
    let addr = Address::from_ipv4(127, 0, 0, 1, 7110);
    let server = bridge.host_create(Some(&addr), 1, 1, 0, 0).unwrap();
    let client = bridge.host_create(None, 1, 1, 0, 0).unwrap();

    let first = bridge.host_connect(client, &addr, 1, 0).unwrap();
    assert!(next_event(&bridge, client).is_connect());
    let first_remote = next_event(&bridge, server).peer;

    bridge.peer_disconnect(first, 0).unwrap();
    assert!(next_event(&bridge, client).is_disconnect());
    assert!(next_event(&bridge, server).is_disconnect());

    let second = bridge.host_connect(client, &addr, 1, 0).unwrap();
    assert_ne!(second, first);
    assert!(matches!(bridge.peer_state(first), Err(BridgeError::StaleHandle(_))));

    assert!(next_event(&bridge, client).is_connect());
    let second_remote = next_event(&bridge, server).peer;
    assert_ne!(second_remote, first_remote);
    assert!(bridge.peer_state(first_remote).is_err());
    assert_eq!(bridge.peer_state(second_remote).unwrap(), PeerState::Connected);
}

#[test]
fn test_service_timeout_is_clamped() {
    let engine = Arc::new(LoopbackEngine::new());
    let config = enet_bridge::BridgeConfig::default_with_overrides(|c| {
        c.service.max_timeout = Duration::from_millis(20);
    });
    let bridge = Bridge::with_engine_and_config(engine, &config).unwrap();
    let host = bridge.host_create(None, 1, 1, 0, 0).unwrap();

    let started = std::time::Instant::now();
    let outcome = bridge.host_service(host, Duration::from_secs(3600)).unwrap();
    assert_eq!(outcome, ServiceOutcome::NoEvent);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_zero_timeout_polls() {
    let (_, bridge) = setup();
    let host = bridge.host_create(None, 0, 0, 0, 0).unwrap();
    let started = std::time::Instant::now();
    assert_eq!(bridge.host_service(host, Duration::ZERO).unwrap(), ServiceOutcome::NoEvent);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_handles_cross_integer_boundary() {
    let (_, bridge) = setup();
    let packet = bridge.packet_create(b"raw", PacketFlags::NONE).unwrap();
    let token = packet.to_raw();
    assert_ne!(token, 0);

    let restored = enet_bridge::PacketHandle::from_raw(token);
    assert_eq!(&bridge.packet_data(restored).unwrap()[..], b"raw");
    bridge.packet_destroy(restored).unwrap();
    assert!(bridge.packet_destroy(packet).is_err());
}
