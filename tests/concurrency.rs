//! Concurrent use of one bridge from several threads

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use enet_bridge::engine::loopback::LoopbackEngine;
use enet_bridge::handle::ResourceKind;
use enet_bridge::{Address, Bridge, BridgeError, Event, HostHandle, PacketFlags, ServiceOutcome};

fn next_event(bridge: &Bridge, host: HostHandle) -> Event {
    for _ in 0..200 {
        let outcome = bridge.host_service(host, Duration::from_millis(10)).unwrap();
        if let ServiceOutcome::Occurred(event) = outcome {
            return event;
        }
    }
    panic!("no event on {host}");
}

#[test]
fn distinct_hosts_run_in_parallel() {
    let bridge = Arc::new(Bridge::with_engine(Arc::new(LoopbackEngine::new())).unwrap());
    let pairs = 4u16;
    let messages = 50usize;
    let barrier = Arc::new(Barrier::new(usize::from(pairs)));

    let workers: Vec<_> = (0..pairs)
        .map(|i| {
            let bridge = Arc::clone(&bridge);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let addr = Address::from_ipv4(127, 0, 0, 1, 7200 + i);
                let server = bridge.host_create(Some(&addr), 2, 1, 0, 0).unwrap();
                let client = bridge.host_create(None, 1, 1, 0, 0).unwrap();
                barrier.wait();

                let peer = bridge.host_connect(client, &addr, 1, u32::from(i)).unwrap();
                assert!(next_event(&bridge, client).is_connect());
                assert_eq!(next_event(&bridge, server).data, u32::from(i));

                for n in 0..messages {
                    let payload = format!("{i}:{n}");
                    let packet = bridge
                        .packet_create(payload.as_bytes(), PacketFlags::RELIABLE)
                        .unwrap();
                    bridge.peer_send(peer, 0, packet).unwrap();
                }
                bridge.host_flush(client).unwrap();

                for n in 0..messages {
                    let event = next_event(&bridge, server);
                    let packet = event.packet.expect("receive event");
                    let data = bridge.packet_data(packet).unwrap();
                    assert_eq!(&data[..], format!("{i}:{n}").as_bytes());
                    bridge.packet_destroy(packet).unwrap();
                }

                bridge.host_destroy(client).unwrap();
                bridge.host_destroy(server).unwrap();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(bridge.live_hosts(), 0);
    assert_eq!(bridge.live_packets(), 0);
    assert_eq!(bridge.metrics().snapshot().events_receive, u64::from(pairs) * messages as u64);
}

#[test]
fn same_host_calls_are_serialized() {
    let engine = Arc::new(LoopbackEngine::new());
    let bridge = Arc::new(Bridge::with_engine(engine.clone()).unwrap());
    let addr = Address::from_ipv4(127, 0, 0, 1, 7300);
    let server = bridge.host_create(Some(&addr), 4, 1, 0, 0).unwrap();
    let client = bridge.host_create(None, 1, 1, 0, 0).unwrap();
    let peer = bridge.host_connect(client, &addr, 1, 0).unwrap();
    assert!(next_event(&bridge, client).is_connect());
    assert!(next_event(&bridge, server).is_connect());

    let total = 200usize;
    let senders: Vec<_> = (0..4)
        .map(|_| {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || {
                for _ in 0..total / 4 {
                    let packet = bridge.packet_create(b"x", PacketFlags::NONE).unwrap();
                    bridge.peer_send(peer, 0, packet).unwrap();
                    bridge.host_flush(client).unwrap();
                }
            })
        })
        .collect();

    let mut received = 0;
    while received < total {
        let event = next_event(&bridge, server);
        bridge.packet_destroy(event.packet.unwrap()).unwrap();
        received += 1;
    }
    for sender in senders {
        sender.join().unwrap();
    }
    assert_eq!(engine.live_packets(), 0);
}

#[test]
fn destroy_waits_for_inflight_service() {
    let bridge = Arc::new(Bridge::with_engine(Arc::new(LoopbackEngine::new())).unwrap());
    let host = bridge.host_create(None, 1, 1, 0, 0).unwrap();

    let servicing = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || bridge.host_service(host, Duration::from_millis(300)))
    };
    thread::sleep(Duration::from_millis(100));
    bridge.host_destroy(host).unwrap();

    // Either the service finished before the host went away, or it never
    // started. It must not observe the host vanishing underneath it.
    match servicing.join().unwrap() {
        Ok(ServiceOutcome::NoEvent) | Err(BridgeError::StaleHandle(ResourceKind::Host)) => {}
        other => panic!("unexpected service result: {other:?}"),
    }
    assert!(matches!(
        bridge.host_flush(host),
        Err(BridgeError::StaleHandle(ResourceKind::Host))
    ));
}

#[test]
fn packets_are_independent_of_hosts() {
    let bridge = Arc::new(Bridge::with_engine(Arc::new(LoopbackEngine::new())).unwrap());
    let workers: Vec<_> = (0..8)
        .map(|i| {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || {
                for n in 0..500u32 {
                    let payload = (i * 1000 + n).to_le_bytes();
                    let packet = bridge.packet_create(&payload, PacketFlags::RELIABLE).unwrap();
                    assert_eq!(&bridge.packet_data(packet).unwrap()[..], &payload);
                    bridge.packet_destroy(packet).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(bridge.live_packets(), 0);
    assert_eq!(bridge.metrics().snapshot().packets_destroyed, 4000);
}
