use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use mx::{
    DisconnectReason, Dispatcher, DispatcherEvent, EndpointState, Protocol, SessionId, Target,
    TransportConfig, TransportError,
};
use mx::net::{FragmentHeader, WireMessage};

const TIMEOUT: Duration = Duration::from_secs(5);

fn bind() -> Dispatcher {
    Dispatcher::bind("127.0.0.1:0", TransportConfig::default()).unwrap()
}

/// Ticks every dispatcher until `done` holds or the timeout passes.
fn pump_until<F>(nodes: &[&Dispatcher], events: &mut [Vec<DispatcherEvent>], done: F) -> bool
where
    F: Fn(&[Vec<DispatcherEvent>]) -> bool,
{
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        for (node, log) in nodes.iter().zip(events.iter_mut()) {
            node.update().unwrap();
            log.extend(node.drain_events());
        }
        if done(events) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn pump_for(nodes: &[&Dispatcher], events: &mut [Vec<DispatcherEvent>], duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        for (node, log) in nodes.iter().zip(events.iter_mut()) {
            node.update().unwrap();
            log.extend(node.drain_events());
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn received(events: &[DispatcherEvent], expected: &[u8], reliable_only: bool) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(e, DispatcherEvent::MessageReceived { payload, reliable, .. }
                if payload == expected && (*reliable || !reliable_only))
        })
        .count()
}

fn acknowledged(events: &[DispatcherEvent], expected: &[u8], is_reliable: bool) -> bool {
    events.iter().any(|e| {
        matches!(e, DispatcherEvent::MessageAcknowledged { payload, reliable, .. }
            if payload == expected && *reliable == is_reliable)
    })
}

fn connected_session(events: &[DispatcherEvent]) -> Option<SessionId> {
    events.iter().find_map(|e| match e {
        DispatcherEvent::Connected { session, .. } => Some(*session),
        _ => None,
    })
}

#[test]
fn test_probe_answered_without_session() {
    let node = bind();
    let addr = node.local_addr();

    let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
    raw.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
    raw.send_to(&mx::net::PROBE_REQUEST, addr).unwrap();

    let mut buffer = [0u8; 16];
    let start = Instant::now();
    let reply = loop {
        node.update().unwrap();
        if let Ok((size, from)) = raw.recv_from(&mut buffer) {
            assert_eq!(from, addr);
            break buffer[..size].to_vec();
        }
        assert!(start.elapsed() < TIMEOUT, "no probe response");
    };

    assert_eq!(reply, mx::net::PROBE_RESPONSE);
    assert!(node.sessions().unwrap().is_empty());
    assert!(node.drain_events().is_empty());
    assert_eq!(node.stats().unwrap().probes_answered, 1);
}

#[test]
fn test_probe_helper_against_shared_dispatcher() {
    let node = Arc::new(bind());
    let addr = node.local_addr();
    let running = Arc::new(AtomicBool::new(true));

    let pump = {
        let node = Arc::clone(&node);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                node.update().unwrap();
                thread::sleep(Duration::from_millis(2));
            }
        })
    };

    let rtt = mx::probe(addr, Duration::from_secs(2)).unwrap();
    running.store(false, Ordering::SeqCst);
    pump.join().unwrap();

    assert!(rtt.is_some());
    assert!(node.sessions().unwrap().is_empty());
}

#[test]
fn test_reliable_hello_world_delivered_once() {
    let a = bind();
    let b = bind();
    let mut events = vec![Vec::new(), Vec::new()];

    let to_b = a.connect(b.local_addr()).unwrap();
    a.send(Target::Session(to_b), b"hello-world", true).unwrap();

    let done = pump_until(&[&a, &b], &mut events, |events| {
        acknowledged(&events[0], b"hello-world", true)
    });
    assert!(done, "reliable message was never acknowledged");

    // Give duplicates a chance to show up.
    pump_for(&[&a, &b], &mut events, Duration::from_millis(300));

    assert_eq!(received(&events[1], b"hello-world", true), 1);
    assert!(connected_session(&events[1]).is_some());
    assert!(
        !events[0]
            .iter()
            .any(|e| matches!(e, DispatcherEvent::MessageLost { payload, .. } if payload == b"hello-world"))
    );
    assert_eq!(
        a.endpoint_state(b.local_addr()).unwrap(),
        EndpointState::Connected(to_b)
    );
}

#[test]
fn test_large_reliable_payload_reassembled() {
    let a = bind();
    let b = bind();
    let mut events = vec![Vec::new(), Vec::new()];

    let payload: Vec<u8> = (0..3000u32).map(|i| (i * 7 % 256) as u8).collect();
    let to_b = a.connect(b.local_addr()).unwrap();
    a.send(Target::Session(to_b), &payload, true).unwrap();

    let done = pump_until(&[&a, &b], &mut events, |events| {
        acknowledged(&events[0], &payload, true)
    });
    assert!(done, "large reliable message was never acknowledged");

    assert_eq!(received(&events[1], &payload, true), 1);

    let last_receive = events[1]
        .iter()
        .filter_map(|e| match e {
            DispatcherEvent::ReliableReceiveProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(last_receive.total_fragments, 6);
    assert_eq!(last_receive.current_fragments, 6);
    assert_eq!(last_receive.total_size, payload.len());
    assert!(!last_receive.is_sending);

    let last_send = events[0]
        .iter()
        .filter_map(|e| match e {
            DispatcherEvent::ReliableSendProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .last()
        .unwrap();
    assert!(last_send.is_complete());
    assert_eq!(last_send.total_size, payload.len());
}

#[test]
fn test_reliable_after_reconnect_is_delivered() {
    let a = bind();
    let b = bind();
    let mut events = vec![Vec::new(), Vec::new()];

    let to_a = b.connect(a.local_addr()).unwrap();
    b.send(Target::Session(to_a), b"one", true).unwrap();
    assert!(pump_until(&[&a, &b], &mut events, |events| {
        acknowledged(&events[1], b"one", true)
    }));

    b.disconnect(to_a).unwrap();
    let again = b.connect(a.local_addr()).unwrap();
    b.send(Target::Session(again), b"two", true).unwrap();

    let done = pump_until(&[&a, &b], &mut events, |events| {
        acknowledged(&events[1], b"two", true)
    });
    assert!(done, "reliable message after reconnect was never acknowledged");
    pump_for(&[&a, &b], &mut events, Duration::from_millis(200));

    assert_eq!(received(&events[0], b"one", true), 1);
    assert_eq!(received(&events[0], b"two", true), 1);
    assert_eq!(a.sessions().unwrap().len(), 1);
}

#[test]
fn test_realtime_group_fan_out() {
    let a = bind();
    let b = bind();
    let mut events = vec![Vec::new(), Vec::new()];

    let to_b = a.connect(b.local_addr()).unwrap();
    a.place_in_group(to_b, "peer").unwrap();
    a.send(Target::Group("peer"), b"tick", false).unwrap();

    let done = pump_until(&[&a, &b], &mut events, |events| {
        acknowledged(&events[0], b"tick", false)
    });
    assert!(done);

    assert_eq!(received(&events[1], b"tick", false), 1);
    assert!(
        events[0]
            .iter()
            .any(|e| matches!(e, DispatcherEvent::MessageSent { payload, .. } if payload == b"tick"))
    );
    assert_eq!(a.group_members("peer").unwrap(), vec![to_b]);
    assert!(matches!(
        a.send(Target::Group(""), b"tick", false),
        Err(TransportError::UngroupedTarget)
    ));
}

#[test]
fn test_disconnect_blacklists_until_connect() {
    let a = bind();
    let b = bind();
    let mut events = vec![Vec::new(), Vec::new()];

    a.connect(b.local_addr()).unwrap();
    assert!(pump_until(&[&a, &b], &mut events, |events| {
        connected_session(&events[1]).is_some()
    }));
    let to_a = connected_session(&events[1]).unwrap();

    b.disconnect(to_a).unwrap();
    assert_eq!(
        b.endpoint_state(a.local_addr()).unwrap(),
        EndpointState::Disconnected
    );

    events[1].clear();
    pump_for(&[&a, &b], &mut events, Duration::from_millis(400));

    assert!(b.sessions().unwrap().is_empty());
    assert!(connected_session(&events[1]).is_none());
    assert!(matches!(b.disconnect(to_a), Err(TransportError::UnknownSession(_))));

    let again = b.connect(a.local_addr()).unwrap();
    assert_ne!(again, to_a);
    assert!(pump_until(&[&a, &b], &mut events, |_| {
        b.endpoint_state(a.local_addr()).unwrap() == EndpointState::Connected(again)
    }));
}

#[test]
fn test_silent_peer_times_out_once() {
    let config = TransportConfig {
        disconnect_limit: 20,
        disconnect_warning_limit: 5,
        ..Default::default()
    };
    let a = Dispatcher::bind("127.0.0.1:0", config).unwrap();
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let silent_addr: SocketAddr = silent.local_addr().unwrap();

    let session = a.connect(silent_addr).unwrap();
    let mut log = Vec::new();
    for _ in 0..40 {
        a.update().unwrap();
        log.extend(a.drain_events());
    }

    let disconnects: Vec<_> = log
        .iter()
        .filter(|e| matches!(e, DispatcherEvent::Disconnected { .. }))
        .collect();
    assert_eq!(
        disconnects,
        vec![&DispatcherEvent::Disconnected {
            session,
            addr: silent_addr,
            reason: DisconnectReason::TimedOut,
        }]
    );
    assert!(
        log.iter()
            .any(|e| matches!(e, DispatcherEvent::DisconnectWarning { .. }))
    );
    assert_eq!(
        a.endpoint_state(silent_addr).unwrap(),
        EndpointState::Disconnected
    );
}

#[test]
fn test_receive_filter_vetoes_payload() {
    let a = bind();
    let b = bind();
    let mut events = vec![Vec::new(), Vec::new()];

    b.set_receive_filter(|_, protocol, payload| {
        !(protocol == Protocol::Realtime && payload == b"drop")
    })
    .unwrap();

    let to_b = a.connect(b.local_addr()).unwrap();
    a.send(Target::Session(to_b), b"drop", false).unwrap();

    let done = pump_until(&[&a, &b], &mut events, |events| {
        events[0]
            .iter()
            .any(|e| matches!(e, DispatcherEvent::MessageLost { payload, .. } if payload == b"drop"))
    });
    assert!(done, "vetoed payload was never reported lost");
    assert_eq!(received(&events[1], b"drop", false), 0);
}

#[test]
fn test_isolate_keeps_one_member() {
    let hub = bind();
    let first = bind();
    let second = bind();
    let mut events = vec![Vec::new(), Vec::new(), Vec::new()];

    first.connect(hub.local_addr()).unwrap();
    second.connect(hub.local_addr()).unwrap();
    assert!(pump_until(&[&hub, &first, &second], &mut events, |_| {
        hub.sessions().unwrap().len() == 2
    }));

    for session in hub.sessions().unwrap() {
        hub.place_in_group(session, "player").unwrap();
    }
    pump_for(&[&hub, &first, &second], &mut events, Duration::from_millis(50));

    let kept = hub.isolate("player").unwrap().unwrap();

    assert_eq!(hub.group_members("player").unwrap(), vec![kept]);
    let isolated = events[0]
        .iter()
        .chain(hub.drain_events().iter())
        .filter(|e| {
            matches!(e, DispatcherEvent::Disconnected { reason: DisconnectReason::Isolated, .. })
        })
        .count();
    assert_eq!(isolated, 1);
}

#[test]
fn test_close_fails_subsequent_calls() {
    let a = bind();
    let peer = a.connect("127.0.0.1:9".parse().unwrap()).unwrap();

    a.close().unwrap();

    assert!(matches!(a.update(), Err(TransportError::Closed)));
    assert!(matches!(a.connect("127.0.0.1:9".parse().unwrap()), Err(TransportError::Closed)));
    assert!(matches!(a.sessions(), Err(TransportError::Closed)));
    assert!(a.drain_events().iter().any(|e| matches!(
        e,
        DispatcherEvent::Disconnected { session, reason: DisconnectReason::Closed, .. } if *session == peer
    )));
}

#[test]
fn test_corrupt_fragment_fails_tick_after_all_sessions_update() {
    let a = bind();
    let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();

    let from_raw = a.connect(raw.local_addr().unwrap()).unwrap();
    let to_silent = a.connect(silent.local_addr().unwrap()).unwrap();

    let send_fragment = |sequence: u32, index: u8, total: u8, data: &[u8]| {
        let mut fragment = Vec::new();
        FragmentHeader {
            epoch: 7,
            message_id: 0,
            length: data.len() as u16,
            index,
            total,
        }
        .write(&mut fragment);
        fragment.extend_from_slice(data);

        let message = WireMessage::new(Protocol::Reliable, sequence, u32::MAX, 0)
            .with_epoch(7)
            .with_payloads(vec![fragment]);
        raw.send_to(&message.serialize().unwrap(), a.local_addr())
            .unwrap();
    };

    send_fragment(0, 0, 2, b"first half");
    send_fragment(1, 3, 2, b"out of bounds");
    send_fragment(2, 1, 2, b"second half");

    let start = Instant::now();
    let error = loop {
        let before = a.session_info(to_silent).unwrap().disconnect_accumulator;
        if let Err(err) = a.update() {
            // The session after the corrupt one still ran this tick.
            let after = a.session_info(to_silent).unwrap().disconnect_accumulator;
            assert_eq!(after, before + 1);
            break err;
        }
        assert!(start.elapsed() < TIMEOUT, "corrupt fragment never surfaced");
        thread::sleep(Duration::from_millis(5));
    };
    assert!(matches!(error, TransportError::CorruptMessage { .. }));

    for _ in 0..20 {
        a.update().unwrap();
        thread::sleep(Duration::from_millis(5));
    }

    let events = a.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        DispatcherEvent::ReliableReceiveProgress { session, progress }
            if *session == from_raw && progress.current_fragments == 1 && progress.total_fragments == 2
    )));
    // The partial was dropped, so the second half alone never completes it.
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, DispatcherEvent::MessageReceived { reliable: true, .. }))
    );
    assert_eq!(a.stats().unwrap().corrupt_messages, 1);
    assert!(a.sessions().unwrap().contains(&from_raw));
}
