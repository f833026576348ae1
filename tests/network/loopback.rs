//! Handshake and lockstep between real UDP sockets on the loopback interface.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::{
    fast_builder, fast_handshake, init_tracing, loopback_roster, open_transport, run_frames,
    PortAllocator,
};
use fortress_lockstep::telemetry::CollectingObserver;
use fortress_lockstep::{
    CollectingSink, Frame, GameParams, HandshakeConfig, LockstepConfig, MatchBuilder, MatchRules,
    MatchSetup, NetplayError, NetplayEvent, PlayerIndex,
};
use serial_test::serial;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use web_time::Duration;

#[test]
#[serial]
fn two_peers_handshake_and_run_frames() {
    init_tracing();
    let ports = PortAllocator::next_ports::<2>();
    let params = GameParams {
        wave: 4,
        turbo: true,
        rules: MatchRules::DeathMatch(10),
    };

    let (host_frames, guest_frames) = std::thread::scope(|s| {
        let host = s.spawn(move || {
            let mut transport = open_transport(ports[0]);
            let mut session = fast_builder()
                .with_seed(0x5EED)
                .host_match(&mut transport, loopback_roster(0, &ports), params)
                .unwrap();
            assert_eq!(session.params(), params);
            run_frames(&mut session, 30)
        });
        let guest = s.spawn(move || {
            let mut transport = open_transport(ports[1]);
            let mut session = fast_builder()
                .join_match(&mut transport, loopback_roster(1, &ports))
                .unwrap();
            assert_eq!(session.params(), params);
            assert_eq!(session.seed(), 0x5EED);
            let frames = run_frames(&mut session, 30);
            assert_eq!(session.frame(), Frame::new(30));
            frames
        });
        (host.join().unwrap(), guest.join().unwrap())
    });

    assert_eq!(host_frames, guest_frames);
    assert_eq!(host_frames.len(), 30);
    for players in &host_frames {
        assert_eq!(players[0].len(), 1);
        assert_eq!(players[1].len(), 1);
        assert!(players[2].is_empty());
    }
}

#[test]
#[serial]
fn three_peers_agree_on_every_frame() {
    let ports = PortAllocator::next_ports::<3>();

    let outcomes: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..3)
            .map(|local| {
                s.spawn(move || {
                    let mut transport = open_transport(ports[local]);
                    let roster = loopback_roster(local, &ports);
                    let mut session = if local == 0 {
                        fast_builder()
                            .with_seed(77)
                            .host_match(&mut transport, roster, GameParams::default())
                            .unwrap()
                    } else {
                        fast_builder().join_match(&mut transport, roster).unwrap()
                    };
                    let frames = run_frames(&mut session, 25);
                    (frames, session.seed())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[1], outcomes[2]);
    assert_eq!(outcomes[0].1, 77);
}

#[test]
#[serial]
fn silent_peer_fails_the_frame_after_the_retry_budget() {
    let [host_port, silent_port] = PortAllocator::next_ports::<2>();
    let ports = [host_port, silent_port];
    let mut transport = open_transport(host_port);
    let events = Arc::new(CollectingSink::new());
    let observer = Arc::new(CollectingObserver::new());

    let mut session = MatchBuilder::new()
        .with_lockstep_config(LockstepConfig {
            wait_slice: Duration::from_millis(10),
            retry_budget: 5,
            ..LockstepConfig::default()
        })
        .with_event_sink(events.clone())
        .with_violation_observer(observer.clone())
        .start_lockstep(
            &mut transport,
            MatchSetup::new(loopback_roster(0, &ports), GameParams::default(), 1),
        )
        .unwrap();

    let err = session.advance_frame().unwrap_err();
    assert_eq!(
        err,
        NetplayError::FrameTimeout {
            frame: Frame::ZERO,
            missing: vec![PlayerIndex::new(1)],
        }
    );
    assert_eq!(session.stats().resends, 5);
    assert!(matches!(
        events.events().as_slice(),
        [NetplayEvent::MatchAborted { frame: Some(Frame::ZERO), .. }]
    ));
}

#[test]
#[serial]
fn client_without_a_host_times_out() {
    let ports = PortAllocator::next_ports::<2>();
    let mut transport = open_transport(ports[1]);
    let events = Arc::new(CollectingSink::new());
    let result = MatchBuilder::new()
        .with_handshake_config(HandshakeConfig {
            timeout: Some(Duration::from_millis(200)),
            ..fast_handshake()
        })
        .with_event_sink(events.clone())
        .join_match(&mut transport, loopback_roster(1, &ports));

    assert!(matches!(
        result,
        Err(NetplayError::HandshakeTimeout { elapsed_ms }) if elapsed_ms >= 200
    ));
    assert!(matches!(
        events.events().as_slice(),
        [NetplayEvent::MatchAborted { frame: None, .. }]
    ));
}

#[test]
#[serial]
fn abort_signal_ends_a_waiting_host() {
    let ports = PortAllocator::next_ports::<2>();
    let mut transport = open_transport(ports[0]);
    let abort = Arc::new(AtomicBool::new(true));
    let result = fast_builder().with_abort_signal(abort).host_match(
        &mut transport,
        loopback_roster(0, &ports),
        GameParams::default(),
    );
    let err = result.unwrap_err();
    assert!(err.is_cancellation());
}
