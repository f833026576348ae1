//! Lobby discovery over loopback UDP, from listing a game to the first lockstep frame.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::{fast_builder, localhost, open_transport, run_frames, PortAllocator};
use fortress_lockstep::{
    DiscoveryServer, DiscoveryServerConfig, GameParams, LobbyConfig, LobbyDiscovery, LobbyPoll,
    LobbyState, MatchRules, TransportSession,
};
use serial_test::serial;
use std::sync::atomic::{AtomicBool, Ordering};
use web_time::{Duration, Instant};

const HOST_ID: u32 = 0xA11CE;
const GUEST_ID: u32 = 0xB0B;
const DEADLINE: Duration = Duration::from_secs(10);

fn quick_lobby(name: &str, id: u32) -> LobbyConfig {
    LobbyConfig {
        refresh_interval: Duration::from_millis(50),
        local_discovery: None,
        ..LobbyConfig::new(name).with_unique_id(id)
    }
}

/// Polls `lobby` every few milliseconds until `done` holds.
///
/// # Panics
///
/// Panics if `done` does not hold within [`DEADLINE`].
fn poll_until(
    lobby: &mut LobbyDiscovery,
    transport: &mut TransportSession,
    mut done: impl FnMut(&LobbyDiscovery, LobbyPoll) -> bool,
) {
    let started = Instant::now();
    loop {
        let outcome = lobby.poll(transport, Instant::now()).unwrap();
        if done(lobby, outcome) {
            return;
        }
        assert!(started.elapsed() < DEADLINE, "lobby stuck in {}", lobby.state());
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}

#[test]
#[serial]
fn guest_finds_joins_and_plays_a_hosted_game() {
    let [host_port, guest_port] = PortAllocator::next_ports::<2>();
    let params = GameParams {
        wave: 2,
        turbo: false,
        rules: MatchRules::DeathMatch(5),
    };

    let (host_frames, guest_frames) = std::thread::scope(|s| {
        let host = s.spawn(move || {
            let mut transport = open_transport(host_port);
            let mut lobby = LobbyDiscovery::new(quick_lobby("host", HOST_ID)).unwrap();
            lobby.start();
            lobby.set_hosting(&mut transport, true).unwrap();
            poll_until(&mut lobby, &mut transport, |lobby, _| {
                lobby.hosted_game().is_some_and(|game| game.player_count() == 2)
            });

            let roster = lobby.match_roster().unwrap();
            assert!(roster.is_host());
            let mut session = fast_builder()
                .with_seed(0xC0FFEE)
                .host_match(&mut transport, roster, params)
                .unwrap();
            run_frames(&mut session, 20)
        });

        let guest = s.spawn(move || {
            let mut transport = open_transport(guest_port);
            let config = LobbyConfig {
                local_discovery: Some(localhost(host_port)),
                ..quick_lobby("guest", GUEST_ID)
            };
            let mut lobby = LobbyDiscovery::new(config).unwrap();
            lobby.start();
            poll_until(&mut lobby, &mut transport, |lobby, _| {
                lobby.games().get(HOST_ID).is_some()
            });
            assert_eq!(lobby.games().get(HOST_ID).unwrap().host, localhost(host_port));

            lobby.join_game(&mut transport, HOST_ID).unwrap();
            poll_until(&mut lobby, &mut transport, |_, outcome| {
                outcome == LobbyPoll::MatchStarting
            });
            assert_eq!(lobby.state(), LobbyState::Joined);

            let roster = lobby.match_roster().unwrap();
            assert_eq!(roster.local().as_usize(), 1);
            let mut session = fast_builder().join_match(&mut transport, roster).unwrap();
            assert_eq!(session.params(), params);
            assert_eq!(session.seed(), 0xC0FFEE);
            run_frames(&mut session, 20)
        });

        (host.join().unwrap(), guest.join().unwrap())
    });

    assert_eq!(host_frames, guest_frames);
    assert_eq!(host_frames.len(), 20);
}

#[test]
#[serial]
fn discovery_server_introduces_guest_to_host() {
    let [server_port, host_port, guest_port] = PortAllocator::next_ports::<3>();
    let stop = AtomicBool::new(false);
    let stop = &stop;

    std::thread::scope(|s| {
        let server = s.spawn(move || {
            let mut transport = open_transport(server_port);
            let mut server = DiscoveryServer::new(DiscoveryServerConfig::default());
            while !stop.load(Ordering::Acquire) {
                transport.poll(Duration::from_millis(10)).unwrap();
                server.pump(&mut transport, Instant::now()).unwrap();
            }
            // the host's farewell may still be queued
            transport.poll(Duration::from_millis(50)).unwrap();
            server.pump(&mut transport, Instant::now()).unwrap();
            server.hosts().collect::<Vec<_>>()
        });

        let host = s.spawn(move || {
            let mut transport = open_transport(host_port);
            let config = LobbyConfig {
                global_server: Some(localhost(server_port)),
                ..quick_lobby("host", HOST_ID)
            };
            let mut lobby = LobbyDiscovery::new(config).unwrap();
            lobby.start();
            lobby.set_hosting(&mut transport, true).unwrap();
            poll_until(&mut lobby, &mut transport, |lobby, _| {
                lobby.hosted_game().is_some_and(|game| game.player_count() == 2)
                    || stop.load(Ordering::Acquire)
            });
            lobby.stop(&mut transport).unwrap();
        });

        let guest = s.spawn(move || {
            let mut transport = open_transport(guest_port);
            let config = LobbyConfig {
                global_server: Some(localhost(server_port)),
                ..quick_lobby("guest", GUEST_ID)
            };
            let mut lobby = LobbyDiscovery::new(config).unwrap();
            lobby.start();
            poll_until(&mut lobby, &mut transport, |lobby, _| {
                lobby.games().get(HOST_ID).is_some()
            });
            lobby.join_game(&mut transport, HOST_ID).unwrap();
            poll_until(&mut lobby, &mut transport, |lobby, _| {
                lobby.state() == LobbyState::Joined
            });
            let game = lobby.joined_game().unwrap();
            assert_eq!(game.snapshot.player_count(), 2);
            assert_eq!(game.snapshot.players[1].player_id, GUEST_ID);
        });

        guest.join().unwrap();
        host.join().unwrap();
        stop.store(true, Ordering::Release);
        let hosts = server.join().unwrap();
        assert!(hosts.is_empty(), "REMOVE_GAME should unregister the host: {hosts:?}");
    });
}
