//! Network resilience integration tests using `ChaosSocket`.
//!
//! Each peer wraps its UDP socket in a `ChaosSocket`. Loss is switched off for the last
//! few frames so no peer finishes while another still needs a resend from it.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::{fast_builder, loopback_roster, run_frames, PortAllocator};
use fortress_lockstep::{
    ChaosConfig, ChaosSocket, GameParams, LockstepSession, LockstepStats, TransportSession,
    UdpDatagramSocket,
};
use serial_test::serial;

type ChaosTransport = TransportSession<ChaosSocket<UdpDatagramSocket>>;

const QUIET_TAIL: u32 = 3;

fn chaos_transport(port: u16, config: ChaosConfig) -> ChaosTransport {
    let inner = UdpDatagramSocket::bind_to_port(port).unwrap();
    TransportSession::with_socket(ChaosSocket::new(inner, config))
}

fn run_with_quiet_tail(
    session: &mut LockstepSession<'_, ChaosSocket<UdpDatagramSocket>>,
    frames: u32,
) -> Vec<Vec<Vec<fortress_lockstep::InputRecord>>> {
    let mut delivered = run_frames(session, frames - QUIET_TAIL);
    session
        .transport_mut()
        .socket_mut()
        .set_config(ChaosConfig::passthrough());
    delivered.extend(run_frames(session, QUIET_TAIL));
    delivered
}

/// Runs a full match among `configs.len()` chaotic peers and returns each peer's
/// delivered input and stats.
fn chaotic_match(
    configs: Vec<ChaosConfig>,
    frames: u32,
) -> Vec<(Vec<Vec<Vec<fortress_lockstep::InputRecord>>>, LockstepStats)> {
    let count = configs.len();
    let ports: Vec<u16> = (0..count).map(|_| PortAllocator::next_port()).collect();
    let ports = &ports;

    std::thread::scope(|s| {
        let handles: Vec<_> = configs
            .into_iter()
            .enumerate()
            .map(|(local, config)| {
                s.spawn(move || {
                    let mut transport = chaos_transport(ports[local], config);
                    let roster = loopback_roster(local, ports);
                    let mut session = if local == 0 {
                        fast_builder()
                            .with_seed(3)
                            .host_match(&mut transport, roster, GameParams::default())
                            .unwrap()
                    } else {
                        fast_builder().join_match(&mut transport, roster).unwrap()
                    };
                    let delivered = run_with_quiet_tail(&mut session, frames);
                    let stats = session.stats();
                    (delivered, stats)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
#[serial]
fn lockstep_survives_packet_loss() {
    let configs = (0..3)
        .map(|i| {
            ChaosConfig::builder()
                .packet_loss_rate(0.15)
                .seed(100 + i)
                .build()
        })
        .collect();
    let outcomes = chaotic_match(configs, 40);

    assert_eq!(outcomes[0].0, outcomes[1].0);
    assert_eq!(outcomes[1].0, outcomes[2].0);
    let total_resends: u64 = outcomes.iter().map(|(_, stats)| stats.resends).sum();
    assert!(total_resends > 0, "15% loss should force at least one resend");
    for (_, stats) in &outcomes {
        assert_eq!(stats.frames_completed, 40);
    }
}

#[test]
#[serial]
fn duplicated_packets_are_delivered_once() {
    let configs = (0..2)
        .map(|i| {
            ChaosConfig::builder()
                .duplication_rate(0.5)
                .seed(7 + i)
                .build()
        })
        .collect();
    let outcomes = chaotic_match(configs, 30);

    assert_eq!(outcomes[0].0, outcomes[1].0);
    for (delivered, _) in &outcomes {
        for players in delivered {
            assert_eq!(players[0].len(), 1);
            assert_eq!(players[1].len(), 1);
        }
    }
    // a late copy of the previous frame reads as a resend request
    let discarded: u64 = outcomes
        .iter()
        .map(|(_, s)| s.duplicates_discarded + s.stale_discarded + s.resends)
        .sum();
    assert!(discarded > 0);
}

#[test]
#[serial]
fn burst_loss_is_recovered() {
    let configs = vec![
        ChaosConfig::builder().burst_loss(0.05, 4).seed(1).build(),
        ChaosConfig::flaky_wifi(),
    ];
    let outcomes = chaotic_match(configs, 30);
    assert_eq!(outcomes[0].0, outcomes[1].0);
}
