//! The one-shot game-start handshake.
//!
//! The host sends a start packet carrying the match parameters and the initial seed to
//! every peer and resends it until each peer has echoed it back with its own index. A
//! client waits for the host's packet, adopts the seed and replies once. The reply is kept
//! in [`MatchSetup`] so the lockstep session can answer a resend that arrives late.

use std::net::SocketAddrV4;
use std::sync::Arc;

use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::network::messages::{MessageKind, StartPacket};
use crate::network::transport::{Channel, Datagram, TransportSession};
use crate::sessions::config::HandshakeConfig;
use crate::sessions::event_sink::TracingSink;
use crate::sessions::roster::Roster;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    report_violation_to, AbortSignal, DatagramSocket, EventSink, NetplayError, NetplayEvent,
    NeverAbort, PlayerIndex, MAX_PLAYERS,
};

/// How a match is won or lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MatchRules {
    /// Cooperative play with this many lives each.
    Lives(u32),
    /// Death match for this many players.
    DeathMatch(u32),
}

impl Default for MatchRules {
    fn default() -> Self {
        Self::Lives(3)
    }
}

/// Match parameters chosen by the host and carried by the start packet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub struct GameParams {
    /// Starting wave.
    pub wave: u32,
    /// Turbo mode.
    pub turbo: bool,
    /// Lives or death match.
    pub rules: MatchRules,
}

impl GameParams {
    /// Checks that every value fits its wire field.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if the lives or death-match count needs
    /// the top bit of its 32-bit field.
    pub fn validate(&self) -> Result<(), NetplayError> {
        let (MatchRules::Lives(value) | MatchRules::DeathMatch(value)) = self.rules;
        if value >= 0x8000_0000 {
            return Err(NetplayError::invalid(format!(
                "{:?} does not fit in 31 bits",
                self.rules
            )));
        }
        Ok(())
    }
}

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchSetup {
    /// Participants and their addresses.
    pub roster: Roster,
    /// Agreed parameters.
    pub params: GameParams,
    /// Agreed initial seed of the shared generator.
    pub seed: u32,
    /// The ack a client sent, kept for re-acking a late host resend.
    pub(crate) start_reply: Option<Vec<u8>>,
}

impl MatchSetup {
    /// Builds a setup directly, for a match whose parameters were agreed out of band.
    #[must_use]
    pub fn new(roster: Roster, params: GameParams, seed: u32) -> Self {
        Self {
            roster,
            params,
            seed,
            start_reply: None,
        }
    }
}

/// Runs the start handshake on either side.
pub struct GameStartCoordinator {
    config: HandshakeConfig,
    abort: Arc<dyn AbortSignal>,
    events: Arc<dyn EventSink>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for GameStartCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            config,
            abort: _,
            events: _,
            violation_observer,
        } = self;
        f.debug_struct("GameStartCoordinator")
            .field("config", config)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for GameStartCoordinator {
    fn default() -> Self {
        Self::new(HandshakeConfig::default())
    }
}

impl GameStartCoordinator {
    /// Creates a coordinator that never aborts and logs events through tracing.
    #[must_use]
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            abort: Arc::new(NeverAbort),
            events: Arc::new(TracingSink),
            violation_observer: None,
        }
    }

    /// Sets the signal checked before every wait.
    #[must_use]
    pub fn with_abort_signal(mut self, abort: Arc<dyn AbortSignal>) -> Self {
        self.abort = abort;
        self
    }

    /// Sets where `MatchStarted` and `MatchAborted` go.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Routes protocol violations to `observer` instead of the tracing log.
    #[must_use]
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Host side: sends the start packet and waits for exactly one ack per peer.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidRequest`] if the roster is not a valid host roster.
    /// - [`NetplayError::HandshakeConflict`] if a peer claims the host slot or a slot
    ///   bound to another address.
    /// - [`NetplayError::HandshakeTimeout`] if the configured timeout expires.
    /// - [`NetplayError::Cancelled`] if the abort signal fires.
    /// - [`NetplayError::SocketError`] on a transport failure.
    pub fn run_host<S: DatagramSocket>(
        &self,
        transport: &mut TransportSession<S>,
        roster: &Roster,
        params: GameParams,
        seed: u32,
    ) -> Result<MatchSetup, NetplayError> {
        let result = self.host_handshake(transport, roster, params, seed);
        self.finish(roster, result)
    }

    /// Client side: waits for the host's start packet and acks it once.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidRequest`] if the roster is not a valid client roster.
    /// - [`NetplayError::HandshakeConflict`] if a start packet claiming the host slot
    ///   comes from an address other than the host's.
    /// - [`NetplayError::HandshakeTimeout`] if the configured timeout expires.
    /// - [`NetplayError::Cancelled`] if the abort signal fires.
    /// - [`NetplayError::SocketError`] on a transport failure.
    pub fn run_client<S: DatagramSocket>(
        &self,
        transport: &mut TransportSession<S>,
        roster: &Roster,
    ) -> Result<MatchSetup, NetplayError> {
        let result = self.client_handshake(transport, roster);
        self.finish(roster, result)
    }

    fn finish(
        &self,
        roster: &Roster,
        result: Result<MatchSetup, NetplayError>,
    ) -> Result<MatchSetup, NetplayError> {
        match &result {
            Ok(setup) => {
                debug!(seed = setup.seed, local = %roster.local(), "handshake complete");
                self.events.on_event(&NetplayEvent::MatchStarted {
                    seed: setup.seed,
                    local: roster.local(),
                    players: roster.present_count(),
                });
            },
            Err(err) => {
                if let NetplayError::HandshakeConflict { claimed, from } = err {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::Handshake,
                        "{} claimed slot {}",
                        from,
                        claimed
                    );
                }
                self.events.on_event(&NetplayEvent::MatchAborted {
                    frame: None,
                    reason: err.to_string(),
                });
            },
        }
        result
    }

    fn check_deadline(&self, started: Instant) -> Result<(), NetplayError> {
        if self.abort.abort_requested() {
            return Err(NetplayError::Cancelled);
        }
        if let Some(limit) = self.config.timeout {
            let elapsed = started.elapsed();
            if elapsed >= limit {
                return Err(NetplayError::HandshakeTimeout {
                    elapsed_ms: elapsed.as_millis(),
                });
            }
        }
        Ok(())
    }

    /// Waits at most one poll slice, never past the overall timeout.
    fn slice(&self, started: Instant) -> Duration {
        match self.config.timeout {
            Some(limit) => self
                .config
                .poll_slice
                .min(limit.saturating_sub(started.elapsed())),
            None => self.config.poll_slice,
        }
    }

    fn host_handshake<S: DatagramSocket>(
        &self,
        transport: &mut TransportSession<S>,
        roster: &Roster,
        params: GameParams,
        seed: u32,
    ) -> Result<MatchSetup, NetplayError> {
        if !roster.is_host() {
            return Err(NetplayError::invalid(
                "run_host needs a roster whose local slot is 0",
            ));
        }
        roster.validate()?;
        params.validate()?;
        transport.bind_roster(roster);
        transport.refresh_requeued_channels();

        let start = StartPacket {
            sender: PlayerIndex::HOST,
            params,
            seed,
        }
        .encode();

        let mut acked = [true; MAX_PLAYERS];
        for (index, _) in roster.peers() {
            if let Some(flag) = acked.get_mut(index.as_usize()) {
                *flag = false;
            }
        }

        let started = Instant::now();
        let mut last_send: Option<Instant> = None;
        let mut stashed = Vec::new();

        while acked.iter().any(|done| !done) {
            self.check_deadline(started)?;

            if last_send.is_none_or(|at| at.elapsed() >= self.config.resend_interval) {
                for index in PlayerIndex::all().filter(|i| !acked[i.as_usize()]) {
                    transport.send(Channel::Peer(index), &start)?;
                }
                trace!(pending = acked.iter().filter(|d| !**d).count(), "start packet sent");
                last_send = Some(Instant::now());
            }

            if !transport.poll(self.slice(started))? {
                continue;
            }
            while let Some(datagram) = transport.receive()? {
                self.host_on_datagram(datagram, &mut acked, &mut stashed)?;
            }
        }

        requeue_all(transport, stashed);
        Ok(MatchSetup::new(*roster, params, seed))
    }

    fn host_on_datagram(
        &self,
        datagram: Datagram,
        acked: &mut [bool; MAX_PLAYERS],
        stashed: &mut Vec<Datagram>,
    ) -> Result<(), NetplayError> {
        match MessageKind::classify(&datagram.payload) {
            Ok(MessageKind::NewGame) => {
                let ack = match StartPacket::decode(&datagram.payload) {
                    Ok(ack) => ack,
                    Err(err) => {
                        self.report_malformed(datagram.source, &err);
                        return Ok(());
                    },
                };
                if ack.sender.is_host() {
                    return Err(conflict(PlayerIndex::HOST, datagram.source));
                }
                match datagram.channel {
                    Some(slot) if slot != ack.sender => Err(conflict(ack.sender, datagram.source)),
                    Some(slot) => {
                        if let Some(flag) = acked.get_mut(slot.as_usize()) {
                            if !*flag {
                                debug!(player = %slot, "start acknowledged");
                            }
                            *flag = true;
                        }
                        Ok(())
                    },
                    None => {
                        report_violation_to!(
                            self.violation_observer,
                            ViolationSeverity::Warning,
                            ViolationKind::Handshake,
                            "ack for slot {} from unknown address {}",
                            ack.sender,
                            datagram.source
                        );
                        Ok(())
                    },
                }
            },
            Ok(MessageKind::Sync) => {
                // a peer already in lockstep got our start packet
                if let Some(slot) = datagram.channel {
                    if let Some(flag) = acked.get_mut(slot.as_usize()) {
                        *flag = true;
                    }
                    stashed.push(datagram);
                }
                Ok(())
            },
            Ok(MessageKind::Lobby) => Ok(()),
            Err(err) => {
                self.report_malformed(datagram.source, &err);
                Ok(())
            },
        }
    }

    fn client_handshake<S: DatagramSocket>(
        &self,
        transport: &mut TransportSession<S>,
        roster: &Roster,
    ) -> Result<MatchSetup, NetplayError> {
        if roster.is_host() {
            return Err(NetplayError::invalid(
                "run_client needs a roster whose local slot is not 0",
            ));
        }
        roster.validate()?;
        transport.bind_roster(roster);
        transport.refresh_requeued_channels();

        let started = Instant::now();
        let mut stashed = Vec::new();

        let start = 'wait: loop {
            self.check_deadline(started)?;
            if !transport.poll(self.slice(started))? {
                continue;
            }
            while let Some(datagram) = transport.receive()? {
                match MessageKind::classify(&datagram.payload) {
                    Ok(MessageKind::NewGame) => match StartPacket::decode(&datagram.payload) {
                        Ok(packet) if packet.sender.is_host() => {
                            if datagram.channel != Some(PlayerIndex::HOST) {
                                return Err(conflict(PlayerIndex::HOST, datagram.source));
                            }
                            break 'wait packet;
                        },
                        Ok(packet) => trace!(sender = %packet.sender, "ignoring peer ack"),
                        Err(err) => self.report_malformed(datagram.source, &err),
                    },
                    Ok(MessageKind::Sync) if datagram.channel.is_some() => {
                        stashed.push(datagram);
                    },
                    Ok(_) => {},
                    Err(err) => self.report_malformed(datagram.source, &err),
                }
            }
        };

        let reply = StartPacket {
            sender: roster.local(),
            ..start
        }
        .encode();
        transport.send(Channel::Peer(PlayerIndex::HOST), &reply)?;

        requeue_all(transport, stashed);
        Ok(MatchSetup {
            roster: *roster,
            params: start.params,
            seed: start.seed,
            start_reply: Some(reply),
        })
    }

    fn report_malformed(&self, source: SocketAddrV4, err: &dyn std::fmt::Display) {
        report_violation_to!(
            self.violation_observer,
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "dropping malformed packet from {}: {}",
            source,
            err
        );
    }
}

fn conflict(claimed: PlayerIndex, from: SocketAddrV4) -> NetplayError {
    NetplayError::HandshakeConflict { claimed, from }
}

/// Puts stashed datagrams back in their original order.
fn requeue_all<S: DatagramSocket>(transport: &mut TransportSession<S>, stashed: Vec<Datagram>) {
    for datagram in stashed.into_iter().rev() {
        transport.requeue(datagram);
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::memory_socket::{MemoryNetwork, MemorySocket};
    use crate::network::messages::{SyncPacket, NEW_GAME};
    use crate::sessions::event_sink::CollectingSink;
    use crate::telemetry::CollectingObserver;
    use crate::Frame;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicBool;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    const HOST: u16 = 1;
    const A: u16 = 2;
    const B: u16 = 3;

    fn fast() -> HandshakeConfig {
        HandshakeConfig {
            poll_slice: Duration::from_millis(5),
            resend_interval: Duration::from_millis(20),
            timeout: Some(Duration::from_secs(5)),
        }
    }

    fn params() -> GameParams {
        GameParams {
            wave: 4,
            turbo: true,
            rules: MatchRules::Lives(2),
        }
    }

    fn host_roster() -> Roster {
        Roster::new(PlayerIndex::HOST)
            .unwrap()
            .with_peer(PlayerIndex::new(1), addr(A))
            .unwrap()
            .with_peer(PlayerIndex::new(2), addr(B))
            .unwrap()
    }

    fn client_roster(local: usize) -> Roster {
        let mut roster = Roster::new(PlayerIndex::new(local)).unwrap();
        roster.set_peer(PlayerIndex::HOST, addr(HOST)).unwrap();
        for (index, port) in [(1, A), (2, B)] {
            if index != local {
                roster.set_peer(PlayerIndex::new(index), addr(port)).unwrap();
            }
        }
        roster
    }

    fn transport(network: &MemoryNetwork, port: u16) -> TransportSession<MemorySocket> {
        TransportSession::with_socket(network.bind(addr(port)))
    }

    fn start_from(sender: usize, seed: u32) -> Vec<u8> {
        StartPacket {
            sender: PlayerIndex::new(sender),
            params: params(),
            seed,
        }
        .encode()
    }

    #[test]
    fn host_and_two_clients_agree_on_seed_and_params() {
        let network = MemoryNetwork::new();
        let mut host_t = transport(&network, HOST);
        let mut a_t = transport(&network, A);
        let mut b_t = transport(&network, B);
        let sink = Arc::new(CollectingSink::new());

        let (host, a, b) = std::thread::scope(|s| {
            let a = s.spawn(|| GameStartCoordinator::new(fast()).run_client(&mut a_t, &client_roster(1)));
            let b = s.spawn(|| GameStartCoordinator::new(fast()).run_client(&mut b_t, &client_roster(2)));
            let host = GameStartCoordinator::new(fast())
                .with_event_sink(sink.clone())
                .run_host(&mut host_t, &host_roster(), params(), 0xC0FFEE);
            (host, a.join().unwrap(), b.join().unwrap())
        });

        let host = host.unwrap();
        let a = a.unwrap();
        let b = b.unwrap();
        for setup in [&host, &a, &b] {
            assert_eq!(setup.seed, 0xC0FFEE);
            assert_eq!(setup.params, params());
        }
        assert!(host.start_reply.is_none());
        assert_eq!(a.start_reply.as_deref(), Some(start_from(1, 0xC0FFEE).as_slice()));
        assert_eq!(
            sink.events(),
            vec![NetplayEvent::MatchStarted {
                seed: 0xC0FFEE,
                local: PlayerIndex::HOST,
                players: 3
            }]
        );
    }

    #[test]
    fn host_resends_after_lost_start_packet() {
        let network = MemoryNetwork::new();
        network.drop_next(addr(HOST), addr(A), 1);
        let mut host_t = transport(&network, HOST);
        let mut a_t = transport(&network, A);
        let roster = Roster::new(PlayerIndex::HOST)
            .unwrap()
            .with_peer(PlayerIndex::new(1), addr(A))
            .unwrap();
        let client = Roster::new(PlayerIndex::new(1))
            .unwrap()
            .with_peer(PlayerIndex::HOST, addr(HOST))
            .unwrap();

        let (host, a) = std::thread::scope(|s| {
            let a = s.spawn(|| GameStartCoordinator::new(fast()).run_client(&mut a_t, &client));
            let host = GameStartCoordinator::new(fast()).run_host(&mut host_t, &roster, params(), 7);
            (host, a.join().unwrap())
        });
        assert_eq!(host.unwrap().seed, 7);
        assert_eq!(a.unwrap().seed, 7);
        assert!(network.count_sent(addr(HOST), addr(A), NEW_GAME) >= 2);
    }

    #[test]
    fn second_host_claim_is_a_conflict() {
        let network = MemoryNetwork::new();
        let mut host_t = transport(&network, HOST);
        let _a = transport(&network, A);
        network.inject(addr(A), addr(HOST), &start_from(0, 99));
        let sink = Arc::new(CollectingSink::new());
        let observer = Arc::new(CollectingObserver::new());

        let err = GameStartCoordinator::new(fast())
            .with_event_sink(sink.clone())
            .with_violation_observer(observer.clone())
            .run_host(&mut host_t, &host_roster(), params(), 1)
            .unwrap_err();
        assert_eq!(
            err,
            NetplayError::HandshakeConflict {
                claimed: PlayerIndex::HOST,
                from: addr(A)
            }
        );
        crate::assert_violation!(observer, ViolationKind::Handshake);
        assert!(matches!(
            sink.events().as_slice(),
            [NetplayEvent::MatchAborted { frame: None, .. }]
        ));
    }

    #[test]
    fn ack_for_the_wrong_slot_is_a_conflict() {
        let network = MemoryNetwork::new();
        let mut host_t = transport(&network, HOST);
        network.inject(addr(A), addr(HOST), &start_from(2, 1));
        let err = GameStartCoordinator::new(fast())
            .run_host(&mut host_t, &host_roster(), params(), 1)
            .unwrap_err();
        assert_eq!(
            err,
            NetplayError::HandshakeConflict {
                claimed: PlayerIndex::new(2),
                from: addr(A)
            }
        );
    }

    #[test]
    fn sync_packet_counts_as_ack_and_is_requeued() {
        let network = MemoryNetwork::new();
        let mut host_t = transport(&network, HOST);
        let early = SyncPacket {
            frame: Frame::ZERO,
            seed: 1,
            records: Default::default(),
        }
        .encode();
        network.inject(addr(A), addr(HOST), &early);
        network.inject(addr(B), addr(HOST), &start_from(2, 1));

        GameStartCoordinator::new(fast())
            .run_host(&mut host_t, &host_roster(), params(), 1)
            .unwrap();
        let datagram = host_t.receive().unwrap().unwrap();
        assert_eq!(datagram.payload, early);
        assert_eq!(datagram.channel, Some(PlayerIndex::new(1)));
    }

    #[test]
    fn duplicate_acks_are_harmless() {
        let network = MemoryNetwork::new();
        let mut host_t = transport(&network, HOST);
        for _ in 0..3 {
            network.inject(addr(A), addr(HOST), &start_from(1, 1));
        }
        network.inject(addr(B), addr(HOST), &start_from(2, 1));
        assert!(GameStartCoordinator::new(fast())
            .run_host(&mut host_t, &host_roster(), params(), 1)
            .is_ok());
    }

    #[test]
    fn client_rejects_host_claim_from_stranger() {
        let network = MemoryNetwork::new();
        let mut a_t = transport(&network, A);
        network.inject(addr(B), addr(A), &start_from(0, 5));
        let err = GameStartCoordinator::new(fast())
            .run_client(&mut a_t, &client_roster(1))
            .unwrap_err();
        assert_eq!(
            err,
            NetplayError::HandshakeConflict {
                claimed: PlayerIndex::HOST,
                from: addr(B)
            }
        );
    }

    #[test]
    fn client_stashes_sync_and_acks_host() {
        let network = MemoryNetwork::new();
        let mut a_t = transport(&network, A);
        let mut host_t = transport(&network, HOST);
        let stray = SyncPacket {
            frame: Frame::ZERO,
            seed: 5,
            records: Default::default(),
        }
        .encode();
        network.inject(addr(B), addr(A), &stray);
        network.inject(addr(HOST), addr(A), &start_from(0, 5));

        let setup = GameStartCoordinator::new(fast())
            .run_client(&mut a_t, &client_roster(1))
            .unwrap();
        assert_eq!(setup.seed, 5);
        assert_eq!(a_t.receive().unwrap().unwrap().payload, stray);

        let ack = host_t.receive().unwrap().unwrap();
        let decoded = StartPacket::decode(&ack.payload).unwrap();
        assert_eq!(decoded.sender, PlayerIndex::new(1));
        assert_eq!(decoded.seed, 5);
    }

    #[test]
    fn handshake_times_out_when_configured() {
        let network = MemoryNetwork::new();
        let mut host_t = transport(&network, HOST);
        let config = HandshakeConfig {
            timeout: Some(Duration::from_millis(30)),
            ..fast()
        };
        let err = GameStartCoordinator::new(config)
            .run_host(&mut host_t, &host_roster(), params(), 1)
            .unwrap_err();
        assert!(matches!(err, NetplayError::HandshakeTimeout { .. }));
    }

    #[test]
    fn abort_signal_cancels() {
        let network = MemoryNetwork::new();
        let mut a_t = transport(&network, A);
        let err = GameStartCoordinator::new(fast())
            .with_abort_signal(Arc::new(AtomicBool::new(true)))
            .run_client(&mut a_t, &client_roster(1))
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn wrong_roster_side_is_invalid() {
        let network = MemoryNetwork::new();
        let mut host_t = transport(&network, HOST);
        let coordinator = GameStartCoordinator::new(fast());
        assert!(matches!(
            coordinator.run_client(&mut host_t, &host_roster()),
            Err(NetplayError::InvalidRequest { .. })
        ));
        assert!(matches!(
            coordinator.run_host(&mut host_t, &client_roster(1), params(), 1),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn params_reject_top_bit() {
        let params = GameParams {
            rules: MatchRules::Lives(0x8000_0000),
            ..GameParams::default()
        };
        assert!(params.validate().is_err());
        assert!(GameParams::default().validate().is_ok());
    }
}
