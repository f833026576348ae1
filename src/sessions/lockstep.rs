//! The per-frame lockstep barrier.
//!
//! Every call to [`LockstepSession::advance_frame`] sends the local input for the current
//! frame to every peer and blocks until every peer's input for that same frame has
//! arrived. Loss is repaired by resending on each empty wait slice; a peer one frame
//! behind is sent our previous frame again, and a peer one frame ahead has its payload
//! cached for the next barrier.
//!
//! # Example
//!
//! ```no_run
//! use fortress_lockstep::{
//!     GameParams, MatchBuilder, PlayerIndex, Roster, TransportSession, KEY_PRESS,
//! };
//! use std::net::{Ipv4Addr, SocketAddrV4};
//!
//! # fn main() -> Result<(), fortress_lockstep::NetplayError> {
//! let mut transport = TransportSession::open_hosting()?;
//! let peer = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 50_000);
//! let roster = Roster::new(PlayerIndex::HOST)?.with_peer(PlayerIndex::new(1), peer)?;
//!
//! let mut session = MatchBuilder::new().host_match(&mut transport, roster, GameParams::default())?;
//! loop {
//!     session.queue_input(KEY_PRESS, b' ');
//!     session.advance_frame()?;
//!     let players: Vec<_> = session.roster().present_players().collect();
//!     for player in players {
//!         let input = session.take_sync_buf(player);
//!         // apply `input` to the simulation for `player`
//! #       let _ = input;
//!     }
//! }
//! # }
//! ```

use std::sync::Arc;

use tracing::{debug, trace};

use crate::frame_buffer::{InputRecord, OutboundFrameBuffer};
use crate::network::messages::{MessageKind, SyncPacket};
use crate::network::transport::{Channel, Datagram, TransportSession};
use crate::network::udp_socket::UdpDatagramSocket;
use crate::rng::SyncRng;
use crate::sessions::config::LockstepConfig;
use crate::sessions::game_start::{GameParams, MatchSetup};
use crate::sessions::roster::Roster;
use crate::telemetry::{
    report_to_observer, ProtocolViolation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::{
    report_violation_to, AbortSignal, DatagramSocket, EventSink, Frame, NetplayError,
    NetplayEvent, PlayerIndex, MAX_PLAYERS,
};

type InboundGeneration = [Option<SyncPacket>; MAX_PLAYERS];

/// Counters describing how a match has gone so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
pub struct LockstepStats {
    /// Barriers passed.
    pub frames_completed: u64,
    /// Sync packets sent again: timeouts, peers behind and peers ahead.
    pub resends: u64,
    /// Payloads for the next frame cached while waiting.
    pub early_cached: u64,
    /// Sync packets for a frame we could not use.
    pub stale_discarded: u64,
    /// Payloads we already had.
    pub duplicates_discarded: u64,
    /// Packets that failed to decode or came from an unknown address.
    pub malformed_discarded: u64,
    /// Times the local generator was re-seeded to the host's state.
    pub seed_corrections: u64,
    /// Input records dropped because the frame's budget was full.
    pub inputs_dropped: u64,
}

/// One match's lockstep state. Borrows the transport for the duration of the match.
pub struct LockstepSession<'t, S: DatagramSocket = UdpDatagramSocket> {
    transport: &'t mut TransportSession<S>,
    roster: Roster,
    params: GameParams,
    config: LockstepConfig,
    frame: Frame,
    rng: SyncRng,
    outbound: [OutboundFrameBuffer; 2],
    out_gen: usize,
    inbound: [InboundGeneration; 2],
    in_gen: usize,
    delivered: [Vec<InputRecord>; MAX_PLAYERS],
    start_reply: Option<Vec<u8>>,
    abort: Arc<dyn AbortSignal>,
    events: Arc<dyn EventSink>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    stats: LockstepStats,
    overflow_reported: bool,
}

impl<S: DatagramSocket> std::fmt::Debug for LockstepSession<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            transport: _,
            roster,
            params,
            config,
            frame,
            rng,
            outbound: _,
            out_gen,
            inbound: _,
            in_gen,
            delivered: _,
            start_reply,
            abort: _,
            events: _,
            violation_observer,
            stats,
            overflow_reported: _,
        } = self;

        f.debug_struct("LockstepSession")
            .field("roster", roster)
            .field("params", params)
            .field("config", config)
            .field("frame", frame)
            .field("seed", &rng.seed())
            .field("out_gen", out_gen)
            .field("in_gen", in_gen)
            .field("has_start_reply", &start_reply.is_some())
            .field("has_violation_observer", &violation_observer.is_some())
            .field("stats", stats)
            .finish_non_exhaustive()
    }
}

impl<'t, S: DatagramSocket> LockstepSession<'t, S> {
    pub(crate) fn new(
        transport: &'t mut TransportSession<S>,
        setup: MatchSetup,
        config: LockstepConfig,
        abort: Arc<dyn AbortSignal>,
        events: Arc<dyn EventSink>,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        transport.bind_roster(&setup.roster);
        transport.refresh_requeued_channels();
        Self {
            transport,
            roster: setup.roster,
            params: setup.params,
            config,
            frame: Frame::ZERO,
            rng: SyncRng::new(setup.seed),
            outbound: [
                OutboundFrameBuffer::new(config.input_budget),
                OutboundFrameBuffer::new(config.input_budget),
            ],
            out_gen: 0,
            inbound: Default::default(),
            in_gen: 0,
            delivered: Default::default(),
            start_reply: setup.start_reply,
            abort,
            events,
            violation_observer,
            stats: LockstepStats::default(),
            overflow_reported: false,
        }
    }

    /// The frame the next [`advance_frame`](Self::advance_frame) will synchronize.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// The participants of this match.
    #[must_use]
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// The parameters agreed in the handshake.
    #[must_use]
    pub fn params(&self) -> GameParams {
        self.params
    }

    /// Our slot.
    #[must_use]
    pub fn local_player(&self) -> PlayerIndex {
        self.roster.local()
    }

    /// The shared generator's current state.
    #[must_use]
    pub fn seed(&self) -> u32 {
        self.rng.seed()
    }

    /// The shared generator. Draw from it only in simulation code that every peer runs
    /// identically, or the seeds diverge.
    pub fn rng_mut(&mut self) -> &mut SyncRng {
        &mut self.rng
    }

    /// Counters for this match.
    #[must_use]
    pub fn stats(&self) -> LockstepStats {
        self.stats
    }

    /// The transport the match runs on.
    pub fn transport_mut(&mut self) -> &mut TransportSession<S> {
        self.transport
    }

    /// Records local input for the current frame.
    ///
    /// Returns `false` if the frame's byte budget is full; the record is dropped and the
    /// first drop per frame is reported as an [`ViolationKind::InputOverflow`].
    pub fn queue_input(&mut self, op: u8, keycode: u8) -> bool {
        if self.outbound[self.out_gen].push(InputRecord::new(op, keycode)) {
            return true;
        }
        self.stats.inputs_dropped += 1;
        if !self.overflow_reported {
            self.overflow_reported = true;
            let budget = self.config.input_budget;
            report_violation_to!(
                self.violation_observer,
                frame = self.frame,
                ViolationSeverity::Warning,
                ViolationKind::InputOverflow,
                "input budget of {} bytes full, dropping input",
                budget
            );
        }
        false
    }

    /// Returns and clears the input `player` sent for the last completed frame.
    ///
    /// Empty if the player sent nothing, is not present, or was already taken.
    pub fn take_sync_buf(&mut self, player: PlayerIndex) -> Vec<InputRecord> {
        self.delivered
            .get_mut(player.as_usize())
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Synchronizes the current frame with every peer, then advances to the next one.
    ///
    /// # Errors
    /// - [`NetplayError::FrameTimeout`] when the retry budget runs out.
    /// - [`NetplayError::Cancelled`] when the abort signal fires.
    /// - [`NetplayError::SocketError`] on a transport failure.
    ///
    /// Each ends the match; a `MatchAborted` event is emitted first.
    pub fn advance_frame(&mut self) -> Result<(), NetplayError> {
        match self.synchronize() {
            Ok(()) => Ok(()),
            Err(err) => {
                if let NetplayError::FrameTimeout { missing, .. } = &err {
                    report_violation_to!(
                        self.violation_observer,
                        frame = self.frame,
                        ViolationSeverity::Error,
                        ViolationKind::FrameSync,
                        "frame abandoned, no payload from {:?}",
                        missing
                    );
                }
                self.events.on_event(&NetplayEvent::MatchAborted {
                    frame: Some(self.frame),
                    reason: err.to_string(),
                });
                Err(err)
            },
        }
    }

    fn synchronize(&mut self) -> Result<(), NetplayError> {
        // payloads cached early become this frame's starting point
        self.in_gen ^= 1;
        self.inbound[self.in_gen ^ 1] = Default::default();

        let current = self.out_gen;
        self.outbound[current].stamp(self.frame, self.rng.seed());

        let mut received = [true; MAX_PLAYERS];
        for (index, _) in self.roster.peers() {
            received[index.as_usize()] = false;
        }
        for index in self.missing(&received) {
            self.transport
                .send(Channel::Peer(index), self.outbound[current].as_bytes())?;
        }

        for index in self.missing(&received) {
            if let Some(seed) = self.inbound[self.in_gen][index.as_usize()]
                .as_ref()
                .map(|packet| packet.seed)
            {
                trace!(frame = %self.frame, player = %index, "using cached payload");
                received[index.as_usize()] = true;
                self.check_seed(index, seed);
            }
        }

        let mut retries = 0;
        while received.iter().any(|done| !done) {
            if self.abort.abort_requested() {
                return Err(NetplayError::Cancelled);
            }
            if !self.transport.poll(self.config.wait_slice)? {
                retries += 1;
                let missing = self.missing(&received);
                if retries > self.config.retry_budget {
                    return Err(NetplayError::FrameTimeout {
                        frame: self.frame,
                        missing,
                    });
                }
                debug!(frame = %self.frame, ?missing, retries, "resending frame");
                for index in missing {
                    self.transport
                        .send(Channel::Peer(index), self.outbound[current].as_bytes())?;
                    self.stats.resends += 1;
                }
                continue;
            }
            while let Some(datagram) = self.transport.receive()? {
                self.on_datagram(datagram, &mut received)?;
            }
        }

        self.complete_frame();
        Ok(())
    }

    fn missing(&self, received: &[bool; MAX_PLAYERS]) -> Vec<PlayerIndex> {
        PlayerIndex::all()
            .filter(|index| !received[index.as_usize()])
            .collect()
    }

    fn on_datagram(
        &mut self,
        datagram: Datagram,
        received: &mut [bool; MAX_PLAYERS],
    ) -> Result<(), NetplayError> {
        match MessageKind::classify(&datagram.payload) {
            Ok(MessageKind::Sync) => {},
            Ok(MessageKind::Lobby) => return Ok(()),
            Ok(MessageKind::NewGame) => {
                // the host missed our ack and is still resending
                if datagram.channel == Some(PlayerIndex::HOST) {
                    if let Some(reply) = &self.start_reply {
                        trace!("re-acking late start packet");
                        self.transport.send(Channel::Peer(PlayerIndex::HOST), reply)?;
                    }
                }
                return Ok(());
            },
            Err(err) => {
                self.discard_malformed(&datagram, &err);
                return Ok(());
            },
        }

        let Some(sender) = datagram.channel else {
            self.discard_malformed(&datagram, &"source is not a match participant");
            return Ok(());
        };
        let packet = match SyncPacket::decode(&datagram.payload) {
            Ok(packet) => packet,
            Err(err) => {
                self.discard_malformed(&datagram, &err);
                return Ok(());
            },
        };

        let slot = sender.as_usize();
        if packet.frame == self.frame {
            if received[slot] {
                self.stats.duplicates_discarded += 1;
                return Ok(());
            }
            self.check_seed(sender, packet.seed);
            self.inbound[self.in_gen][slot] = Some(packet);
            received[slot] = true;
        } else if Some(packet.frame) == self.frame.prev() {
            // peer is behind and missed our previous frame
            let previous = self.out_gen ^ 1;
            self.transport
                .send(Channel::Peer(sender), self.outbound[previous].as_bytes())?;
            self.stats.resends += 1;
        } else if packet.frame == self.frame.next() {
            self.transport
                .send(Channel::Peer(sender), self.outbound[self.out_gen].as_bytes())?;
            self.stats.resends += 1;
            let next = &mut self.inbound[self.in_gen ^ 1][slot];
            if next.is_none() {
                *next = Some(packet);
                self.stats.early_cached += 1;
            } else {
                self.stats.duplicates_discarded += 1;
            }
        } else {
            trace!(frame = %packet.frame, expected = %self.frame, player = %sender, "stale sync");
            self.stats.stale_discarded += 1;
        }
        Ok(())
    }

    /// Compares a peer's seed with ours. Only the host's seed is authoritative.
    fn check_seed(&mut self, sender: PlayerIndex, seed: u32) {
        let local = self.rng.seed();
        if seed == local {
            return;
        }
        let message = if self.roster.is_host() {
            "peer disagrees with the host seed"
        } else if sender.is_host() {
            "re-seeding to the host seed"
        } else {
            return;
        };
        let violation = ProtocolViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::SeedMismatch,
            message,
            concat!(file!(), ":", line!()),
        )
        .with_frame(self.frame)
        .with_context("player", sender.to_string())
        .with_context("peer_seed", format!("{seed:#010x}"))
        .with_context("local_seed", format!("{local:#010x}"));
        report_to_observer(self.violation_observer.as_ref(), &violation);

        if sender.is_host() {
            self.rng.reseed(seed);
            self.stats.seed_corrections += 1;
        }
    }

    fn discard_malformed(&mut self, datagram: &Datagram, reason: &dyn std::fmt::Display) {
        self.stats.malformed_discarded += 1;
        report_violation_to!(
            self.violation_observer,
            frame = self.frame,
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "dropping packet from {}: {}",
            datagram.source,
            reason
        );
    }

    fn complete_frame(&mut self) {
        let local = self.roster.local().as_usize();
        for (slot, delivered) in self.delivered.iter_mut().enumerate() {
            *delivered = if slot == local {
                self.outbound[self.out_gen].records().to_vec()
            } else {
                self.inbound[self.in_gen][slot]
                    .take()
                    .map(|packet| packet.records.to_vec())
                    .unwrap_or_default()
            };
        }

        trace!(frame = %self.frame, seed = self.rng.seed(), "frame complete");
        self.frame = self.frame.next();
        self.out_gen ^= 1;
        self.outbound[self.out_gen].reset();
        self.overflow_reported = false;
        self.stats.frames_completed += 1;
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
    use crate::network::messages::{StartPacket, NEW_GAME, SYNC_HEADER_LEN};
    use crate::sessions::event_sink::CollectingSink;
    use crate::telemetry::CollectingObserver;
    use crate::{NeverAbort, KEY_PRESS, KEY_RELEASE};
    use smallvec::smallvec;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::AtomicBool;
    use web_time::Duration;

    const HOST: u16 = 1;
    const A: u16 = 2;
    const B: u16 = 3;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn fast() -> LockstepConfig {
        LockstepConfig {
            wait_slice: Duration::from_millis(5),
            retry_budget: 400,
            ..LockstepConfig::default()
        }
    }

    fn roster(local: usize, ports: &[(usize, u16)]) -> Roster {
        let mut roster = Roster::new(PlayerIndex::new(local)).unwrap();
        for &(index, port) in ports {
            if index != local {
                roster.set_peer(PlayerIndex::new(index), addr(port)).unwrap();
            }
        }
        roster
    }

    fn transport(network: &MemoryNetwork, port: u16) -> TransportSession<MemorySocket> {
        TransportSession::with_socket(network.bind(addr(port)))
    }

    struct Harness {
        events: Arc<CollectingSink>,
        observer: Arc<CollectingObserver>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                events: Arc::new(CollectingSink::new()),
                observer: Arc::new(CollectingObserver::new()),
            }
        }

        fn session<'t>(
            &self,
            transport: &'t mut TransportSession<MemorySocket>,
            setup: MatchSetup,
            config: LockstepConfig,
        ) -> LockstepSession<'t, MemorySocket> {
            LockstepSession::new(
                transport,
                setup,
                config,
                Arc::new(NeverAbort),
                self.events.clone(),
                Some(self.observer.clone()),
            )
        }
    }

    fn sync(frame: u32, seed: u32, records: &[(u8, u8)]) -> Vec<u8> {
        SyncPacket {
            frame: Frame::new(frame),
            seed,
            records: records
                .iter()
                .map(|&(op, key)| InputRecord::new(op, key))
                .collect(),
        }
        .encode()
    }

    fn two_player_host<'t>(
        harness: &Harness,
        t: &'t mut TransportSession<MemorySocket>,
        seed: u32,
    ) -> LockstepSession<'t, MemorySocket> {
        let setup = MatchSetup::new(roster(0, &[(1, A)]), GameParams::default(), seed);
        harness.session(t, setup, fast())
    }

    #[test]
    fn three_peers_exchange_input_every_frame() {
        let network = MemoryNetwork::new();
        let ports = [(0, HOST), (1, A), (2, B)];
        let mut transports: Vec<_> = ports.iter().map(|&(_, p)| transport(&network, p)).collect();

        let outcomes: Vec<Vec<Vec<Vec<InputRecord>>>> = std::thread::scope(|s| {
            let handles: Vec<_> = transports
                .iter_mut()
                .enumerate()
                .map(|(local, t)| {
                    s.spawn(move || {
                        let harness = Harness::new();
                        let setup = MatchSetup::new(roster(local, &ports), GameParams::default(), 42);
                        let mut session = harness.session(t, setup, fast());
                        let mut frames = Vec::new();
                        for frame in 0..10u8 {
                            session.queue_input(KEY_PRESS, frame * 10 + local as u8);
                            session.advance_frame().unwrap();
                            frames.push(
                                PlayerIndex::all()
                                    .map(|p| session.take_sync_buf(p))
                                    .collect::<Vec<_>>(),
                            );
                        }
                        assert_eq!(session.frame(), Frame::new(10));
                        assert_eq!(session.seed(), 42);
                        crate::assert_no_violations!(harness.observer);
                        frames
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // every peer saw identical input for every frame
        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(outcomes[1], outcomes[2]);
        for (frame, players) in outcomes[0].iter().enumerate() {
            for (player, input) in players.iter().enumerate() {
                assert_eq!(
                    input,
                    &vec![InputRecord::new(KEY_PRESS, frame as u8 * 10 + player as u8)]
                );
            }
        }
    }

    #[test]
    fn lost_datagram_is_repaired_by_the_peer_behind() {
        let network = MemoryNetwork::new();
        let ports = [(0, HOST), (1, A), (2, B)];
        network.drop_next(addr(HOST), addr(B), 1);
        let mut transports: Vec<_> = ports.iter().map(|&(_, p)| transport(&network, p)).collect();

        let stats: Vec<LockstepStats> = std::thread::scope(|s| {
            let handles: Vec<_> = transports
                .iter_mut()
                .enumerate()
                .map(|(local, t)| {
                    s.spawn(move || {
                        let harness = Harness::new();
                        let setup = MatchSetup::new(roster(local, &ports), GameParams::default(), 9);
                        let mut session = harness.session(t, setup, fast());
                        for _ in 0..3 {
                            session.advance_frame().unwrap();
                        }
                        assert_eq!(session.frame(), Frame::new(3));
                        session.stats()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // B could only finish frame 0 after the host sent it again
        assert!(stats[0].resends >= 1);
        assert!(network.count_sent(addr(HOST), addr(B), 0x00) >= 4);
        assert!(stats.iter().all(|s| s.frames_completed == 3));
    }

    #[test]
    fn silent_peer_exhausts_retry_budget() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, HOST);
        let harness = Harness::new();
        let setup = MatchSetup::new(roster(0, &[(1, A), (2, B)]), GameParams::default(), 1);
        let config = LockstepConfig {
            retry_budget: 3,
            ..fast()
        };
        network.inject(addr(A), addr(HOST), &sync(0, 1, &[]));
        let mut session = harness.session(&mut t, setup, config);

        let err = session.advance_frame().unwrap_err();
        assert_eq!(
            err,
            NetplayError::FrameTimeout {
                frame: Frame::ZERO,
                missing: vec![PlayerIndex::new(2)],
            }
        );
        assert_eq!(session.frame(), Frame::ZERO);
        // one resend per tolerated empty slice, then the next empty slice fails
        assert_eq!(session.stats().resends, 3);
        crate::assert_violation!(harness.observer, ViolationKind::FrameSync);
        assert!(matches!(
            harness.events.events().as_slice(),
            [NetplayEvent::MatchAborted { frame: Some(Frame::ZERO), .. }]
        ));
    }

    #[test]
    fn retry_budget_of_one_allows_one_resend() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, HOST);
        let harness = Harness::new();
        let config = LockstepConfig {
            retry_budget: 1,
            ..fast()
        };
        let setup = MatchSetup::new(roster(0, &[(1, A)]), GameParams::default(), 1);
        let mut session = harness.session(&mut t, setup, config);

        assert!(session.advance_frame().is_err());
        assert_eq!(session.stats().resends, 1);
        // the first send plus the single resend
        assert_eq!(network.count_sent(addr(HOST), addr(A), 0x00), 2);
    }

    #[test]
    fn lost_sync_to_host_is_recovered_after_one_slice() {
        let network = MemoryNetwork::new();
        let ports = [(0, HOST), (1, A), (2, B)];
        // B's frame-0 payload never reaches the host
        network.drop_next(addr(B), addr(HOST), 1);
        let mut transports: Vec<_> = ports.iter().map(|&(_, p)| transport(&network, p)).collect();

        let stats: Vec<LockstepStats> = std::thread::scope(|s| {
            let handles: Vec<_> = transports
                .iter_mut()
                .enumerate()
                .map(|(local, t)| {
                    s.spawn(move || {
                        let harness = Harness::new();
                        let setup = MatchSetup::new(roster(local, &ports), GameParams::default(), 5);
                        let mut session = harness.session(t, setup, fast());
                        session.advance_frame().unwrap();
                        assert_eq!(session.frame(), Frame::new(1));
                        if local == 0 {
                            assert!(session.stats().resends >= 1);
                        }
                        // keep running so nobody is left waiting on a finished peer
                        session.advance_frame().unwrap();
                        session.advance_frame().unwrap();
                        session.stats()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(stats[0].resends >= 1);
        assert!(stats.iter().all(|s| s.frames_completed == 3));
    }

    #[test]
    fn early_payload_is_cached_and_consumed_next_frame() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, HOST);
        let mut peer = network.bind(addr(A));
        let harness = Harness::new();
        network.inject(addr(A), addr(HOST), &sync(0, 3, &[(KEY_PRESS, 1)]));
        network.inject(addr(A), addr(HOST), &sync(1, 3, &[(KEY_RELEASE, 1)]));
        let mut session = two_player_host(&harness, &mut t, 3);

        session.advance_frame().unwrap();
        assert_eq!(session.stats().early_cached, 1);
        assert_eq!(
            session.take_sync_buf(PlayerIndex::new(1)),
            vec![InputRecord::new(KEY_PRESS, 1)]
        );

        // nothing else arrives, the cache alone completes frame 1
        session.advance_frame().unwrap();
        assert_eq!(session.frame(), Frame::new(2));
        assert_eq!(
            session.take_sync_buf(PlayerIndex::new(1)),
            vec![InputRecord::new(KEY_RELEASE, 1)]
        );

        // the peer ahead got our frame 0 again in reply
        let mut frame_zero = 0;
        while let Some((_, payload)) = crate::DatagramSocket::recv_from(&mut peer).unwrap() {
            if SyncPacket::decode(&payload).unwrap().frame == Frame::ZERO {
                frame_zero += 1;
            }
        }
        assert_eq!(frame_zero, 2);
    }

    #[test]
    fn duplicate_payload_is_discarded() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, HOST);
        let harness = Harness::new();
        let mut session = two_player_host(&harness, &mut t, 3);
        let packet = sync(0, 3, &[(KEY_PRESS, 5)]);
        network.inject(addr(A), addr(HOST), &packet);
        network.inject(addr(A), addr(HOST), &packet);

        session.advance_frame().unwrap();
        let stats = session.stats();
        // the second copy is either a duplicate at frame 0 or stale at frame 1
        assert_eq!(stats.duplicates_discarded + stats.stale_discarded, 1);
        assert_eq!(session.take_sync_buf(PlayerIndex::new(1)).len(), 1);
    }

    #[test]
    fn peer_behind_gets_previous_frame_again() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, HOST);
        let _peer = network.bind(addr(A));
        let harness = Harness::new();
        let mut session = two_player_host(&harness, &mut t, 3);
        session.queue_input(KEY_PRESS, 7);
        network.inject(addr(A), addr(HOST), &sync(0, 3, &[]));
        session.advance_frame().unwrap();

        network.inject(addr(A), addr(HOST), &sync(0, 3, &[]));
        network.inject(addr(A), addr(HOST), &sync(1, 3, &[]));
        session.advance_frame().unwrap();

        let resent: Vec<_> = network
            .sent_log()
            .into_iter()
            .filter(|(from, to, _)| *from == addr(HOST) && *to == addr(A))
            .map(|(_, _, payload)| SyncPacket::decode(&payload).unwrap())
            .filter(|packet| packet.frame == Frame::ZERO)
            .collect();
        assert_eq!(resent.len(), 2);
        assert_eq!(
            resent[1].records.as_slice(),
            &[InputRecord::new(KEY_PRESS, 7)]
        );
    }

    #[test]
    fn client_adopts_host_seed() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, A);
        let harness = Harness::new();
        let setup = MatchSetup::new(roster(1, &[(0, HOST)]), GameParams::default(), 5);
        let mut session = harness.session(&mut t, setup, fast());
        network.inject(addr(HOST), addr(A), &sync(0, 99, &[]));

        session.advance_frame().unwrap();
        assert_eq!(session.seed(), 99);
        assert_eq!(session.stats().seed_corrections, 1);
        crate::assert_violation!(harness.observer, ViolationKind::SeedMismatch);
        let mismatch = &harness
            .observer
            .violations_of_kind(ViolationKind::SeedMismatch)[0];
        assert_eq!(mismatch.frame, Some(Frame::new(0)));
        assert_eq!(mismatch.context.get("peer_seed").map(String::as_str), Some("0x00000063"));
        assert_eq!(mismatch.context.get("player").map(String::as_str), Some("0"));
    }

    #[test]
    fn host_reports_but_keeps_its_seed() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, HOST);
        let harness = Harness::new();
        let mut session = two_player_host(&harness, &mut t, 5);
        network.inject(addr(A), addr(HOST), &sync(0, 77, &[]));

        session.advance_frame().unwrap();
        assert_eq!(session.seed(), 5);
        assert_eq!(session.stats().seed_corrections, 0);
        crate::assert_violation!(harness.observer, ViolationKind::SeedMismatch);
    }

    #[test]
    fn input_past_budget_is_dropped() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, HOST);
        let harness = Harness::new();
        let setup = MatchSetup::new(roster(0, &[(1, A)]), GameParams::default(), 1);
        let config = LockstepConfig {
            input_budget: SYNC_HEADER_LEN + 2,
            ..fast()
        };
        let mut session = harness.session(&mut t, setup, config);
        assert!(session.queue_input(KEY_PRESS, 1));
        assert!(!session.queue_input(KEY_PRESS, 2));
        assert!(!session.queue_input(KEY_PRESS, 3));
        assert_eq!(session.stats().inputs_dropped, 2);
        let overflows = harness
            .observer
            .violations_of_kind(ViolationKind::InputOverflow);
        assert_eq!(overflows.len(), 1);
        assert_eq!(overflows[0].frame, Some(session.frame()));

        network.inject(addr(A), addr(HOST), &sync(0, 1, &[]));
        session.advance_frame().unwrap();
        assert_eq!(
            session.take_sync_buf(PlayerIndex::HOST),
            vec![InputRecord::new(KEY_PRESS, 1)]
        );
        assert!(session.take_sync_buf(PlayerIndex::HOST).is_empty());
    }

    #[test]
    fn late_start_packet_is_reacked() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, A);
        let _host = network.bind(addr(HOST));
        let harness = Harness::new();
        let start = StartPacket {
            sender: PlayerIndex::HOST,
            params: GameParams::default(),
            seed: 4,
        };
        let reply = StartPacket {
            sender: PlayerIndex::new(1),
            ..start
        }
        .encode();
        let mut setup = MatchSetup::new(roster(1, &[(0, HOST)]), GameParams::default(), 4);
        setup.start_reply = Some(reply.clone());
        let mut session = harness.session(&mut t, setup, fast());

        network.inject(addr(HOST), addr(A), &start.encode());
        network.inject(addr(HOST), addr(A), &sync(0, 4, &[]));
        session.advance_frame().unwrap();

        let acks: Vec<_> = network
            .sent_log()
            .into_iter()
            .filter(|(from, to, p)| *from == addr(A) && *to == addr(HOST) && p[0] == NEW_GAME)
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].2, reply);
    }

    #[test]
    fn malformed_and_foreign_packets_do_not_abort() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, HOST);
        let harness = Harness::new();
        let mut session = two_player_host(&harness, &mut t, 3);
        network.inject(addr(A), addr(HOST), &[0x00, 1, 2]);
        network.inject(addr(B), addr(HOST), &sync(0, 3, &[]));
        network.inject(addr(A), addr(HOST), &[0xFF, 4]);
        network.inject(addr(A), addr(HOST), &sync(0, 3, &[]));

        session.advance_frame().unwrap();
        assert_eq!(session.stats().malformed_discarded, 2);
        crate::assert_violation!(harness.observer, ViolationKind::NetworkProtocol);
    }

    #[test]
    fn abort_signal_cancels_the_barrier() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, HOST);
        let harness = Harness::new();
        let setup = MatchSetup::new(roster(0, &[(1, A)]), GameParams::default(), 1);
        let mut session = LockstepSession::new(
            &mut t,
            setup,
            fast(),
            Arc::new(AtomicBool::new(true)),
            harness.events.clone(),
            None,
        );
        assert_eq!(session.advance_frame(), Err(NetplayError::Cancelled));
    }

    #[test]
    fn stray_sync_requeued_by_handshake_is_used() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, HOST);
        t.requeue(Datagram {
            source: addr(A),
            channel: None,
            payload: SyncPacket {
                frame: Frame::ZERO,
                seed: 3,
                records: smallvec![InputRecord::new(KEY_PRESS, 9)],
            }
            .encode(),
        });
        let harness = Harness::new();
        let mut session = two_player_host(&harness, &mut t, 3);
        session.advance_frame().unwrap();
        assert_eq!(
            session.take_sync_buf(PlayerIndex::new(1)),
            vec![InputRecord::new(KEY_PRESS, 9)]
        );
    }
}
