//! [`MatchBuilder`]: configures a match, then runs the handshake and hands back a
//! [`LockstepSession`](crate::LockstepSession).

use std::sync::Arc;

use tracing::debug;

use crate::network::transport::TransportSession;
use crate::rng::{Pcg32, SeedableRng};
use crate::sessions::config::{HandshakeConfig, LockstepConfig};
use crate::sessions::event_sink::TracingSink;
use crate::sessions::game_start::{GameParams, GameStartCoordinator, MatchSetup};
use crate::sessions::lockstep::LockstepSession;
use crate::sessions::roster::Roster;
use crate::telemetry::ViolationObserver;
use crate::{AbortSignal, DatagramSocket, EventSink, NetplayError, NeverAbort};

/// The [`MatchBuilder`] runs the start handshake and hands back a ready [`LockstepSession`].
///
/// After setting all appropriate values, call [`host_match`](Self::host_match),
/// [`join_match`](Self::join_match), or [`start_lockstep`](Self::start_lockstep) to consume
/// the builder.
///
/// # Example
///
/// ```no_run
/// use fortress_lockstep::{LockstepConfig, MatchBuilder, PlayerIndex, Roster, TransportSession};
/// use std::net::{Ipv4Addr, SocketAddrV4};
///
/// # fn main() -> Result<(), fortress_lockstep::NetplayError> {
/// let host = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), fortress_lockstep::NETPLAY_PORT);
/// let roster = Roster::new(PlayerIndex::new(1))?.with_peer(PlayerIndex::HOST, host)?;
/// let mut transport = TransportSession::open_ephemeral()?;
/// let session = MatchBuilder::new()
///     .with_lockstep_config(LockstepConfig::lan())
///     .join_match(&mut transport, roster)?;
/// println!("starting with seed {:#x}", session.seed());
/// # Ok(())
/// # }
/// ```
#[must_use = "MatchBuilder must be consumed by calling host_match, join_match or start_lockstep"]
pub struct MatchBuilder {
    lockstep_config: LockstepConfig,
    handshake_config: HandshakeConfig,
    abort: Arc<dyn AbortSignal>,
    events: Arc<dyn EventSink>,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    /// Initial seed the host announces. Drawn from entropy when unset.
    seed: Option<u32>,
}

impl std::fmt::Debug for MatchBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            lockstep_config,
            handshake_config,
            abort: _,
            events: _,
            violation_observer,
            seed,
        } = self;

        f.debug_struct("MatchBuilder")
            .field("lockstep_config", lockstep_config)
            .field("handshake_config", handshake_config)
            .field("has_violation_observer", &violation_observer.is_some())
            .field("seed", seed)
            .finish_non_exhaustive()
    }
}

impl Default for MatchBuilder {
    fn default() -> Self {
        Self {
            lockstep_config: LockstepConfig::default(),
            handshake_config: HandshakeConfig::default(),
            abort: Arc::new(NeverAbort),
            events: Arc::new(TracingSink),
            violation_observer: None,
            seed: None,
        }
    }
}

impl MatchBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the barrier timing and input budget.
    pub fn with_lockstep_config(mut self, config: LockstepConfig) -> Self {
        self.lockstep_config = config;
        self
    }

    /// Sets the handshake timing.
    pub fn with_handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.handshake_config = config;
        self
    }

    /// Sets the signal every wait loop checks. Defaults to [`NeverAbort`].
    pub fn with_abort_signal(mut self, abort: Arc<dyn AbortSignal>) -> Self {
        self.abort = abort;
        self
    }

    /// Sets where match events go. Defaults to [`TracingSink`].
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets a violation observer for both the handshake and the session.
    ///
    /// # Example
    ///
    /// ```
    /// use fortress_lockstep::telemetry::CollectingObserver;
    /// use fortress_lockstep::MatchBuilder;
    /// use std::sync::Arc;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = MatchBuilder::new().with_violation_observer(observer.clone());
    /// # drop(builder);
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Fixes the seed the host announces. Only meaningful for [`host_match`](Self::host_match).
    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Runs the host side of the handshake, then starts lockstep.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidRequest`] for an invalid configuration, roster or parameters.
    /// - Any error of [`GameStartCoordinator::run_host`].
    pub fn host_match<S: DatagramSocket>(
        self,
        transport: &mut TransportSession<S>,
        roster: Roster,
        params: GameParams,
    ) -> Result<LockstepSession<'_, S>, NetplayError> {
        self.validate()?;
        if !roster.is_host() {
            return Err(NetplayError::invalid("host_match needs a roster with local slot 0"));
        }
        params.validate()?;
        let seed = self
            .seed
            .unwrap_or_else(|| Pcg32::from_entropy().next_nonzero_u32());
        let setup = self.coordinator().run_host(transport, &roster, params, seed)?;
        Ok(self.into_session(transport, setup))
    }

    /// Runs the client side of the handshake, then starts lockstep.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidRequest`] for an invalid configuration or roster.
    /// - Any error of [`GameStartCoordinator::run_client`].
    pub fn join_match<S: DatagramSocket>(
        self,
        transport: &mut TransportSession<S>,
        roster: Roster,
    ) -> Result<LockstepSession<'_, S>, NetplayError> {
        self.validate()?;
        if roster.is_host() {
            return Err(NetplayError::invalid("join_match needs a client roster"));
        }
        let setup = self.coordinator().run_client(transport, &roster)?;
        Ok(self.into_session(transport, setup))
    }

    /// Starts lockstep from a setup agreed elsewhere, skipping the handshake.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] for an invalid configuration or roster.
    pub fn start_lockstep<S: DatagramSocket>(
        self,
        transport: &mut TransportSession<S>,
        setup: MatchSetup,
    ) -> Result<LockstepSession<'_, S>, NetplayError> {
        self.validate()?;
        setup.roster.validate()?;
        Ok(self.into_session(transport, setup))
    }

    fn validate(&self) -> Result<(), NetplayError> {
        self.lockstep_config.validate()?;
        self.handshake_config.validate()
    }

    fn coordinator(&self) -> GameStartCoordinator {
        let coordinator = GameStartCoordinator::new(self.handshake_config)
            .with_abort_signal(Arc::clone(&self.abort))
            .with_event_sink(Arc::clone(&self.events));
        match &self.violation_observer {
            Some(observer) => coordinator.with_violation_observer(Arc::clone(observer)),
            None => coordinator,
        }
    }

    fn into_session<S: DatagramSocket>(
        self,
        transport: &mut TransportSession<S>,
        setup: MatchSetup,
    ) -> LockstepSession<'_, S> {
        debug!(
            local = %setup.roster.local(),
            players = setup.roster.present_count(),
            seed = setup.seed,
            "starting lockstep"
        );
        LockstepSession::new(
            transport,
            setup,
            self.lockstep_config,
            self.abort,
            self.events,
            self.violation_observer,
        )
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
    use crate::sessions::event_sink::CollectingSink;
    use crate::{Frame, NetplayEvent, PlayerIndex, KEY_PRESS};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use web_time::Duration;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn transport(network: &MemoryNetwork, port: u16) -> TransportSession<MemorySocket> {
        TransportSession::with_socket(network.bind(addr(port)))
    }

    fn fast() -> MatchBuilder {
        MatchBuilder::new()
            .with_lockstep_config(LockstepConfig {
                wait_slice: Duration::from_millis(5),
                retry_budget: 400,
                ..LockstepConfig::default()
            })
            .with_handshake_config(HandshakeConfig {
                poll_slice: Duration::from_millis(5),
                resend_interval: Duration::from_millis(20),
                timeout: Some(Duration::from_secs(5)),
            })
    }

    #[test]
    fn host_and_client_agree_then_run_frames() {
        let network = MemoryNetwork::new();
        let mut host_t = transport(&network, 1);
        let mut client_t = transport(&network, 2);
        let host_roster = Roster::new(PlayerIndex::HOST)
            .unwrap()
            .with_peer(PlayerIndex::new(1), addr(2))
            .unwrap();
        let client_roster = Roster::new(PlayerIndex::new(1))
            .unwrap()
            .with_peer(PlayerIndex::HOST, addr(1))
            .unwrap();
        let host_events = Arc::new(CollectingSink::new());

        let (host_seed, client_seed) = std::thread::scope(|s| {
            let events = host_events.clone();
            let host = s.spawn(move || {
                let mut session = fast()
                    .with_seed(0xBEEF)
                    .with_event_sink(events)
                    .host_match(&mut host_t, host_roster, GameParams::default())
                    .unwrap();
                for _ in 0..5 {
                    session.queue_input(KEY_PRESS, b'h');
                    session.advance_frame().unwrap();
                    assert_eq!(session.take_sync_buf(PlayerIndex::new(1)).len(), 1);
                }
                session.seed()
            });
            let client = s.spawn(move || {
                let mut session = fast().join_match(&mut client_t, client_roster).unwrap();
                for _ in 0..5 {
                    session.queue_input(KEY_PRESS, b'c');
                    session.advance_frame().unwrap();
                    assert_eq!(session.take_sync_buf(PlayerIndex::HOST).len(), 1);
                }
                assert_eq!(session.frame(), Frame::new(5));
                session.seed()
            });
            (host.join().unwrap(), client.join().unwrap())
        });

        assert_eq!(host_seed, 0xBEEF);
        assert_eq!(client_seed, 0xBEEF);
        assert!(matches!(
            host_events.events().first(),
            Some(NetplayEvent::MatchStarted { seed: 0xBEEF, .. })
        ));
    }

    #[test]
    fn wrong_roster_side_is_rejected() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, 1);
        let client_roster = Roster::new(PlayerIndex::new(1))
            .unwrap()
            .with_peer(PlayerIndex::HOST, addr(2))
            .unwrap();
        assert!(matches!(
            MatchBuilder::new().host_match(&mut t, client_roster, GameParams::default()),
            Err(NetplayError::InvalidRequest { .. })
        ));

        let host_roster = Roster::new(PlayerIndex::HOST)
            .unwrap()
            .with_peer(PlayerIndex::new(1), addr(2))
            .unwrap();
        assert!(matches!(
            MatchBuilder::new().join_match(&mut t, host_roster),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn invalid_config_is_rejected_before_any_traffic() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, 1);
        let roster = Roster::new(PlayerIndex::HOST)
            .unwrap()
            .with_peer(PlayerIndex::new(1), addr(2))
            .unwrap();
        let result = MatchBuilder::new()
            .with_lockstep_config(LockstepConfig {
                retry_budget: 0,
                ..LockstepConfig::default()
            })
            .host_match(&mut t, roster, GameParams::default());
        assert!(matches!(result, Err(NetplayError::InvalidRequest { .. })));
        assert!(network.sent_log().is_empty());
    }

    #[test]
    fn start_lockstep_skips_the_handshake() {
        let network = MemoryNetwork::new();
        let mut t = transport(&network, 1);
        let roster = Roster::new(PlayerIndex::HOST)
            .unwrap()
            .with_peer(PlayerIndex::new(1), addr(2))
            .unwrap();
        let session = MatchBuilder::new()
            .start_lockstep(&mut t, MatchSetup::new(roster, GameParams::default(), 12))
            .unwrap();
        assert_eq!(session.seed(), 12);
        assert_eq!(session.frame(), Frame::ZERO);
        drop(session);
        assert!(network.sent_log().is_empty());
    }

    #[test]
    fn debug_output_hides_trait_objects() {
        let text = format!("{:?}", MatchBuilder::new().with_seed(3));
        assert!(text.contains("MatchBuilder"));
        assert!(text.contains("seed: Some(3)"));
    }
}
