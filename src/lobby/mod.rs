//! Lobby discovery: advertise, list and join games before a match.
//!
//! [`LobbyDiscovery`] is a state machine over [`LobbyState`]. The caller drives it with
//! the explicit transitions ([`start`](LobbyDiscovery::start),
//! [`set_hosting`](LobbyDiscovery::set_hosting), [`join_game`](LobbyDiscovery::join_game),
//! ...) and calls [`poll`](LobbyDiscovery::poll) regularly; all network work happens in
//! those calls, on the caller's thread.
//!
//! ```text
//!            start               set_hosting(true)
//!   NONE ────────────► LISTING ◄──────────────────► HOSTING
//!                        │  ▲    set_hosting(false)
//!              join_game │  │ leave_game / kicked / game removed
//!                        ▼  │
//!                      JOINING ──── id in snapshot ───► JOINED
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fortress_lockstep::{LobbyConfig, LobbyDiscovery, LobbyPoll, MatchBuilder, TransportSession};
//! use web_time::{Duration, Instant};
//!
//! # fn main() -> Result<(), fortress_lockstep::NetplayError> {
//! let mut transport = TransportSession::open_ephemeral()?;
//! let mut lobby = LobbyDiscovery::new(LobbyConfig::new("guest"))?;
//! lobby.start();
//! loop {
//!     let next_id = lobby.games().iter().next().map(|game| game.game_id());
//!     if let Some(id) = next_id {
//!         if lobby.state() == fortress_lockstep::LobbyState::Listing {
//!             lobby.join_game(&mut transport, id)?;
//!         }
//!     }
//!     if lobby.poll(&mut transport, Instant::now())? == LobbyPoll::MatchStarting {
//!         let roster = lobby.match_roster()?;
//!         let session = MatchBuilder::new().join_match(&mut transport, roster)?;
//!         # drop(session);
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(50));
//! }
//! # Ok(())
//! # }
//! ```

pub mod server;
pub mod snapshot;

use std::net::SocketAddrV4;
use std::sync::Arc;

use tracing::{debug, trace};
use web_time::Instant;

use crate::lobby::snapshot::{DiscoveredGame, GameInfoPlayer, GameInfoSnapshot, GameList};
use crate::network::messages::{LobbyMessage, MessageKind};
use crate::network::transport::{Channel, Datagram, TransportSession};
use crate::sessions::config::LobbyConfig;
use crate::sessions::event_sink::TracingSink;
use crate::sessions::roster::Roster;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    report_violation_to, DatagramSocket, EventSink, NetplayError, NetplayEvent, PlayerIndex,
};

/// Where the lobby is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum LobbyState {
    /// Not in the lobby.
    #[default]
    None,
    /// Advertising our own game.
    Hosting,
    /// Collecting the list of available games.
    Listing,
    /// Asking a host to let us in.
    Joining,
    /// In a host's game, waiting for the match to start.
    Joined,
}

impl std::fmt::Display for LobbyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Hosting => "hosting",
            Self::Listing => "listing",
            Self::Joining => "joining",
            Self::Joined => "joined",
        };
        f.write_str(name)
    }
}

/// What a [`LobbyDiscovery::poll`] call found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "a MatchStarting result means the start packet is waiting on the transport"]
pub enum LobbyPoll {
    /// Nothing needs the caller's attention.
    Idle,
    /// The joined game's host sent its start packet. It was put back on the transport;
    /// run the client handshake with [`LobbyDiscovery::match_roster`].
    MatchStarting,
}

/// The lobby state machine.
pub struct LobbyDiscovery {
    config: LobbyConfig,
    state: LobbyState,
    games: GameList,
    /// Our game while hosting.
    hosted: GameInfoSnapshot,
    /// The game we are joining or have joined.
    joined: Option<DiscoveredGame>,
    epoch: Option<Instant>,
    last_refresh: Option<Instant>,
    events: Arc<dyn EventSink>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for LobbyDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            config,
            state,
            games,
            hosted,
            joined,
            epoch: _,
            last_refresh,
            events: _,
            violation_observer,
        } = self;
        f.debug_struct("LobbyDiscovery")
            .field("config", config)
            .field("state", state)
            .field("games", &games.len())
            .field("hosted", hosted)
            .field("joined", joined)
            .field("last_refresh", last_refresh)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish_non_exhaustive()
    }
}

impl LobbyDiscovery {
    /// Creates a lobby in [`LobbyState::None`].
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if the config is invalid.
    pub fn new(config: LobbyConfig) -> Result<Self, NetplayError> {
        config.validate()?;
        let hosted = GameInfoSnapshot::new(config.unique_id, config.death_match);
        Ok(Self {
            config,
            state: LobbyState::None,
            games: GameList::new(),
            hosted,
            joined: None,
            epoch: None,
            last_refresh: None,
            events: Arc::new(TracingSink),
            violation_observer: None,
        })
    }

    /// Sets where lobby events go. Defaults to [`TracingSink`].
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

    /// The current state.
    #[must_use]
    pub const fn state(&self) -> LobbyState {
        self.state
    }

    /// Games discovered while listing.
    #[must_use]
    pub const fn games(&self) -> &GameList {
        &self.games
    }

    /// Our game while hosting.
    #[must_use]
    pub fn hosted_game(&self) -> Option<&GameInfoSnapshot> {
        (self.state == LobbyState::Hosting).then_some(&self.hosted)
    }

    /// The game being joined or joined.
    #[must_use]
    pub const fn joined_game(&self) -> Option<&DiscoveredGame> {
        self.joined.as_ref()
    }

    /// Our unique id.
    #[must_use]
    pub const fn unique_id(&self) -> u32 {
        self.config.unique_id
    }

    /// Enters the lobby. Does nothing unless the state is `None`.
    pub fn start(&mut self) {
        if self.state == LobbyState::None {
            self.games.clear();
            self.last_refresh = None;
            self.transition(LobbyState::Listing);
        }
    }

    /// Leaves the lobby, withdrawing a hosted game or leaving a joined one.
    ///
    /// # Errors
    /// Returns [`NetplayError::SocketError`] if a farewell packet cannot be sent.
    pub fn stop<S: DatagramSocket>(
        &mut self,
        transport: &mut TransportSession<S>,
    ) -> Result<(), NetplayError> {
        match self.state {
            LobbyState::Hosting => self.withdraw_hosted(transport)?,
            LobbyState::Joining | LobbyState::Joined => self.send_leave(transport)?,
            LobbyState::Listing | LobbyState::None => {},
        }
        self.joined = None;
        self.games.clear();
        self.transition(LobbyState::None);
        Ok(())
    }

    /// Starts or stops hosting.
    ///
    /// Hosting puts us in slot 0 of a fresh snapshot whose game id is our unique id.
    /// Stopping sends `REMOVE_GAME` to every joined player and the global server.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidRequest`] if hosting is requested outside `Listing`.
    /// - [`NetplayError::SocketError`] if a packet cannot be sent.
    pub fn set_hosting<S: DatagramSocket>(
        &mut self,
        transport: &mut TransportSession<S>,
        hosting: bool,
    ) -> Result<(), NetplayError> {
        match (hosting, self.state) {
            (true, LobbyState::Hosting) | (false, LobbyState::Listing) => Ok(()),
            (true, LobbyState::Listing) => {
                let local = transport.local_addr()?;
                self.hosted = GameInfoSnapshot::new(self.config.unique_id, self.config.death_match);
                self.hosted.players[0] =
                    GameInfoPlayer::new(self.config.unique_id, local, self.config.player_name.clone());
                self.last_refresh = None;
                self.transition(LobbyState::Hosting);
                Ok(())
            },
            (false, LobbyState::Hosting) => {
                self.withdraw_hosted(transport)?;
                self.last_refresh = None;
                self.transition(LobbyState::Listing);
                Ok(())
            },
            (_, state) => Err(NetplayError::invalid(format!(
                "cannot change hosting while {state}"
            ))),
        }
    }

    /// Selects a listed game and sends the first join request.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidRequest`] outside `Listing` or for an unlisted game.
    /// - [`NetplayError::SocketError`] if the request cannot be sent.
    pub fn join_game<S: DatagramSocket>(
        &mut self,
        transport: &mut TransportSession<S>,
        game_id: u32,
    ) -> Result<(), NetplayError> {
        if self.state != LobbyState::Listing {
            return Err(NetplayError::invalid(format!(
                "cannot join a game while {}",
                self.state
            )));
        }
        let game = self
            .games
            .get(game_id)
            .cloned()
            .ok_or_else(|| NetplayError::invalid(format!("game {game_id:#x} is not listed")))?;
        let host = game.host;
        self.joined = Some(game);
        self.transition(LobbyState::Joining);
        self.send_join(transport, host, game_id)
    }

    /// Leaves the game being joined and goes back to listing.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidRequest`] unless joining or joined.
    /// - [`NetplayError::SocketError`] if the leave request cannot be sent.
    pub fn leave_game<S: DatagramSocket>(
        &mut self,
        transport: &mut TransportSession<S>,
    ) -> Result<(), NetplayError> {
        if !matches!(self.state, LobbyState::Joining | LobbyState::Joined) {
            return Err(NetplayError::invalid(format!(
                "no game to leave while {}",
                self.state
            )));
        }
        self.send_leave(transport)?;
        self.joined = None;
        self.last_refresh = None;
        self.transition(LobbyState::Listing);
        Ok(())
    }

    /// Removes a player from the hosted game and tells everyone, the kicked player included.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidRequest`] when not hosting, for our own id, or for an
    ///   id not in the game.
    /// - [`NetplayError::SocketError`] if the snapshot cannot be sent.
    pub fn kick_player<S: DatagramSocket>(
        &mut self,
        transport: &mut TransportSession<S>,
        player_id: u32,
    ) -> Result<(), NetplayError> {
        if self.state != LobbyState::Hosting {
            return Err(NetplayError::invalid("only the host can kick players"));
        }
        let slot = self
            .hosted
            .slot_of(player_id)
            .filter(|slot| !slot.is_host())
            .ok_or_else(|| NetplayError::invalid(format!("player {player_id:#x} is not a guest")))?;
        let kicked = std::mem::take(&mut self.hosted.players[slot.as_usize()]);
        debug!(player_id, address = %kicked.address, "kicking player");
        self.events.on_event(&NetplayEvent::PlayerLeft { player_id });

        let snapshot = LobbyMessage::GameInfo(self.hosted.clone()).encode();
        transport.send_to(kicked.address, &snapshot)?;
        self.push_snapshot(transport)
    }

    /// Changes the advertised death-match value and pushes it to joined players when hosting.
    ///
    /// # Errors
    /// Returns [`NetplayError::SocketError`] if the snapshot cannot be sent.
    pub fn set_death_match<S: DatagramSocket>(
        &mut self,
        transport: &mut TransportSession<S>,
        death_match: u8,
    ) -> Result<(), NetplayError> {
        self.config.death_match = death_match;
        self.hosted.death_match = death_match;
        if self.state == LobbyState::Hosting {
            self.push_snapshot(transport)?;
        }
        Ok(())
    }

    /// Converts the hosted or joined game into a match roster.
    ///
    /// The host's address is the one its packets come from; every other player is
    /// reached at the address the host saw.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] unless hosting or joined, or if the
    /// snapshot does not describe a playable match.
    pub fn match_roster(&self) -> Result<Roster, NetplayError> {
        let (snapshot, host) = match (self.state, &self.joined) {
            (LobbyState::Hosting, _) => (&self.hosted, None),
            (LobbyState::Joined, Some(game)) => (&game.snapshot, Some(game.host)),
            (state, _) => {
                return Err(NetplayError::invalid(format!("no match roster while {state}")));
            },
        };
        let local = snapshot
            .slot_of(self.config.unique_id)
            .ok_or_else(|| NetplayError::invalid("our id is not in the game"))?;
        let mut roster = Roster::new(local)?;
        for (i, player) in snapshot.players.iter().enumerate() {
            let index = PlayerIndex::new(i);
            if player.is_empty() || index == local {
                continue;
            }
            let address = match host {
                Some(host) if index.is_host() => host,
                _ => player.address,
            };
            roster.set_peer(index, address)?;
        }
        roster.validate()?;
        Ok(roster)
    }

    /// Runs the timer if due, then handles every queued datagram.
    ///
    /// # Errors
    /// Returns [`NetplayError::SocketError`] on a transport failure.
    pub fn poll<S: DatagramSocket>(
        &mut self,
        transport: &mut TransportSession<S>,
        now: Instant,
    ) -> Result<LobbyPoll, NetplayError> {
        if self.state == LobbyState::None {
            return Ok(LobbyPoll::Idle);
        }
        let epoch = *self.epoch.get_or_insert(now);
        let now_ms = wire_millis(epoch, now);

        let due = self
            .last_refresh
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.refresh_interval);
        if due {
            self.last_refresh = Some(now);
            self.on_timer(transport, now_ms)?;
        }

        while let Some(datagram) = transport.receive()? {
            match MessageKind::classify(&datagram.payload) {
                Ok(MessageKind::Lobby) => match LobbyMessage::decode(&datagram.payload) {
                    Ok(message) => self.on_message(transport, datagram.source, message, now_ms)?,
                    Err(err) => self.report_malformed(datagram.source, &err),
                },
                Ok(MessageKind::NewGame) if self.is_from_joined_host(&datagram) => {
                    debug!(host = %datagram.source, "host is starting the match");
                    transport.requeue(datagram);
                    return Ok(LobbyPoll::MatchStarting);
                },
                Ok(kind) => trace!(?kind, source = %datagram.source, "ignoring non-lobby packet"),
                Err(err) => self.report_malformed(datagram.source, &err),
            }
        }
        Ok(LobbyPoll::Idle)
    }

    fn is_from_joined_host(&self, datagram: &Datagram) -> bool {
        self.state == LobbyState::Joined
            && self
                .joined
                .as_ref()
                .is_some_and(|game| game.host == datagram.source)
    }

    fn on_timer<S: DatagramSocket>(
        &mut self,
        transport: &mut TransportSession<S>,
        now_ms: u32,
    ) -> Result<(), NetplayError> {
        trace!(state = %self.state, "lobby timer");
        let probe = LobbyMessage::Ping {
            reply: false,
            timestamp_ms: now_ms,
        }
        .encode();
        match self.state {
            LobbyState::Hosting => {
                if let Some(server) = self.config.global_server {
                    let announce = LobbyMessage::AnnounceGame {
                        game_id: self.hosted.game_id,
                    };
                    transport.send_to(server, &announce.encode())?;
                }
                for guest in self.hosted.players.iter().skip(1).filter(|p| !p.is_empty()) {
                    transport.send_to(guest.address, &probe)?;
                }
            },
            LobbyState::Listing => {
                if let Some(server) = self.config.global_server {
                    transport.send_to(server, &LobbyMessage::RequestGameServers.encode())?;
                }
                if let Some(target) = self.config.local_discovery {
                    transport.set_broadcast_target(target);
                    transport.send(Channel::Broadcast, &LobbyMessage::RequestGameInfo.encode())?;
                }
            },
            LobbyState::Joining | LobbyState::Joined => {
                if let Some(game) = &self.joined {
                    let (host, game_id) = (game.host, game.game_id());
                    self.send_join(transport, host, game_id)?;
                    if self.state == LobbyState::Joined {
                        transport.send_to(host, &probe)?;
                    }
                }
            },
            LobbyState::None => {},
        }
        Ok(())
    }

    fn on_message<S: DatagramSocket>(
        &mut self,
        transport: &mut TransportSession<S>,
        source: SocketAddrV4,
        message: LobbyMessage,
        now_ms: u32,
    ) -> Result<(), NetplayError> {
        match (self.state, message) {
            (_, LobbyMessage::Ping { reply: false, timestamp_ms }) => {
                let echo = LobbyMessage::Ping {
                    reply: true,
                    timestamp_ms,
                };
                transport.send_to(source, &echo.encode())?;
            },
            (_, LobbyMessage::Ping { reply: true, timestamp_ms }) => {
                self.record_ping(source, now_ms.wrapping_sub(timestamp_ms));
            },
            (LobbyState::Hosting, LobbyMessage::RequestGameInfo) => {
                transport.send_to(source, &LobbyMessage::GameInfo(self.hosted.clone()).encode())?;
            },
            (LobbyState::Hosting, LobbyMessage::AnnouncePlayer { players }) => {
                // open our NAT mapping towards each player about to contact us
                for player in players {
                    transport.send_to(player, &LobbyMessage::OpenFirewall.encode())?;
                }
            },
            (
                LobbyState::Hosting,
                LobbyMessage::RequestJoin {
                    game_id,
                    player_id,
                    name,
                },
            ) if game_id == self.hosted.game_id => {
                self.on_join_request(transport, source, player_id, name)?;
            },
            (LobbyState::Hosting, LobbyMessage::RequestLeave { game_id, player_id })
                if game_id == self.hosted.game_id =>
            {
                if let Some(slot) = self.hosted.slot_of(player_id).filter(|s| !s.is_host()) {
                    self.hosted.players[slot.as_usize()] = GameInfoPlayer::default();
                    self.events.on_event(&NetplayEvent::PlayerLeft { player_id });
                    self.push_snapshot(transport)?;
                }
            },
            (LobbyState::Listing, LobbyMessage::GameServers { servers }) => {
                let request = LobbyMessage::RequestGameInfo.encode();
                for server in servers {
                    transport.send_to(server, &request)?;
                }
            },
            (LobbyState::Listing, LobbyMessage::GameInfo(snapshot)) => {
                if snapshot.game_id == 0 {
                    self.report_malformed(source, &"snapshot with game id 0");
                    return Ok(());
                }
                self.games.merge(source, snapshot);
                self.events.on_event(&NetplayEvent::GameListUpdated {
                    games: self.games.len(),
                });
            },
            (LobbyState::Joining | LobbyState::Joined, LobbyMessage::GameInfo(snapshot)) => {
                self.on_joined_snapshot(source, snapshot);
            },
            (LobbyState::Listing, LobbyMessage::RemoveGame { game_id }) => {
                if self.games.remove(game_id).is_some() {
                    self.events.on_event(&NetplayEvent::GameRemoved { game_id });
                }
            },
            (LobbyState::Joining | LobbyState::Joined, LobbyMessage::RemoveGame { game_id }) => {
                let ours = self
                    .joined
                    .as_ref()
                    .is_some_and(|game| game.game_id() == game_id && game.host == source);
                if ours {
                    self.games.remove(game_id);
                    self.joined = None;
                    self.last_refresh = None;
                    self.events.on_event(&NetplayEvent::GameRemoved { game_id });
                    self.transition(LobbyState::Listing);
                }
            },
            (_, LobbyMessage::OpenFirewall) => trace!(%source, "firewall opened"),
            (state, message) => {
                trace!(%state, command = ?message.command(), %source, "ignoring lobby message");
            },
        }
        Ok(())
    }

    fn on_join_request<S: DatagramSocket>(
        &mut self,
        transport: &mut TransportSession<S>,
        source: SocketAddrV4,
        player_id: u32,
        name: String,
    ) -> Result<(), NetplayError> {
        if player_id == 0 || player_id == self.hosted.game_id {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Lobby,
                "join request from {} with reserved id {:#x}",
                source,
                player_id
            );
            return Ok(());
        }

        let changed = if let Some(slot) = self.hosted.slot_of(player_id) {
            // refresh of an existing join
            let player = &mut self.hosted.players[slot.as_usize()];
            let changed = player.address != source || player.name != name;
            player.address = source;
            player.name = name;
            changed
        } else if let Some(slot) = self.hosted.free_slot() {
            debug!(player_id, %source, slot = %slot, "player joined");
            self.hosted.players[slot.as_usize()] = GameInfoPlayer::new(player_id, source, name);
            self.events.on_event(&NetplayEvent::PlayerJoined { player_id });
            true
        } else {
            debug!(player_id, %source, "game full, refusing join");
            false
        };

        if changed {
            self.push_snapshot(transport)
        } else {
            // the requester may have missed the last push
            transport.send_to(source, &LobbyMessage::GameInfo(self.hosted.clone()).encode())
        }
    }

    fn on_joined_snapshot(&mut self, source: SocketAddrV4, snapshot: GameInfoSnapshot) {
        let Some(game) = self.joined.as_mut() else {
            return;
        };
        if game.host != source || game.game_id() != snapshot.game_id {
            trace!(%source, game_id = snapshot.game_id, "snapshot for another game");
            return;
        }

        let previous = std::mem::replace(&mut game.snapshot, snapshot);
        game.snapshot.inherit_ping(&previous);
        let current = game.snapshot.clone();
        self.games.merge(source, current.clone());

        let me = self.config.unique_id;
        match (self.state, current.slot_of(me)) {
            (LobbyState::Joining, Some(slot)) => {
                self.events.on_event(&NetplayEvent::Joined {
                    game_id: current.game_id,
                    player: slot,
                });
                self.transition(LobbyState::Joined);
            },
            (LobbyState::Joined, None) => {
                self.joined = None;
                self.last_refresh = None;
                self.events.on_event(&NetplayEvent::Kicked {
                    game_id: current.game_id,
                });
                self.transition(LobbyState::Listing);
            },
            (LobbyState::Joined, Some(_)) => {
                for player_id in current.player_ids().filter(|&id| id != me) {
                    if previous.slot_of(player_id).is_none() {
                        self.events.on_event(&NetplayEvent::PlayerJoined { player_id });
                    }
                }
                for player_id in previous.player_ids().filter(|&id| id != me) {
                    if current.slot_of(player_id).is_none() {
                        self.events.on_event(&NetplayEvent::PlayerLeft { player_id });
                    }
                }
            },
            _ => {},
        }
    }

    fn record_ping(&mut self, source: SocketAddrV4, rtt_ms: u32) {
        let player = match (self.state, self.joined.as_mut()) {
            (LobbyState::Hosting, _) => self
                .hosted
                .slot_at(source)
                .map(|slot| &mut self.hosted.players[slot.as_usize()]),
            (LobbyState::Joined, Some(game)) if game.host == source => {
                Some(&mut game.snapshot.players[PlayerIndex::HOST.as_usize()])
            },
            _ => None,
        };
        match player {
            Some(player) => {
                player.ping.record(rtt_ms);
                trace!(%source, rtt_ms, "ping");
            },
            None => trace!(%source, "unsolicited ping reply"),
        }
    }

    /// Sends the hosted snapshot to every guest.
    fn push_snapshot<S: DatagramSocket>(
        &self,
        transport: &mut TransportSession<S>,
    ) -> Result<(), NetplayError> {
        let bytes = LobbyMessage::GameInfo(self.hosted.clone()).encode();
        for guest in self.hosted.players.iter().skip(1).filter(|p| !p.is_empty()) {
            transport.send_to(guest.address, &bytes)?;
        }
        Ok(())
    }

    fn withdraw_hosted<S: DatagramSocket>(
        &self,
        transport: &mut TransportSession<S>,
    ) -> Result<(), NetplayError> {
        let remove = LobbyMessage::RemoveGame {
            game_id: self.hosted.game_id,
        }
        .encode();
        for guest in self.hosted.players.iter().skip(1).filter(|p| !p.is_empty()) {
            transport.send_to(guest.address, &remove)?;
        }
        if let Some(server) = self.config.global_server {
            transport.send_to(server, &remove)?;
        }
        Ok(())
    }

    fn send_join<S: DatagramSocket>(
        &self,
        transport: &mut TransportSession<S>,
        host: SocketAddrV4,
        game_id: u32,
    ) -> Result<(), NetplayError> {
        let request = LobbyMessage::RequestJoin {
            game_id,
            player_id: self.config.unique_id,
            name: self.config.player_name.clone(),
        };
        transport.send_to(host, &request.encode())
    }

    fn send_leave<S: DatagramSocket>(
        &self,
        transport: &mut TransportSession<S>,
    ) -> Result<(), NetplayError> {
        let Some(game) = &self.joined else {
            return Ok(());
        };
        let request = LobbyMessage::RequestLeave {
            game_id: game.game_id(),
            player_id: self.config.unique_id,
        };
        transport.send_to(game.host, &request.encode())
    }

    fn transition(&mut self, to: LobbyState) {
        if self.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.state, to);
        debug!(%from, %to, "lobby state");
        self.events
            .on_event(&NetplayEvent::LobbyStateChanged { from, to });
    }

    fn report_malformed(&self, source: SocketAddrV4, reason: &dyn std::fmt::Display) {
        report_violation_to!(
            self.violation_observer,
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "dropping lobby packet from {}: {}",
            source,
            reason
        );
    }
}

/// Milliseconds since `epoch`, wrapping like the 32-bit wire field.
fn wire_millis(epoch: Instant, now: Instant) -> u32 {
    // truncation is the wire format's wrap-around
    #[allow(clippy::cast_possible_truncation)]
    let millis = now.saturating_duration_since(epoch).as_millis() as u32;
    millis
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
    use crate::network::messages::{StartPacket, NEW_GAME};
    use crate::sessions::event_sink::CollectingSink;
    use crate::sessions::game_start::GameParams;
    use crate::telemetry::CollectingObserver;
    use crate::NETPLAY_PORT;
    use smallvec::smallvec;
    use std::net::Ipv4Addr;
    use web_time::Duration;

    const HOST_ID: u32 = 0x1000;
    const GUEST_ID: u32 = 0x2000;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    fn host_addr() -> SocketAddrV4 {
        addr(1, NETPLAY_PORT)
    }

    fn guest_addr() -> SocketAddrV4 {
        addr(2, 50_000)
    }

    struct Node {
        lobby: LobbyDiscovery,
        transport: TransportSession<MemorySocket>,
        events: Arc<CollectingSink>,
        observer: Arc<CollectingObserver>,
    }

    impl Node {
        fn new(network: &MemoryNetwork, at: SocketAddrV4, name: &str, id: u32) -> Self {
            let events = Arc::new(CollectingSink::new());
            let observer = Arc::new(CollectingObserver::new());
            let config = LobbyConfig {
                local_discovery: Some(SocketAddrV4::new(Ipv4Addr::BROADCAST, NETPLAY_PORT)),
                ..LobbyConfig::new(name).with_unique_id(id)
            };
            let lobby = LobbyDiscovery::new(config)
                .unwrap()
                .with_event_sink(events.clone())
                .with_violation_observer(observer.clone());
            Self {
                lobby,
                transport: TransportSession::with_socket(network.bind(at)),
                events,
                observer,
            }
        }

        fn poll(&mut self, now: Instant) -> LobbyPoll {
            self.lobby.poll(&mut self.transport, now).unwrap()
        }
    }

    fn host_and_guest(network: &MemoryNetwork) -> (Node, Node) {
        let mut host = Node::new(network, host_addr(), "host", HOST_ID);
        let mut guest = Node::new(network, guest_addr(), "guest", GUEST_ID);
        host.lobby.start();
        host.lobby.set_hosting(&mut host.transport, true).unwrap();
        guest.lobby.start();
        (host, guest)
    }

    /// Polls both nodes a few times at `now` so every request gets its reply.
    fn settle(host: &mut Node, guest: &mut Node, now: Instant) {
        for _ in 0..3 {
            let _ = guest.poll(now);
            let _ = host.poll(now);
        }
    }

    fn joined_pair(network: &MemoryNetwork) -> (Node, Node, Instant) {
        let (mut host, mut guest) = host_and_guest(network);
        let t0 = Instant::now();
        settle(&mut host, &mut guest, t0);
        guest.lobby.join_game(&mut guest.transport, HOST_ID).unwrap();
        settle(&mut host, &mut guest, t0);
        assert_eq!(guest.lobby.state(), LobbyState::Joined);
        (host, guest, t0)
    }

    #[test]
    fn listing_discovers_a_local_host_by_broadcast() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest) = host_and_guest(&network);
        settle(&mut host, &mut guest, Instant::now());

        let games = guest.lobby.games();
        assert_eq!(games.len(), 1);
        let game = games.get(HOST_ID).unwrap();
        assert_eq!(game.host, host_addr());
        assert_eq!(game.snapshot.players[0].name, "host");
        assert!(guest
            .events
            .events()
            .contains(&NetplayEvent::GameListUpdated { games: 1 }));
    }

    #[test]
    fn listing_broadcasts_to_the_configured_discovery_target() {
        let network = MemoryNetwork::new();
        let subnet = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 255), NETPLAY_PORT);
        let config = LobbyConfig {
            local_discovery: Some(subnet),
            ..LobbyConfig::new("guest").with_unique_id(GUEST_ID)
        };
        let mut lobby = LobbyDiscovery::new(config).unwrap();
        let mut transport = TransportSession::with_socket(network.bind(guest_addr()));
        lobby.start();
        let _ = lobby.poll(&mut transport, Instant::now()).unwrap();

        let request = LobbyMessage::RequestGameInfo.encode();
        let targets: Vec<_> = network
            .sent_log()
            .into_iter()
            .filter(|(from, _, payload)| *from == guest_addr() && *payload == request)
            .map(|(_, to, _)| to)
            .collect();
        assert_eq!(targets, vec![subnet]);
    }

    #[test]
    fn joining_becomes_joined_once_the_host_lists_us() {
        let network = MemoryNetwork::new();
        let (host, guest, _) = joined_pair(&network);

        let hosted = host.lobby.hosted_game().unwrap();
        assert_eq!(hosted.slot_of(GUEST_ID), Some(PlayerIndex::new(1)));
        assert_eq!(hosted.players[1].address, guest_addr());
        assert!(host
            .events
            .events()
            .contains(&NetplayEvent::PlayerJoined { player_id: GUEST_ID }));
        assert!(guest.events.events().contains(&NetplayEvent::Joined {
            game_id: HOST_ID,
            player: PlayerIndex::new(1),
        }));
    }

    #[test]
    fn join_refresh_does_not_take_a_second_slot() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest, t0) = joined_pair(&network);
        let later = t0 + Duration::from_secs(4);
        settle(&mut host, &mut guest, later);
        assert_eq!(host.lobby.hosted_game().unwrap().player_count(), 2);
        assert_eq!(guest.lobby.state(), LobbyState::Joined);
    }

    #[test]
    fn kicked_guest_falls_back_to_listing() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest, t0) = joined_pair(&network);
        host.lobby.kick_player(&mut host.transport, GUEST_ID).unwrap();
        let _ = guest.poll(t0);

        assert_eq!(guest.lobby.state(), LobbyState::Listing);
        assert!(guest.lobby.joined_game().is_none());
        assert!(guest
            .events
            .events()
            .contains(&NetplayEvent::Kicked { game_id: HOST_ID }));
        assert_eq!(host.lobby.hosted_game().unwrap().player_count(), 1);
    }

    #[test]
    fn kick_rejects_the_host_and_unknown_ids() {
        let network = MemoryNetwork::new();
        let (mut host, _guest, _) = joined_pair(&network);
        assert!(host.lobby.kick_player(&mut host.transport, HOST_ID).is_err());
        assert!(host.lobby.kick_player(&mut host.transport, 0xDEAD).is_err());
    }

    #[test]
    fn leave_game_frees_the_slot() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest, t0) = joined_pair(&network);
        guest.lobby.leave_game(&mut guest.transport).unwrap();
        assert_eq!(guest.lobby.state(), LobbyState::Listing);
        let _ = host.poll(t0);
        assert_eq!(host.lobby.hosted_game().unwrap().slot_of(GUEST_ID), None);
        assert!(host
            .events
            .events()
            .contains(&NetplayEvent::PlayerLeft { player_id: GUEST_ID }));
    }

    #[test]
    fn removed_game_sends_joined_guest_back_to_listing() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest, t0) = joined_pair(&network);
        host.lobby.set_hosting(&mut host.transport, false).unwrap();
        assert_eq!(host.lobby.state(), LobbyState::Listing);
        let _ = guest.poll(t0);
        assert_eq!(guest.lobby.state(), LobbyState::Listing);
        assert!(guest.lobby.games().get(HOST_ID).is_none());
        assert!(guest
            .events
            .events()
            .contains(&NetplayEvent::GameRemoved { game_id: HOST_ID }));
    }

    #[test]
    fn match_rosters_agree_on_slots() {
        let network = MemoryNetwork::new();
        let (host, guest, _) = joined_pair(&network);

        let host_roster = host.lobby.match_roster().unwrap();
        assert!(host_roster.is_host());
        assert_eq!(host_roster.peers().collect::<Vec<_>>(), vec![(PlayerIndex::new(1), guest_addr())]);

        let guest_roster = guest.lobby.match_roster().unwrap();
        assert_eq!(guest_roster.local(), PlayerIndex::new(1));
        assert_eq!(guest_roster.host_address(), Some(host_addr()));
    }

    #[test]
    fn roster_needs_hosting_or_joined() {
        let network = MemoryNetwork::new();
        let (_host, guest) = host_and_guest(&network);
        assert!(guest.lobby.match_roster().is_err());
    }

    #[test]
    fn start_packet_from_host_is_requeued() {
        let network = MemoryNetwork::new();
        let (_host, mut guest, t0) = joined_pair(&network);
        let start = StartPacket {
            sender: PlayerIndex::HOST,
            params: GameParams::default(),
            seed: 5,
        }
        .encode();
        network.inject(host_addr(), guest_addr(), &start);

        assert_eq!(guest.poll(t0), LobbyPoll::MatchStarting);
        let datagram = guest.transport.receive().unwrap().unwrap();
        assert_eq!(datagram.payload[0], NEW_GAME);
        assert_eq!(datagram.source, host_addr());
    }

    #[test]
    fn start_packet_from_a_stranger_is_ignored() {
        let network = MemoryNetwork::new();
        let (_host, mut guest, t0) = joined_pair(&network);
        let start = StartPacket {
            sender: PlayerIndex::HOST,
            params: GameParams::default(),
            seed: 5,
        }
        .encode();
        network.inject(addr(9, 1), guest_addr(), &start);
        assert_eq!(guest.poll(t0), LobbyPoll::Idle);
    }

    #[test]
    fn announce_player_opens_the_firewall_once_per_address() {
        let network = MemoryNetwork::new();
        let mut host = Node::new(&network, host_addr(), "host", HOST_ID);
        host.lobby.start();
        host.lobby.set_hosting(&mut host.transport, true).unwrap();
        let server = addr(200, 44047);
        let players = smallvec![addr(3, 1000), addr(4, 2000)];
        network.inject(
            server,
            host_addr(),
            &LobbyMessage::AnnouncePlayer { players }.encode(),
        );
        let _ = host.poll(Instant::now());

        let open = LobbyMessage::OpenFirewall.encode();
        for target in [addr(3, 1000), addr(4, 2000)] {
            let sent = network
                .sent_log()
                .into_iter()
                .filter(|(from, to, p)| *from == host_addr() && *to == target && *p == open)
                .count();
            assert_eq!(sent, 1);
        }
    }

    #[test]
    fn game_servers_reply_leads_to_info_requests() {
        let network = MemoryNetwork::new();
        let server = addr(200, 44047);
        let mut guest = Node::new(&network, guest_addr(), "guest", GUEST_ID);
        guest.lobby.config.global_server = Some(server);
        guest.lobby.start();
        let t0 = Instant::now();
        let _ = guest.poll(t0);
        assert_eq!(
            network.sent_log().iter().filter(|(_, to, _)| *to == server).count(),
            1
        );

        let servers = smallvec![addr(5, NETPLAY_PORT)];
        network.inject(server, guest_addr(), &LobbyMessage::GameServers { servers }.encode());
        let _ = guest.poll(t0);
        let request = LobbyMessage::RequestGameInfo.encode();
        assert!(network
            .sent_log()
            .iter()
            .any(|(_, to, p)| *to == addr(5, NETPLAY_PORT) && *p == request));
    }

    #[test]
    fn ping_is_answered_and_replies_are_measured() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest, t0) = joined_pair(&network);
        // the host's next timer pings the guest; the guest echoes
        let later = t0 + Duration::from_secs(3);
        let _ = host.poll(later);
        let _ = guest.poll(later);
        let _ = host.poll(later + Duration::from_millis(25));

        let ping = host.lobby.hosted_game().unwrap().players[1].ping;
        assert_eq!(ping.samples(), 1);
        assert_eq!(ping.last_ms(), Some(25));
    }

    #[test]
    fn malformed_lobby_packet_is_reported_and_state_kept() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest) = host_and_guest(&network);
        network.inject(guest_addr(), host_addr(), &[0xFF, 42]);
        network.inject(guest_addr(), host_addr(), &[0x07]);
        let _ = host.poll(Instant::now());
        assert_eq!(host.lobby.state(), LobbyState::Hosting);
        assert_eq!(
            host.observer
                .violations_of_kind(ViolationKind::NetworkProtocol)
                .len(),
            2
        );
        let _ = guest.poll(Instant::now());
    }

    #[test]
    fn join_requires_listing_and_a_listed_game() {
        let network = MemoryNetwork::new();
        let mut guest = Node::new(&network, guest_addr(), "guest", GUEST_ID);
        assert!(guest.lobby.join_game(&mut guest.transport, HOST_ID).is_err());
        guest.lobby.start();
        assert!(guest.lobby.join_game(&mut guest.transport, HOST_ID).is_err());
        assert_eq!(guest.lobby.state(), LobbyState::Listing);
    }

    #[test]
    fn full_game_refuses_extra_players() {
        let network = MemoryNetwork::new();
        let (mut host, _guest, t0) = joined_pair(&network);
        for (i, id) in [(3u8, 0x3000u32), (4, 0x4000)] {
            let request = LobbyMessage::RequestJoin {
                game_id: HOST_ID,
                player_id: id,
                name: format!("p{i}"),
            };
            network.inject(addr(i, 5000), host_addr(), &request.encode());
        }
        let _ = host.poll(t0);
        let hosted = host.lobby.hosted_game().unwrap();
        assert_eq!(hosted.player_count(), 3);
        assert_eq!(hosted.slot_of(0x3000), Some(PlayerIndex::new(2)));
        assert_eq!(hosted.slot_of(0x4000), None);
    }

    #[test]
    fn stop_returns_to_none_and_goes_quiet() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest, t0) = joined_pair(&network);
        guest.lobby.stop(&mut guest.transport).unwrap();
        assert_eq!(guest.lobby.state(), LobbyState::None);
        let before = network.sent_log().len();
        assert_eq!(guest.poll(t0 + Duration::from_secs(10)), LobbyPoll::Idle);
        assert_eq!(network.sent_log().len(), before);
        let _ = host.poll(t0);
        assert_eq!(host.lobby.hosted_game().unwrap().player_count(), 1);
    }
}
