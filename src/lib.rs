//! # Fortress Lockstep
//!
//! Fortress Lockstep keeps a small, fixed group of deterministic simulations in agreement
//! over plain UDP. Every simulation tick is a barrier: no peer advances past frame `N`
//! until every peer has seen everyone's input for frame `N`.
//!
//! The crate covers the whole netplay flow:
//!
//! 1. [`LobbyDiscovery`] advertises, lists and joins games, locally by broadcast and
//!    globally through a discovery server ([`DiscoveryServer`]).
//! 2. The game-start handshake ([`GameStartCoordinator`]) agrees on match parameters and
//!    the shared random seed.
//! 3. [`LockstepSession`] exchanges input every frame, retransmits on loss, and keeps the
//!    shared generator consistent with the host.
//!
//! All blocking calls are bounded waits that poll an [`AbortSignal`], and every
//! protocol function reports failure through [`NetplayError`].

#![forbid(unsafe_code)] // let us try
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use web_time::Duration;

pub use error::NetplayError;
pub use frame_buffer::{InputRecord, OutboundFrameBuffer};
pub use lobby::server::{DiscoveryServer, DiscoveryServerConfig};
pub use lobby::snapshot::{DiscoveredGame, GameInfoPlayer, GameInfoSnapshot, GameList, PingStats};
pub use lobby::{LobbyDiscovery, LobbyPoll, LobbyState};
pub use network::chaos_socket::{ChaosConfig, ChaosConfigBuilder, ChaosSocket, ChaosStats};
pub use network::codec::{CodecError, PacketReader, PacketWriter};
pub use network::messages::{
    LobbyCommand, LobbyMessage, Message, MessageKind, StartPacket, SyncPacket,
};
pub use network::transport::{Channel, Datagram, TransportSession};
pub use network::udp_socket::UdpDatagramSocket;
pub use sessions::builder::MatchBuilder;
pub use sessions::config::{HandshakeConfig, LobbyConfig, LockstepConfig};
pub use sessions::event_sink::{CollectingSink, TracingSink};
pub use sessions::game_start::{GameParams, GameStartCoordinator, MatchRules, MatchSetup};
pub use sessions::lockstep::{LockstepSession, LockstepStats};
pub use sessions::roster::{PlayerSlot, Roster};

pub mod error;
pub mod frame_buffer;
pub mod lobby;
pub mod prelude;
/// Internal random number generator module based on PCG32, plus the shared
/// simulation generator.
///
/// See the module documentation for usage details.
pub mod rng;
pub mod telemetry;
#[cfg(test)]
pub(crate) mod test_config;
pub mod sessions {
    //! Match setup and the per-frame lockstep session.
    pub mod builder;
    pub mod config;
    pub mod event_sink;
    pub mod game_start;
    pub mod lockstep;
    pub mod roster;
}
pub mod network {
    //! Datagram sockets, the packet codec and the channel-aware transport.
    pub mod chaos_socket;
    /// Big-endian packet codec shared by every message family.
    pub mod codec;
    #[cfg(test)]
    pub(crate) mod memory_socket;
    pub mod messages;
    pub mod transport;
    pub mod udp_socket;
}

// #############
// # CONSTANTS #
// #############

/// Maximum number of participants in a match, host included.
pub const MAX_PLAYERS: usize = 3;

/// Well-known UDP port a hosting peer binds, and the port local discovery broadcasts target.
pub const NETPLAY_PORT: u16 = 0xAC0E;

/// Default port of the global discovery server.
pub const DISCOVERY_PORT: u16 = NETPLAY_PORT + 1;

/// Conventional input op for a key going down.
pub const KEY_PRESS: u8 = 0x01;

/// Conventional input op for a key going up.
pub const KEY_RELEASE: u8 = 0x02;

/// Fixed width of a player name on the wire, NUL padded.
pub const PLAYER_NAME_LEN: usize = 16;

/// A frame is a single tick of the lockstep simulation.
///
/// Frames start at 0 and advance by one each time every peer has acknowledged
/// the current frame.
///
/// # Examples
///
/// ```
/// use fortress_lockstep::Frame;
///
/// let frame = Frame::new(0);
/// assert_eq!(frame.next().as_u32(), 1);
/// assert_eq!(frame.prev(), None);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Frame(u32);

impl Frame {
    /// The first frame of every match.
    pub const ZERO: Frame = Frame(0);

    /// Creates a new `Frame` from a `u32` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: u32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `u32` value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the following frame. Wraps at `u32::MAX` like the wire field does.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Frame {
        Frame(self.0.wrapping_add(1))
    }

    /// Returns the preceding frame, or `None` at frame 0.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Option<Frame> {
        match self.0.checked_sub(1) {
            Some(f) => Some(Frame(f)),
            None => None,
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Frame {
    #[inline]
    fn from(value: u32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for u32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// Position of a participant in a match, in `[0, MAX_PLAYERS)`. Index 0 is the host.
///
/// # Examples
///
/// ```
/// use fortress_lockstep::PlayerIndex;
///
/// assert!(PlayerIndex::HOST.is_host());
/// assert!(PlayerIndex::new(2).is_valid());
/// assert!(!PlayerIndex::new(3).is_valid());
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct PlayerIndex(usize);

impl PlayerIndex {
    /// The authoritative participant.
    pub const HOST: PlayerIndex = PlayerIndex(0);

    /// Creates a new `PlayerIndex`. Does not validate the range; see [`is_valid`](Self::is_valid).
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        PlayerIndex(index)
    }

    /// Returns the underlying `usize` value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` for the host slot.
    #[inline]
    #[must_use]
    pub const fn is_host(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the index is below [`MAX_PLAYERS`].
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 < MAX_PLAYERS
    }

    /// Iterates over every valid index in order.
    pub fn all() -> impl Iterator<Item = PlayerIndex> {
        (0..MAX_PLAYERS).map(PlayerIndex)
    }
}

impl std::fmt::Display for PlayerIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for PlayerIndex {
    #[inline]
    fn from(value: usize) -> Self {
        PlayerIndex(value)
    }
}

impl From<PlayerIndex> for usize {
    #[inline]
    fn from(index: PlayerIndex) -> Self {
        index.0
    }
}

// #############
// #   ENUMS   #
// #############

/// Notifications for the UI layer. Delivered through an [`EventSink`].
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]` because new event types may be
/// added in future versions. Always include a wildcard arm when matching.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetplayEvent {
    /// The lobby moved between states.
    LobbyStateChanged {
        /// Previous state.
        from: LobbyState,
        /// New state.
        to: LobbyState,
    },
    /// The list of discovered games changed (new entry or in-place update).
    GameListUpdated {
        /// Number of games currently listed.
        games: usize,
    },
    /// Our unique id appeared in the joined game's snapshot.
    Joined {
        /// The joined game.
        game_id: u32,
        /// Our slot in that game.
        player: PlayerIndex,
    },
    /// Our unique id disappeared from the joined game's snapshot.
    Kicked {
        /// The game we were removed from.
        game_id: u32,
    },
    /// Another player appeared in the hosted or joined game.
    PlayerJoined {
        /// Unique id of the player.
        player_id: u32,
    },
    /// Another player left the hosted or joined game.
    PlayerLeft {
        /// Unique id of the player.
        player_id: u32,
    },
    /// A host withdrew its game.
    GameRemoved {
        /// The withdrawn game.
        game_id: u32,
    },
    /// The start handshake completed.
    MatchStarted {
        /// The agreed initial seed.
        seed: u32,
        /// Our slot in the match.
        local: PlayerIndex,
        /// Number of present participants, local included.
        players: usize,
    },
    /// The match ended with an error or a local cancellation.
    MatchAborted {
        /// The frame being synchronized, if lockstep had started.
        frame: Option<Frame>,
        /// Human-readable cause.
        reason: String,
    },
}

// #############
// #  TRAITS   #
// #############

/// An unreliable, unordered datagram endpoint over IPv4.
///
/// [`UdpDatagramSocket`] is the production implementation and [`ChaosSocket`] wraps
/// any implementation to inject loss. Implement this trait to run the protocol over
/// your own transport.
pub trait DatagramSocket {
    /// Sends one datagram. Delivery is not guaranteed.
    ///
    /// # Errors
    /// Returns the underlying I/O error if the datagram could not be handed to the network.
    fn send_to(&mut self, payload: &[u8], addr: SocketAddrV4) -> std::io::Result<()>;

    /// Returns the next received datagram without blocking, or `None` if nothing is queued.
    ///
    /// # Errors
    /// Returns the underlying I/O error for failures other than "nothing to read".
    fn recv_from(&mut self) -> std::io::Result<Option<(SocketAddrV4, Vec<u8>)>>;

    /// Blocks up to `timeout` until a datagram is readable. Returns `false` on timeout.
    ///
    /// # Errors
    /// Returns the underlying I/O error for failures other than a timeout.
    fn wait_readable(&mut self, timeout: Duration) -> std::io::Result<bool>;

    /// The address this endpoint is bound to.
    ///
    /// # Errors
    /// Returns the underlying I/O error if the address cannot be queried.
    fn local_addr(&self) -> std::io::Result<SocketAddrV4>;
}

/// Receives UI notifications. Shared as `Arc<dyn EventSink>`.
pub trait EventSink: Send + Sync {
    /// Called once per event, from the thread driving the protocol.
    fn on_event(&self, event: &NetplayEvent);
}

/// The local abort input checked inside every wait loop.
pub trait AbortSignal: Send + Sync {
    /// Returns `true` once the user asked to leave the match.
    fn abort_requested(&self) -> bool;
}

impl AbortSignal for AtomicBool {
    fn abort_requested(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

impl<T: AbortSignal + ?Sized> AbortSignal for Arc<T> {
    fn abort_requested(&self) -> bool {
        (**self).abort_requested()
    }
}

/// An [`AbortSignal`] that never fires.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NeverAbort;

impl AbortSignal for NeverAbort {
    fn abort_requested(&self) -> bool {
        false
    }
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_next_and_prev() {
        let frame = Frame::new(7);
        assert_eq!(frame.next(), Frame::new(8));
        assert_eq!(frame.prev(), Some(Frame::new(6)));
        assert_eq!(Frame::ZERO.prev(), None);
    }

    #[test]
    fn frame_next_wraps_like_the_wire_field() {
        assert_eq!(Frame::new(u32::MAX).next(), Frame::ZERO);
    }

    #[test]
    fn frame_display_and_conversions() {
        let frame = Frame::from(42u32);
        assert_eq!(frame.to_string(), "42");
        assert_eq!(u32::from(frame), 42);
    }

    #[test]
    fn player_index_host_and_range() {
        assert!(PlayerIndex::HOST.is_host());
        assert!(!PlayerIndex::new(1).is_host());
        assert!(PlayerIndex::new(MAX_PLAYERS - 1).is_valid());
        assert!(!PlayerIndex::new(MAX_PLAYERS).is_valid());
        assert_eq!(PlayerIndex::all().count(), MAX_PLAYERS);
    }

    #[test]
    fn atomic_bool_is_an_abort_signal() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!flag.abort_requested());
        flag.store(true, Ordering::Relaxed);
        assert!(flag.abort_requested());
        assert!(!NeverAbort.abort_requested());
    }

    #[test]
    fn discovery_port_differs_from_netplay_port() {
        assert_ne!(DISCOVERY_PORT, NETPLAY_PORT);
        assert_eq!(NETPLAY_PORT, 44046);
    }

    #[test]
    fn frame_serializes_as_plain_number() {
        let json = serde_json::to_string(&Frame::new(5)).unwrap();
        assert_eq!(json, "5");
    }
}
