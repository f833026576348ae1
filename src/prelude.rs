//! Convenient re-exports for common usage.
//!
//! This module provides a "prelude" that re-exports the most commonly used types
//! from Fortress Lockstep, allowing you to import them all at once.
//!
//! # Usage
//!
//! ```rust
//! use fortress_lockstep::prelude::*;
//! ```
//!
//! # What's Included
//!
//! - **Lobby**: [`LobbyDiscovery`], [`LobbyState`], [`LobbyPoll`], [`GameList`]
//! - **Match setup**: [`MatchBuilder`], [`Roster`], [`GameParams`], [`MatchRules`]
//! - **Lockstep**: [`LockstepSession`], [`InputRecord`]
//! - **Transport**: [`TransportSession`], [`UdpDatagramSocket`], [`DatagramSocket`]
//! - **Fundamental types**: [`Frame`], [`PlayerIndex`], [`KEY_PRESS`], [`KEY_RELEASE`]
//! - **Notifications**: [`EventSink`], [`NetplayEvent`], [`AbortSignal`]
//! - **Error handling**: [`NetplayError`]
//! - **Configuration**: [`LockstepConfig`], [`HandshakeConfig`], [`LobbyConfig`]
//!
//! # Example
//!
//! ```rust,no_run
//! use fortress_lockstep::prelude::*;
//! use std::net::{Ipv4Addr, SocketAddrV4};
//!
//! # fn main() -> Result<(), NetplayError> {
//! let guest = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 50_000);
//! let roster = Roster::new(PlayerIndex::HOST)?.with_peer(PlayerIndex::new(1), guest)?;
//! let mut transport = TransportSession::open_hosting()?;
//! let mut session = MatchBuilder::new()
//!     .with_lockstep_config(LockstepConfig::lan())
//!     .host_match(&mut transport, roster, GameParams::default())?;
//! session.queue_input(KEY_PRESS, b'w');
//! session.advance_frame()?;
//! # Ok(())
//! # }
//! ```

// Lobby
pub use crate::lobby::snapshot::GameList;
pub use crate::lobby::{LobbyDiscovery, LobbyPoll, LobbyState};

// Match setup
pub use crate::sessions::builder::MatchBuilder;
pub use crate::sessions::game_start::{GameParams, MatchRules};
pub use crate::sessions::roster::Roster;

// Lockstep
pub use crate::frame_buffer::InputRecord;
pub use crate::sessions::lockstep::LockstepSession;

// Transport
pub use crate::network::transport::TransportSession;
pub use crate::network::udp_socket::UdpDatagramSocket;
pub use crate::DatagramSocket;

// Fundamental types and constants
pub use crate::{Frame, PlayerIndex, KEY_PRESS, KEY_RELEASE};

// Notifications
pub use crate::{AbortSignal, EventSink, NetplayEvent};

// Error handling
pub use crate::NetplayError;

// Configuration
pub use crate::sessions::config::{HandshakeConfig, LobbyConfig, LockstepConfig};
