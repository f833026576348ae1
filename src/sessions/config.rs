//! Configuration types for the lobby, the start handshake and the lockstep session.
//!
//! # Overview
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `LockstepConfig` | Per-frame barrier timing and input budget | `lan()`, `high_latency()` |
//! | `HandshakeConfig` | Start packet resend cadence | `with_timeout()` |
//! | `LobbyConfig` | Identity, refresh tick, discovery targets | `with_global_server()` |
//!
//! # Example
//!
//! ```
//! use fortress_lockstep::{HandshakeConfig, LockstepConfig, MatchBuilder};
//! use web_time::Duration;
//!
//! let builder = MatchBuilder::new()
//!     .with_lockstep_config(LockstepConfig::high_latency())
//!     .with_handshake_config(HandshakeConfig::with_timeout(Duration::from_secs(30)));
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use web_time::Duration;

use crate::network::messages::SYNC_HEADER_LEN;
use crate::rng::{Pcg32, SeedableRng};
use crate::{NetplayError, NETPLAY_PORT, PLAYER_NAME_LEN};

/// Largest input budget accepted by [`LockstepConfig::validate`]. Bigger packets are
/// likely to be fragmented.
const MAX_INPUT_BUDGET: usize = 4096;

/// Configuration for the per-frame lockstep barrier.
///
/// The longest a single frame can stall is roughly `wait_slice * retry_budget`.
///
/// # Forward Compatibility
///
/// New fields may be added to this struct in future versions. Always use the
/// `..LockstepConfig::default()` pattern when constructing instances.
///
/// # Example
///
/// ```
/// use fortress_lockstep::LockstepConfig;
/// use web_time::Duration;
///
/// let patient = LockstepConfig {
///     retry_budget: 200,
///     ..LockstepConfig::default()
/// };
/// assert_eq!(patient.wait_slice, Duration::from_millis(100));
/// assert!(patient.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "LockstepConfig has no effect unless passed to MatchBuilder::with_lockstep_config()"]
pub struct LockstepConfig {
    /// How long one poll waits before the current frame is resent to silent peers.
    ///
    /// Default: 100ms
    pub wait_slice: Duration,

    /// Number of empty wait slices tolerated before the frame fails.
    ///
    /// Default: 50
    pub retry_budget: u32,

    /// Byte budget of one outbound sync packet, header included. Input past it is
    /// dropped for the frame.
    ///
    /// Default: 512
    pub input_budget: usize,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            wait_slice: Duration::from_millis(100),
            retry_budget: 50,
            input_budget: 512,
        }
    }
}

impl LockstepConfig {
    /// Creates a new `LockstepConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast resends for a local network: 30ms slices, same 5-second stall limit.
    pub fn lan() -> Self {
        Self {
            wait_slice: Duration::from_millis(30),
            retry_budget: 166,
            ..Self::default()
        }
    }

    /// Slow resends and a longer stall limit for high-RTT links.
    pub fn high_latency() -> Self {
        Self {
            wait_slice: Duration::from_millis(250),
            retry_budget: 60,
            ..Self::default()
        }
    }

    /// Upper bound on how long one frame may stall: every tolerated empty slice plus
    /// the one that fails the frame.
    #[must_use]
    pub fn max_stall(&self) -> Duration {
        self.wait_slice
            .saturating_mul(self.retry_budget.saturating_add(1))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if any value is out of range.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.wait_slice < Duration::from_millis(1) || self.wait_slice > Duration::from_secs(10)
        {
            return Err(NetplayError::invalid(format!(
                "wait_slice must be between 1ms and 10000ms, got {}ms",
                self.wait_slice.as_millis()
            )));
        }
        if self.retry_budget == 0 {
            return Err(NetplayError::invalid("retry_budget must be at least 1"));
        }
        if self.input_budget < SYNC_HEADER_LEN + 2 || self.input_budget > MAX_INPUT_BUDGET {
            return Err(NetplayError::invalid(format!(
                "input_budget must be between {} and {} bytes, got {}",
                SYNC_HEADER_LEN + 2,
                MAX_INPUT_BUDGET,
                self.input_budget
            )));
        }
        Ok(())
    }
}

/// Configuration for the one-shot game-start handshake.
///
/// The host resends its start packet every `resend_interval` until every peer acked,
/// forever unless `timeout` is set. The abort signal is checked every `poll_slice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "HandshakeConfig has no effect unless passed to MatchBuilder::with_handshake_config()"]
pub struct HandshakeConfig {
    /// Length of one wait.
    ///
    /// Default: 1s
    pub poll_slice: Duration,

    /// Interval between host resends of the start packet.
    ///
    /// Default: 3s
    pub resend_interval: Duration,

    /// Overall limit, after which the handshake fails with
    /// [`NetplayError::HandshakeTimeout`].
    ///
    /// Default: `None` (wait until cancelled)
    pub timeout: Option<Duration>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            poll_slice: Duration::from_secs(1),
            resend_interval: Duration::from_secs(3),
            timeout: None,
        }
    }
}

impl HandshakeConfig {
    /// Default cadence with an overall timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if a duration is zero or the poll slice
    /// exceeds the resend interval.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.poll_slice.is_zero() || self.resend_interval.is_zero() {
            return Err(NetplayError::invalid(
                "handshake poll_slice and resend_interval must be non-zero",
            ));
        }
        if self.poll_slice > self.resend_interval {
            return Err(NetplayError::invalid(format!(
                "poll_slice ({}ms) must not exceed resend_interval ({}ms)",
                self.poll_slice.as_millis(),
                self.resend_interval.as_millis()
            )));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(NetplayError::invalid("handshake timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Configuration for [`LobbyDiscovery`](crate::LobbyDiscovery).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LobbyConfig {
    /// Display name, truncated to 16 bytes on the wire.
    pub player_name: String,

    /// Nonzero id identifying this participant in every snapshot. Also used as the
    /// game id when hosting.
    pub unique_id: u32,

    /// Period of the lobby timer.
    ///
    /// Default: 3s
    pub refresh_interval: Duration,

    /// Where local discovery requests are broadcast. `None` disables local discovery.
    ///
    /// Default: `255.255.255.255:44046`
    pub local_discovery: Option<SocketAddrV4>,

    /// The global discovery server. `None` keeps the lobby local only.
    ///
    /// Default: `None`
    pub global_server: Option<SocketAddrV4>,

    /// Death-match frag count advertised when hosting, 0 for a regular game.
    ///
    /// Default: 0
    pub death_match: u8,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self::new("player")
    }
}

impl LobbyConfig {
    /// Creates a config with a fresh random unique id.
    #[must_use]
    pub fn new(player_name: impl Into<String>) -> Self {
        Self {
            player_name: player_name.into(),
            unique_id: Pcg32::from_entropy().next_nonzero_u32(),
            refresh_interval: Duration::from_secs(3),
            local_discovery: Some(SocketAddrV4::new(Ipv4Addr::BROADCAST, NETPLAY_PORT)),
            global_server: None,
            death_match: 0,
        }
    }

    /// Sets the unique id.
    #[must_use]
    pub fn with_unique_id(mut self, unique_id: u32) -> Self {
        self.unique_id = unique_id;
        self
    }

    /// Resolves `host` and opts into the global discovery server at `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if `host` does not resolve to an IPv4
    /// address.
    pub fn with_global_server(mut self, host: &str, port: u16) -> Result<Self, NetplayError> {
        let resolved = (host, port)
            .to_socket_addrs()
            .map_err(|err| NetplayError::invalid(format!("cannot resolve {host}: {err}")))?
            .find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| NetplayError::invalid(format!("{host} has no IPv4 address")))?;
        self.global_server = Some(resolved);
        Ok(self)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] for a zero unique id, a zero refresh
    /// interval, or a name longer than 16 bytes.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.unique_id == 0 {
            return Err(NetplayError::invalid(
                "unique_id 0 is reserved for empty player slots",
            ));
        }
        if self.refresh_interval.is_zero() {
            return Err(NetplayError::invalid("refresh_interval must be non-zero"));
        }
        if self.player_name.len() > PLAYER_NAME_LEN {
            return Err(NetplayError::invalid(format!(
                "player_name is {} bytes, at most {} fit on the wire",
                self.player_name.len(),
                PLAYER_NAME_LEN
            )));
        }
        Ok(())
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

    #[test]
    fn test_lockstep_defaults() {
        let config = LockstepConfig::default();
        assert_eq!(config.wait_slice, Duration::from_millis(100));
        assert_eq!(config.retry_budget, 50);
        assert_eq!(config.input_budget, 512);
        assert_eq!(config.max_stall(), Duration::from_millis(5_100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lockstep_presets_are_valid() {
        for preset in [
            LockstepConfig::new(),
            LockstepConfig::lan(),
            LockstepConfig::high_latency(),
        ] {
            assert!(preset.validate().is_ok(), "{preset:?}");
        }
        assert!(LockstepConfig::lan().wait_slice < LockstepConfig::default().wait_slice);
        assert!(LockstepConfig::high_latency().max_stall() > LockstepConfig::default().max_stall());
    }

    #[test]
    fn test_lockstep_validate_rejects_out_of_range() {
        let zero_budget = LockstepConfig {
            retry_budget: 0,
            ..LockstepConfig::default()
        };
        assert!(zero_budget.validate().is_err());

        let tiny_input = LockstepConfig {
            input_budget: SYNC_HEADER_LEN,
            ..LockstepConfig::default()
        };
        assert!(tiny_input.validate().is_err());

        let zero_slice = LockstepConfig {
            wait_slice: Duration::ZERO,
            ..LockstepConfig::default()
        };
        assert!(zero_slice.validate().is_err());
    }

    #[test]
    fn test_handshake_defaults_and_validation() {
        let config = HandshakeConfig::default();
        assert_eq!(config.poll_slice, Duration::from_secs(1));
        assert_eq!(config.resend_interval, Duration::from_secs(3));
        assert_eq!(config.timeout, None);
        assert!(config.validate().is_ok());

        let inverted = HandshakeConfig {
            poll_slice: Duration::from_secs(5),
            ..HandshakeConfig::default()
        };
        assert!(inverted.validate().is_err());
        assert!(HandshakeConfig::with_timeout(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_lobby_config_defaults() {
        let config = LobbyConfig::new("ana");
        assert_ne!(config.unique_id, 0);
        assert_eq!(config.refresh_interval, Duration::from_secs(3));
        assert_eq!(
            config.local_discovery,
            Some(SocketAddrV4::new(Ipv4Addr::BROADCAST, NETPLAY_PORT))
        );
        assert_eq!(config.global_server, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lobby_config_validation() {
        assert!(LobbyConfig::new("x").with_unique_id(0).validate().is_err());
        assert!(LobbyConfig::new("a name that is far too long")
            .validate()
            .is_err());
    }

    #[test]
    #[cfg(not(miri))]
    fn test_global_server_resolves_ipv4_literal() {
        let config = LobbyConfig::new("ana")
            .with_global_server("127.0.0.1", 44047)
            .unwrap();
        assert_eq!(
            config.global_server,
            Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 44047))
        );
    }
}
