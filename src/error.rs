//! The error type returned by every fallible protocol operation.
//!
//! ```
//! use fortress_lockstep::NetplayError;
//!
//! let err = NetplayError::Cancelled;
//! assert!(err.is_cancellation());
//! assert_eq!(err.to_string(), "Cancelled by the local player");
//! ```

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::net::SocketAddrV4;

use crate::{Frame, PlayerIndex};

/// This enum contains all error messages this library can return. Every blocking protocol
/// function returns a [`Result<_, NetplayError>`].
///
/// Malformed packets never surface here; they are dropped and reported through
/// [`telemetry`](crate::telemetry) instead. A seed disagreement is corrected in place
/// and is not an error either.
///
/// [`Result<_, NetplayError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetplayError {
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// Creating, binding, sending on or reading from the UDP endpoint failed.
    /// The session cannot continue.
    SocketError {
        /// A description of the socket error.
        context: String,
    },
    /// The retry budget ran out before every peer acknowledged the frame.
    FrameTimeout {
        /// The frame that could not be completed.
        frame: Frame,
        /// Peers that never acknowledged it.
        missing: Vec<PlayerIndex>,
    },
    /// A second peer claimed a slot it does not own during the start handshake.
    HandshakeConflict {
        /// The slot the peer claimed.
        claimed: PlayerIndex,
        /// Where the claim came from.
        from: SocketAddrV4,
    },
    /// The optional overall handshake timeout expired.
    HandshakeTimeout {
        /// Milliseconds spent waiting.
        elapsed_ms: u128,
    },
    /// The local abort signal fired. This is a clean abort, not a fault.
    Cancelled,
}

impl NetplayError {
    /// Returns `true` when the error is a user cancellation rather than a failure.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn socket(action: &str, err: &std::io::Error) -> Self {
        Self::SocketError {
            context: format!("{action}: {err}"),
        }
    }

    pub(crate) fn invalid(info: impl Into<String>) -> Self {
        Self::InvalidRequest { info: info.into() }
    }
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            },
            NetplayError::SocketError { context } => {
                write!(f, "Socket error: {}", context)
            },
            NetplayError::FrameTimeout { frame, missing } => {
                let missing: Vec<String> = missing.iter().map(ToString::to_string).collect();
                write!(
                    f,
                    "Frame {} timed out waiting for player(s) {}",
                    frame,
                    missing.join(", ")
                )
            },
            NetplayError::HandshakeConflict { claimed, from } => {
                if claimed.is_host() {
                    write!(
                        f,
                        "Two peers claim to be the host: {} also claims player slot 0",
                        from
                    )
                } else {
                    write!(
                        f,
                        "Peer {} claims player slot {} which belongs to another address",
                        from, claimed
                    )
                }
            },
            NetplayError::HandshakeTimeout { elapsed_ms } => {
                write!(f, "Game start handshake timed out after {} ms", elapsed_ms)
            },
            NetplayError::Cancelled => {
                write!(f, "Cancelled by the local player")
            },
        }
    }
}

impl Error for NetplayError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn duplicate_host_claim_names_the_conflict() {
        let err = NetplayError::HandshakeConflict {
            claimed: PlayerIndex::HOST,
            from: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5000),
        };
        let text = err.to_string();
        assert!(text.contains("host"));
        assert!(text.contains("127.0.0.1:5000"));
    }

    #[test]
    fn frame_timeout_lists_missing_players() {
        let err = NetplayError::FrameTimeout {
            frame: Frame::new(12),
            missing: vec![PlayerIndex::new(1), PlayerIndex::new(2)],
        };
        assert_eq!(
            err.to_string(),
            "Frame 12 timed out waiting for player(s) 1, 2"
        );
    }

    #[test]
    fn only_cancelled_is_a_cancellation() {
        assert!(NetplayError::Cancelled.is_cancellation());
        assert!(!NetplayError::HandshakeTimeout { elapsed_ms: 1 }.is_cancellation());
        assert!(!NetplayError::invalid("x").is_cancellation());
    }

    #[test]
    fn socket_error_keeps_io_context() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = NetplayError::socket("bind 0.0.0.0:44046", &io);
        assert_eq!(err.to_string(), "Socket error: bind 0.0.0.0:44046: in use");
    }
}
