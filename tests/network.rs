//! Network integration tests over real loopback UDP.
//!
//! - `loopback`: handshake and lockstep between real sockets
//! - `resilience`: the same flows through `ChaosSocket` (loss, duplication)
//! - `lobby`: discovery, join and match start end to end

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Network test modules
mod network {
    pub mod lobby;
    pub mod loopback;
    pub mod resilience;
}
