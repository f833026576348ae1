//! Common test infrastructure shared across integration tests.
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::{fast_builder, loopback_roster, PortAllocator};
//! ```

pub mod test_utils;

// Re-export commonly used items for convenience.
#[allow(unused_imports)]
pub use test_utils::{
    fast_builder, fast_handshake, fast_lockstep, init_tracing, localhost, loopback_roster,
    open_transport, run_frames, PortAllocator,
};
