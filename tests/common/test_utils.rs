//! Shared test utilities for integration tests.
//!
//! # Port Allocation
//!
//! Every test binds real loopback sockets, so ports come from `PortAllocator` to
//! prevent conflicts between test binaries running in parallel:
//!
//! ```ignore
//! use common::test_utils::PortAllocator;
//!
//! let [host, guest] = PortAllocator::next_ports::<2>();
//! ```

#![allow(
    clippy::unwrap_used,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc
)]

use fortress_lockstep::{
    DatagramSocket, HandshakeConfig, LockstepConfig, LockstepSession, MatchBuilder, PlayerIndex,
    Roster, TransportSession,
};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use web_time::Duration;

// ============================================================================
// Port Allocation System
// ============================================================================

/// Starting port for the atomic port allocator.
///
/// Kept below the OS ephemeral range and away from the crate's well-known ports.
#[allow(dead_code)]
const PORT_ALLOCATOR_START: u16 = 30000;

/// Ports reserved per test process.
#[allow(dead_code)]
const PORTS_PER_PROCESS: u16 = 20;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);

static PORT_COUNTER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Thread-safe port allocator for integration tests.
///
/// Each test binary gets its own range, offset by the process id.
pub struct PortAllocator;

impl PortAllocator {
    #[allow(dead_code)]
    fn initialize_counter() {
        if PORT_COUNTER_INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let pid = std::process::id();
            let max_offsets = (44000 - PORT_ALLOCATOR_START) / PORTS_PER_PROCESS;
            let offset_index = (pid % u32::from(max_offsets)) as u16;
            let start_port = PORT_ALLOCATOR_START + (offset_index * PORTS_PER_PROCESS);
            PORT_COUNTER.store(start_port, Ordering::SeqCst);
        }
    }

    /// Allocates the next available port.
    ///
    /// # Panics
    ///
    /// Panics if the allocator runs into the crate's well-known ports.
    #[allow(dead_code)]
    #[must_use]
    pub fn next_port() -> u16 {
        Self::initialize_counter();
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        assert!(
            port < 44000,
            "Port allocator exhausted. This indicates a test suite issue."
        );
        port
    }

    /// Allocates N ports.
    #[allow(dead_code)]
    #[must_use]
    pub fn next_ports<const N: usize>() -> [u16; N] {
        let mut ports = [0u16; N];
        for port in &mut ports {
            *port = Self::next_port();
        }
        ports
    }
}

// ============================================================================
// Common Helpers
// ============================================================================

/// Address of `port` on the loopback interface.
#[allow(dead_code)]
#[must_use]
pub fn localhost(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

/// Lockstep timing for loopback tests: short slices, generous budget.
#[allow(dead_code)]
pub fn fast_lockstep() -> LockstepConfig {
    LockstepConfig {
        wait_slice: Duration::from_millis(10),
        retry_budget: 500,
        ..LockstepConfig::default()
    }
}

/// Handshake timing for loopback tests, bounded so a broken test fails instead of hanging.
#[allow(dead_code)]
pub fn fast_handshake() -> HandshakeConfig {
    HandshakeConfig {
        poll_slice: Duration::from_millis(10),
        resend_interval: Duration::from_millis(50),
        timeout: Some(Duration::from_secs(10)),
    }
}

/// A builder with both fast configs.
#[allow(dead_code)]
pub fn fast_builder() -> MatchBuilder {
    MatchBuilder::new()
        .with_lockstep_config(fast_lockstep())
        .with_handshake_config(fast_handshake())
}

/// A roster for `local` among `ports`, where `ports[i]` is slot `i`.
///
/// # Panics
///
/// Panics if the roster is invalid.
#[allow(dead_code)]
#[must_use]
pub fn loopback_roster(local: usize, ports: &[u16]) -> Roster {
    let mut roster = Roster::new(PlayerIndex::new(local)).unwrap();
    for (index, port) in ports.iter().enumerate() {
        if index != local {
            roster
                .set_peer(PlayerIndex::new(index), localhost(*port))
                .unwrap();
        }
    }
    roster
}

/// Runs `frames` barriers, queueing one keypress per frame, and returns every
/// player's delivered input per frame.
///
/// # Panics
///
/// Panics if any barrier fails.
#[allow(dead_code)]
pub fn run_frames<S: DatagramSocket>(
    session: &mut LockstepSession<'_, S>,
    frames: u32,
) -> Vec<Vec<Vec<fortress_lockstep::InputRecord>>> {
    let local = session.local_player().as_usize() as u8;
    let mut delivered = Vec::new();
    for frame in 0..frames {
        session.queue_input(fortress_lockstep::KEY_PRESS, (frame as u8).wrapping_add(local));
        session.advance_frame().unwrap();
        delivered.push(
            PlayerIndex::all()
                .map(|player| session.take_sync_buf(player))
                .collect(),
        );
    }
    delivered
}

/// Opens a transport on `port` over real UDP.
///
/// # Panics
///
/// Panics if the port is taken.
#[allow(dead_code)]
#[must_use]
pub fn open_transport(port: u16) -> TransportSession {
    TransportSession::open(port).unwrap()
}

/// Installs a test-friendly tracing subscriber once per binary.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
