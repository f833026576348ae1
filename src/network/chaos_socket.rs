//! A configurable socket wrapper for network fault injection testing.
//!
//! [`ChaosSocket`] wraps any [`DatagramSocket`] implementation to simulate
//! packet loss, burst loss and duplication. The lockstep protocol must survive all
//! of them, so this is what the resilience tests run on.
//!
//! # Example
//!
//! ```rust,no_run
//! use fortress_lockstep::{ChaosConfig, ChaosSocket, UdpDatagramSocket};
//!
//! let config = ChaosConfig::builder()
//!     .packet_loss_rate(0.05)  // 5% packet loss
//!     .duplication_rate(0.01)
//!     .seed(42)  // Deterministic for testing
//!     .build();
//!
//! let inner = UdpDatagramSocket::bind_to_port(0).unwrap();
//! let socket = ChaosSocket::new(inner, config);
//! ```
//!
//! # Features
//!
//! - **Packet Loss**: Configurable drop rate for outgoing/incoming packets
//! - **Burst Loss**: Runs of consecutive dropped sends
//! - **Duplication**: Randomly duplicate outgoing packets
//! - **Deterministic**: Seeded RNG for reproducible test scenarios

use std::io;
use std::net::SocketAddrV4;

use web_time::Duration;

use crate::rng::{Pcg32, Rng, SeedableRng};
use crate::DatagramSocket;

/// Configuration for network chaos simulation.
///
/// Use [`ChaosConfig::builder()`] for a fluent configuration API.
/// All rates default to 0.0 (no effect).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChaosConfig {
    /// Probability of dropping a packet on send (0.0 - 1.0, default: 0.0)
    pub send_loss_rate: f64,

    /// Probability of dropping a packet on receive (0.0 - 1.0, default: 0.0)
    pub receive_loss_rate: f64,

    /// Probability of duplicating a packet on send (0.0 - 1.0, default: 0.0)
    pub duplication_rate: f64,

    /// Probability of starting a burst loss event (0.0 - 1.0, default: 0.0)
    /// When triggered, drops `burst_loss_length` consecutive sends
    pub burst_loss_probability: f64,

    /// Number of consecutive sends to drop during a burst loss event (default: 0)
    pub burst_loss_length: usize,

    /// Random seed for deterministic behavior (default: random)
    pub seed: Option<u64>,
}

impl ChaosConfig {
    /// Creates a new builder for fluent configuration.
    #[must_use]
    pub fn builder() -> ChaosConfigBuilder {
        ChaosConfigBuilder::new()
    }

    /// Creates a config with no chaos (passthrough mode).
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Creates a config simulating symmetric packet loss.
    #[must_use]
    pub fn lossy(loss_rate: f64) -> Self {
        let rate = loss_rate.clamp(0.0, 1.0);
        Self {
            send_loss_rate: rate,
            receive_loss_rate: rate,
            ..Default::default()
        }
    }

    /// Creates a config simulating a congested wireless link.
    #[must_use]
    pub fn flaky_wifi() -> Self {
        Self {
            send_loss_rate: 0.05,
            receive_loss_rate: 0.05,
            duplication_rate: 0.02,
            burst_loss_probability: 0.01,
            burst_loss_length: 4,
            seed: None,
        }
    }
}

/// Builder for [`ChaosConfig`].
#[derive(Debug, Clone, Default)]
pub struct ChaosConfigBuilder {
    config: ChaosConfig,
}

impl ChaosConfigBuilder {
    /// Creates a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets packet loss rate for both send and receive.
    #[must_use]
    pub fn packet_loss_rate(mut self, rate: f64) -> Self {
        self.config.send_loss_rate = rate.clamp(0.0, 1.0);
        self.config.receive_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets packet loss rate for sending only.
    #[must_use]
    pub fn send_loss_rate(mut self, rate: f64) -> Self {
        self.config.send_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets packet loss rate for receiving only.
    #[must_use]
    pub fn receive_loss_rate(mut self, rate: f64) -> Self {
        self.config.receive_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the packet duplication rate.
    #[must_use]
    pub fn duplication_rate(mut self, rate: f64) -> Self {
        self.config.duplication_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets burst loss parameters.
    ///
    /// When a burst is triggered (with `probability`), `length` consecutive
    /// sends will be dropped.
    #[must_use]
    pub fn burst_loss(mut self, probability: f64, length: usize) -> Self {
        self.config.burst_loss_probability = probability.clamp(0.0, 1.0);
        self.config.burst_loss_length = length;
        self
    }

    /// Sets the random seed for deterministic behavior.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ChaosConfig {
        self.config
    }
}

/// Statistics about chaos socket behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Total packets handed to the socket for sending
    pub packets_sent: u64,
    /// Packets dropped on send
    pub packets_dropped_send: u64,
    /// Packets duplicated on send
    pub packets_duplicated: u64,
    /// Packets delivered to the caller
    pub packets_received: u64,
    /// Packets dropped on receive
    pub packets_dropped_receive: u64,
    /// Number of burst loss events triggered
    pub burst_loss_events: u64,
    /// Packets dropped due to burst loss
    pub packets_dropped_burst: u64,
}

/// A socket wrapper that injects configurable network chaos.
///
/// Wraps any [`DatagramSocket`] implementation to simulate adverse
/// network conditions for testing purposes.
#[derive(Debug)]
pub struct ChaosSocket<S: DatagramSocket> {
    inner: S,
    config: ChaosConfig,
    rng: Pcg32,

    /// Remaining sends to drop in current burst loss event
    burst_loss_remaining: usize,

    /// Statistics tracking
    stats: ChaosStats,
}

impl<S: DatagramSocket> ChaosSocket<S> {
    /// Creates a new chaos socket wrapping the given inner socket.
    pub fn new(inner: S, config: ChaosConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => Pcg32::seed_from_u64(seed),
            None => Pcg32::from_entropy(),
        };

        Self {
            inner,
            config,
            rng,
            burst_loss_remaining: 0,
            stats: ChaosStats::default(),
        }
    }

    /// Returns a reference to the inner socket.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner socket.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes the chaos socket and returns the inner socket.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Returns the current chaos configuration.
    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Updates the chaos configuration.
    pub fn set_config(&mut self, config: ChaosConfig) {
        self.config = config;
    }

    /// Returns statistics about chaos behavior.
    pub fn stats(&self) -> ChaosStats {
        self.stats
    }

    /// Resets statistics counters.
    pub fn reset_stats(&mut self) {
        self.stats = ChaosStats::default();
    }

    fn roll(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            false
        } else if rate >= 1.0 {
            true
        } else {
            self.rng.gen::<f64>() < rate
        }
    }

    /// Returns true if this send falls inside a burst.
    fn should_drop_burst(&mut self) -> bool {
        if self.burst_loss_remaining > 0 {
            self.burst_loss_remaining -= 1;
            self.stats.packets_dropped_burst += 1;
            return true;
        }

        if self.config.burst_loss_length > 0 && self.roll(self.config.burst_loss_probability) {
            self.stats.burst_loss_events += 1;
            self.burst_loss_remaining = self.config.burst_loss_length.saturating_sub(1);
            self.stats.packets_dropped_burst += 1;
            return true;
        }

        false
    }
}

impl<S: DatagramSocket> DatagramSocket for ChaosSocket<S> {
    fn send_to(&mut self, payload: &[u8], addr: SocketAddrV4) -> io::Result<()> {
        self.stats.packets_sent += 1;

        // burst loss takes priority
        if self.should_drop_burst() {
            return Ok(());
        }

        if self.roll(self.config.send_loss_rate) {
            self.stats.packets_dropped_send += 1;
            return Ok(());
        }

        self.inner.send_to(payload, addr)?;

        if self.roll(self.config.duplication_rate) {
            self.stats.packets_duplicated += 1;
            self.inner.send_to(payload, addr)?;
        }
        Ok(())
    }

    fn recv_from(&mut self) -> io::Result<Option<(SocketAddrV4, Vec<u8>)>> {
        while let Some(datagram) = self.inner.recv_from()? {
            if self.roll(self.config.receive_loss_rate) {
                self.stats.packets_dropped_receive += 1;
                continue;
            }
            self.stats.packets_received += 1;
            return Ok(Some(datagram));
        }
        Ok(None)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        self.inner.wait_readable(timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddrV4> {
        self.inner.local_addr()
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
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn pair(config: ChaosConfig) -> (ChaosSocket<MemorySocket>, MemorySocket) {
        let network = MemoryNetwork::new();
        let sender = ChaosSocket::new(network.bind(addr(1)), config);
        (sender, network.bind(addr(2)))
    }

    fn drain(socket: &mut impl DatagramSocket) -> usize {
        let mut count = 0;
        while socket.recv_from().unwrap().is_some() {
            count += 1;
        }
        count
    }

    #[test]
    fn test_passthrough_mode() {
        let (mut sender, mut receiver) = pair(ChaosConfig::passthrough());
        sender.send_to(&[1, 2, 3], addr(2)).unwrap();
        let (source, payload) = receiver.recv_from().unwrap().unwrap();
        assert_eq!(source, addr(1));
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_packet_loss_100_percent() {
        let (mut sender, mut receiver) = pair(ChaosConfig::builder().send_loss_rate(1.0).build());
        for _ in 0..10 {
            sender.send_to(&[0], addr(2)).unwrap();
        }
        assert_eq!(drain(&mut receiver), 0);
        assert_eq!(sender.stats().packets_dropped_send, 10);
    }

    #[test]
    fn test_packet_loss_partial() {
        let config = ChaosConfig::builder().send_loss_rate(0.5).seed(42).build();
        let (mut sender, mut receiver) = pair(config);
        for _ in 0..200 {
            sender.send_to(&[0], addr(2)).unwrap();
        }
        let received = drain(&mut receiver);
        assert!(received > 50 && received < 150, "received {received}");
    }

    #[test]
    fn test_receive_loss() {
        let network = MemoryNetwork::new();
        let mut sender = network.bind(addr(1));
        let mut receiver = ChaosSocket::new(
            network.bind(addr(2)),
            ChaosConfig::builder().receive_loss_rate(1.0).build(),
        );
        for _ in 0..5 {
            sender.send_to(&[9], addr(2)).unwrap();
        }
        assert!(receiver.recv_from().unwrap().is_none());
        assert_eq!(receiver.stats().packets_dropped_receive, 5);
    }

    #[test]
    fn test_duplication() {
        let (mut sender, mut receiver) =
            pair(ChaosConfig::builder().duplication_rate(1.0).build());
        sender.send_to(&[4], addr(2)).unwrap();
        assert_eq!(drain(&mut receiver), 2);
        assert_eq!(sender.stats().packets_duplicated, 1);
    }

    #[test]
    fn test_burst_loss_drops_consecutive_packets() {
        let (mut sender, mut receiver) =
            pair(ChaosConfig::builder().burst_loss(1.0, 3).seed(1).build());
        for _ in 0..3 {
            sender.send_to(&[0], addr(2)).unwrap();
        }
        assert_eq!(drain(&mut receiver), 0);
        let stats = sender.stats();
        assert_eq!(stats.burst_loss_events, 1);
        assert_eq!(stats.packets_dropped_burst, 3);
    }

    #[test]
    fn test_deterministic_with_seed() {
        let run = || {
            let (mut sender, mut receiver) = pair(ChaosConfig {
                seed: Some(7),
                ..ChaosConfig::lossy(0.3)
            });
            for i in 0..50u8 {
                sender.send_to(&[i], addr(2)).unwrap();
            }
            let mut got = Vec::new();
            while let Some((_, payload)) = receiver.recv_from().unwrap() {
                got.push(payload[0]);
            }
            got
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_builder_clamps_rates() {
        let config = ChaosConfig::builder()
            .packet_loss_rate(1.5)
            .duplication_rate(-0.2)
            .build();
        assert!((config.send_loss_rate - 1.0).abs() < f64::EPSILON);
        assert!((config.receive_loss_rate - 1.0).abs() < f64::EPSILON);
        assert!(config.duplication_rate.abs() < f64::EPSILON);
    }

    #[test]
    fn test_reset_stats() {
        let (mut sender, _receiver) = pair(ChaosConfig::passthrough());
        sender.send_to(&[0], addr(2)).unwrap();
        assert_eq!(sender.stats().packets_sent, 1);
        sender.reset_stats();
        assert_eq!(sender.stats(), ChaosStats::default());
    }
}
