//! Random number generators.
//!
//! Two generators live here, for two different jobs:
//!
//! - [`Pcg32`] is the general-purpose generator for values that must differ between
//!   processes: lobby unique ids, game ids, initial match seeds and fault injection
//!   in [`ChaosSocket`](crate::ChaosSocket).
//! - [`SyncRng`] is the shared simulation generator. Its whole state is one `u32`, which
//!   is exactly the seed every sync packet carries, so any peer can be re-seeded to the
//!   host's state from a single field.
//!
//! # PCG32 Algorithm
//!
//! PCG-XSH-RR with 64 bits of state and 32-bit output, period 2^64.
//!
//! Reference: <https://www.pcg-random.org/>
//!
//! # Usage
//!
//! ```rust
//! use fortress_lockstep::rng::{Pcg32, Rng, SeedableRng, SyncRng};
//!
//! let mut rng = Pcg32::seed_from_u64(12345);
//! let value = rng.gen_range(0..100);
//! assert!(value < 100);
//!
//! let mut shared = SyncRng::new(7);
//! let before = shared.seed();
//! let _ = shared.next_u32();
//! assert_ne!(shared.seed(), before);
//! ```

use crate::{
    report_violation,
    telemetry::{ViolationKind, ViolationSeverity},
};

/// PCG32 random number generator.
///
/// A minimal implementation of the PCG-XSH-RR variant with 64-bit state.
/// Suitable for ids and testing, but NOT cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

/// Default increment for single-stream PCG32.
const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;

/// Multiplier constant for the LCG step.
const PCG_MULTIPLIER: u64 = 6364136223846793005;

impl Pcg32 {
    /// Creates a new PCG32 generator with the given state and stream.
    ///
    /// The stream selects one of 2^63 independent sequences.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        // The increment must be odd
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Generates the next 32-bit random value.
    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        // XSH-RR output permutation
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Generates the next 64-bit random value by combining two 32-bit values.
    #[inline]
    #[must_use]
    pub fn next_u64(&mut self) -> u64 {
        let high = u64::from(self.next_u32());
        let low = u64::from(self.next_u32());
        (high << 32) | low
    }

    /// Returns a random non-zero `u32`. Lobby ids use 0 as "empty slot".
    #[must_use]
    pub fn next_nonzero_u32(&mut self) -> u32 {
        loop {
            let value = self.next_u32();
            if value != 0 {
                return value;
            }
        }
    }
}

/// Trait for seeding random number generators.
pub trait SeedableRng: Sized {
    /// Creates a new RNG seeded from a 64-bit value.
    #[must_use]
    fn seed_from_u64(seed: u64) -> Self;

    /// Creates a new RNG with a seed that differs between processes and calls.
    ///
    /// NOT cryptographically secure.
    #[must_use]
    fn from_entropy() -> Self;
}

impl SeedableRng for Pcg32 {
    fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }

    fn from_entropy() -> Self {
        Self::seed_from_u64(entropy_seed())
    }
}

/// Trait for random number generation.
pub trait Rng {
    /// Returns the next 32-bit random value.
    fn next_u32(&mut self) -> u32;

    /// Returns the next 64-bit random value.
    fn next_u64(&mut self) -> u64 {
        let high = u64::from(self.next_u32());
        let low = u64::from(self.next_u32());
        (high << 32) | low
    }

    /// Generates a random value of type `T`.
    fn gen<T: RandomValue>(&mut self) -> T {
        T::random(self)
    }

    /// Generates a random `u32` value in the given range `[low, high)`.
    ///
    /// # Empty Range Behavior
    /// If `range.is_empty()`, reports a violation via telemetry and returns `range.start`.
    fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if span == 0 || range.end < range.start {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_range called with empty range [{}..{})",
                range.start,
                range.end
            );
            return range.start;
        }

        // Rejection sampling to avoid modulo bias
        let threshold = span.wrapping_neg() % span;
        loop {
            let random_value = self.next_u32();
            if random_value >= threshold {
                return range.start.wrapping_add(random_value % span);
            }
        }
    }

    /// Generates a random `usize` value in the given range `[low, high)`.
    ///
    /// Only ranges narrower than `u32::MAX` are supported, which covers every
    /// buffer index this crate draws.
    fn gen_range_usize(&mut self, range: std::ops::Range<usize>) -> usize {
        let span = range.end.saturating_sub(range.start);
        if span == 0 || span > u32::MAX as usize {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_range_usize called with unsupported range [{}..{})",
                range.start,
                range.end
            );
            return range.start;
        }
        range.start + self.gen_range(0..span as u32) as usize
    }

    /// Generates a random boolean with the given probability of being `true`.
    ///
    /// Values outside `[0.0, 1.0]` are clamped.
    fn gen_bool(&mut self, probability: f64) -> bool {
        let p = probability.clamp(0.0, 1.0);
        if p >= 1.0 {
            return true;
        }
        let threshold = (p * f64::from(u32::MAX)) as u32;
        self.next_u32() < threshold
    }

    /// Fills the given slice with random bytes.
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut chunks = dest.chunks_exact_mut(4);
        for chunk in chunks.by_ref() {
            chunk.copy_from_slice(&self.next_u32().to_le_bytes());
        }
        let remainder = chunks.into_remainder();
        if !remainder.is_empty() {
            let val = self.next_u32().to_le_bytes();
            if let Some(val_slice) = val.get(..remainder.len()) {
                remainder.copy_from_slice(val_slice);
            }
        }
    }
}

impl Rng for Pcg32 {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        Self::next_u32(self)
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        Self::next_u64(self)
    }
}

/// Trait for types that can be randomly generated.
pub trait RandomValue {
    /// Generates a random value of this type.
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self;
}

impl RandomValue for u8 {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.next_u32() as Self
    }
}

impl RandomValue for u16 {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.next_u32() as Self
    }
}

impl RandomValue for u32 {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.next_u32()
    }
}

impl RandomValue for u64 {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.next_u64()
    }
}

impl RandomValue for f64 {
    /// Generates a random `f64` in the range `[0.0, 1.0)`.
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        // Upper 53 bits (f64 mantissa precision)
        let val = rng.next_u64() >> 11;
        val as Self / (1u64 << 53) as Self
    }
}

impl RandomValue for bool {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.next_u32() & 1 == 1
    }
}

/// Multiplier of the shared simulation generator (Numerical Recipes LCG).
const SYNC_MULTIPLIER: u32 = 1664525;
/// Increment of the shared simulation generator.
const SYNC_INCREMENT: u32 = 1013904223;

/// The shared simulation generator.
///
/// A 32-bit linear congruential generator whose entire state is the value returned by
/// [`seed`](Self::seed). Two peers holding the same seed draw identical sequences, and a
/// peer that drifted is brought back with [`reseed`](Self::reseed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncRng {
    state: u32,
}

impl SyncRng {
    /// Creates a generator whose next draws follow from `seed`.
    #[must_use]
    pub const fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// The current state, as stamped into outgoing sync packets.
    #[must_use]
    pub const fn seed(&self) -> u32 {
        self.state
    }

    /// Replaces the state.
    pub fn reseed(&mut self, seed: u32) {
        self.state = seed;
    }
}

impl Rng for SyncRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(SYNC_MULTIPLIER)
            .wrapping_add(SYNC_INCREMENT);
        self.state
    }
}

/// Gets a seed that varies between processes, threads and calls.
///
/// Mixes the process-random keys of [`RandomState`](std::collections::hash_map::RandomState)
/// with wall-clock time and thread identity. NOT cryptographically secure.
fn entropy_seed() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let nanos = web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    RandomState::new().hash_one((nanos, std::thread::current().id()))
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
    fn test_pcg32_deterministic() {
        let mut rng1 = Pcg32::seed_from_u64(12345);
        let mut rng2 = Pcg32::seed_from_u64(12345);

        for _ in 0..1000 {
            assert_eq!(rng1.next_u32(), rng2.next_u32());
        }
    }

    #[test]
    fn test_pcg32_distribution() {
        let mut rng = Pcg32::seed_from_u64(42);
        let mut buckets = [0u32; 16];

        for _ in 0..16000 {
            let bucket = (rng.next_u32() >> 28) as usize;
            buckets[bucket] += 1;
        }

        // Roughly 1000 per bucket; generous bounds
        for &count in &buckets {
            assert!(count > 500, "Bucket too low: {count}");
            assert!(count < 1500, "Bucket too high: {count}");
        }
    }

    #[test]
    fn test_gen_range() {
        let mut rng = Pcg32::seed_from_u64(42);
        for _ in 0..1000 {
            let val = rng.gen_range(10..20);
            assert!((10..20).contains(&val));
        }
    }

    #[test]
    #[allow(clippy::reversed_empty_ranges)]
    fn test_gen_range_empty_returns_start() {
        let mut rng = Pcg32::seed_from_u64(42);
        assert_eq!(rng.gen_range(5..5), 5);
        assert_eq!(rng.gen_range_usize(9..3), 9);
    }

    #[test]
    fn test_gen_bool_edges() {
        let mut rng = Pcg32::seed_from_u64(42);
        for _ in 0..100 {
            assert!(!rng.gen_bool(0.0));
            assert!(rng.gen_bool(1.0));
        }
    }

    #[test]
    fn test_next_nonzero() {
        let mut rng = Pcg32::seed_from_u64(0);
        for _ in 0..1000 {
            assert_ne!(rng.next_nonzero_u32(), 0);
        }
    }

    #[test]
    fn test_from_entropy_differs() {
        let a: Vec<u32> = {
            let mut rng = Pcg32::from_entropy();
            (0..4).map(|_| rng.next_u32()).collect()
        };
        let b: Vec<u32> = {
            let mut rng = Pcg32::from_entropy();
            (0..4).map(|_| rng.next_u32()).collect()
        };
        assert_ne!(a, b);
    }

    #[test]
    fn test_sync_rng_is_lcg() {
        let mut rng = SyncRng::new(0);
        assert_eq!(rng.next_u32(), 1013904223);
        assert_eq!(rng.seed(), 1013904223);
        assert_eq!(
            rng.next_u32(),
            1013904223u32.wrapping_mul(1664525).wrapping_add(1013904223)
        );
    }

    #[test]
    fn test_sync_rng_reseed_converges() {
        let mut host = SyncRng::new(99);
        let mut client = SyncRng::new(1234);
        client.reseed(host.seed());
        for _ in 0..50 {
            assert_eq!(host.next_u32(), client.next_u32());
        }
    }
}

// =============================================================================
// Property-Based Tests
// =============================================================================

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod property_tests {
    use super::*;
    use crate::test_config::{proptest_config, CaseWeight};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(proptest_config(CaseWeight::Message))]

        /// Property: Same seed always produces identical sequence.
        #[test]
        fn prop_sync_rng_same_seed_same_sequence(seed in any::<u32>()) {
            let mut rng1 = SyncRng::new(seed);
            let mut rng2 = SyncRng::new(seed);
            for _ in 0..100 {
                prop_assert_eq!(rng1.next_u32(), rng2.next_u32());
            }
        }

        /// Property: gen_range output is always within the specified range.
        #[test]
        fn prop_gen_range_within_bounds(seed in any::<u64>(), low in 0u32..1000, width in 1u32..1000) {
            let mut rng = Pcg32::seed_from_u64(seed);
            let value = rng.gen_range(low..low + width);
            prop_assert!(value >= low && value < low + width);
        }
    }
}
