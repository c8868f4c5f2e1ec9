//! Seeded fault schedule for [`ChaosTransport`](crate::ChaosTransport).
//!
//! Fault injection has to be reproducible: the same seed must drop, duplicate and delay the
//! same messages on every run. [`FaultRng`] is a SplitMix64 generator, which is enough for
//! that and keeps the crate free of a random number dependency. Not cryptographically secure.
//!
//! ```rust
//! use duel_link::rng::FaultRng;
//!
//! let mut a = FaultRng::seeded(7);
//! let mut b = FaultRng::seeded(7);
//! assert_eq!(a.up_to(10), b.up_to(10));
//! assert!(!a.chance(0.0));
//! assert!(a.chance(1.0));
//! ```

/// Golden-ratio increment of SplitMix64.
const GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Deterministic generator for chaos decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRng {
    state: u64,
}

impl FaultRng {
    /// Creates a generator. Equal seeds yield equal sequences.
    #[must_use]
    pub const fn seeded(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Returns the next 64 random bits.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(GAMMA);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Returns a value uniform in `[0, 1)`.
    #[inline]
    pub fn next_unit(&mut self) -> f64 {
        // Top 53 bits fill an f64 mantissa exactly.
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Returns `true` with probability `rate`. Rates outside `0.0..=1.0` are clamped, and NaN
    /// counts as 0.0.
    pub fn chance(&mut self, rate: f64) -> bool {
        if rate.is_nan() || rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.next_unit() < rate
    }

    /// Returns a value uniform in `0..=max`.
    pub fn up_to(&mut self, max: u32) -> u32 {
        let span = u64::from(max) + 1;
        // Reject the biased tail so every value is equally likely.
        let zone = u64::MAX - (u64::MAX % span);
        loop {
            let value = self.next_u64();
            if value < zone {
                return (value % span) as u32;
            }
        }
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
    fn equal_seeds_agree() {
        let mut a = FaultRng::seeded(99);
        let mut b = FaultRng::seeded(99);
        for _ in 0..500 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = FaultRng::seeded(1);
        let mut b = FaultRng::seeded(2);
        let same = (0..100).filter(|_| a.next_u64() == b.next_u64()).count();
        assert_eq!(same, 0);
    }

    #[test]
    fn seed_zero_is_not_stuck() {
        let mut rng = FaultRng::seeded(0);
        let first = rng.next_u64();
        assert_ne!(first, 0);
        assert_ne!(first, rng.next_u64());
    }

    #[test]
    fn up_to_stays_in_range() {
        let mut rng = FaultRng::seeded(42);
        let mut seen = [false; 5];
        for _ in 0..1000 {
            let value = rng.up_to(4);
            assert!(value <= 4);
            seen[value as usize] = true;
        }
        assert!(seen.iter().all(|hit| *hit));
        assert_eq!(rng.up_to(0), 0);
    }

    #[test]
    fn chance_extremes_and_midpoint() {
        let mut rng = FaultRng::seeded(42);
        assert!((0..100).all(|_| !rng.chance(0.0)));
        assert!((0..100).all(|_| rng.chance(1.0)));
        assert!(!rng.chance(f64::NAN));

        let hits = (0..10_000).filter(|_| rng.chance(0.5)).count();
        assert!((4_500..5_500).contains(&hits), "got {hits}");
    }

    #[test]
    fn unit_values_are_half_open() {
        let mut rng = FaultRng::seeded(3);
        for _ in 0..1000 {
            let value = rng.next_unit();
            assert!((0.0..1.0).contains(&value));
        }
    }
}
