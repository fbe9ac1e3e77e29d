//! Secure random number generation.
//!
//! Wraps the operating system's entropy source for circuit identifiers,
//! chaff bytes, and the geometric timer distribution.

use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// Cryptographically secure random number generator.
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a random u32.
    pub fn u32() -> u32 {
        OsRng.next_u32()
    }

    /// Generate a random nonzero u32 (circuit identifiers disallow zero).
    pub fn nonzero_u32() -> u32 {
        loop {
            let v = OsRng.next_u32();
            if v != 0 {
                return v;
            }
        }
    }
}

/// Sample a geometric distribution with expected value `xv`, clamped to
/// `[0, hi)`.
///
/// Used for the circuit flush timer: as dead cycles accumulate the caller
/// raises `xv`, so the expected interval grows roughly exponentially until
/// the `hi` cap dominates.
pub fn range_geom(hi: u64, xv: u64) -> u64 {
    if hi == 0 || xv == 0 {
        return 0;
    }
    let p = 1.0 / xv as f64;
    if p >= 1.0 {
        return 0;
    }
    // Inverse transform: floor(ln(U) / ln(1 - p)) is Geometric(p).
    let u: f64 = OsRng.gen_range(f64::MIN_POSITIVE..1.0);
    let v = (u.ln() / (1.0 - p).ln()).floor();
    (v as u64).min(hi - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_fill_produces_entropy() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        SecureRandom::fill(&mut a);
        SecureRandom::fill(&mut b);
        assert_ne!(a, b);
        assert!(a.iter().any(|&x| x != 0));
    }

    #[test]
    fn test_nonzero_u32() {
        for _ in 0..64 {
            assert_ne!(SecureRandom::nonzero_u32(), 0);
        }
    }

    #[test]
    fn test_range_geom_bounds() {
        for _ in 0..1000 {
            assert!(range_geom(1000, 50) < 1000);
        }
        assert_eq!(range_geom(0, 50), 0);
        assert_eq!(range_geom(1000, 0), 0);
        assert_eq!(range_geom(1000, 1), 0);
    }

    #[test]
    fn test_range_geom_mean_tracks_xv() {
        // Loose statistical check: with hi far above xv the sample mean
        // should land near xv.
        let n = 20_000u64;
        let sum: u64 = (0..n).map(|_| range_geom(1_000_000, 100)).sum();
        let mean = sum / n;
        assert!((40..=250).contains(&mean), "mean {mean} out of range");
    }

    #[test]
    fn test_range_geom_varies() {
        let samples: HashSet<u64> = (0..200).map(|_| range_geom(100_000, 500)).collect();
        assert!(samples.len() > 10);
    }
}
