//! Multiplier Clock
//!
//! The displayed multiplier is a deterministic function of elapsed server
//! time: `floor(100 * e^(r * t))` hundredths, `t` in milliseconds.
//! Evaluated in Q32 fixed point with an integer Taylor series so that the
//! cash-out decision never depends on floating-point behavior.

use serde::{Deserialize, Serialize};

use crate::core::amount::{Multiplier, MULTIPLIER_ONE};

/// Q32 fractional bits.
const Q: u32 = 32;

/// 1.0 in Q32.
const Q_ONE: u128 = 1 << Q;

/// Largest exponent evaluated (e^40 already exceeds any `u64` multiplier).
const MAX_EXPONENT: u128 = 40 << Q;

/// Default growth: 0.00006 per millisecond (2.00x after ~11.55s).
pub const DEFAULT_RATE_Q32_PER_MS: u64 = 257_698;

/// Elapsed-time to multiplier mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplierClock {
    /// Growth rate per millisecond in Q32.
    pub rate_q32_per_ms: u64,
}

impl Default for MultiplierClock {
    fn default() -> Self {
        Self { rate_q32_per_ms: DEFAULT_RATE_Q32_PER_MS }
    }
}

impl MultiplierClock {
    /// Multiplier shown after `elapsed_ms` of running.
    ///
    /// # Example
    /// ```
    /// use crash_wager::fair::clock::MultiplierClock;
    /// let clock = MultiplierClock::default();
    /// assert_eq!(clock.multiplier_at(0), 100);
    /// assert_eq!(clock.multiplier_at(20_000), 332);
    /// ```
    pub fn multiplier_at(&self, elapsed_ms: u64) -> Multiplier {
        let exponent = (self.rate_q32_per_ms as u128)
            .saturating_mul(elapsed_ms as u128)
            .min(MAX_EXPONENT);
        let value = (exp_q32(exponent) * MULTIPLIER_ONE as u128) >> Q;
        value.min(Multiplier::MAX as u128) as Multiplier
    }

    /// Least elapsed time at which the multiplier reaches `crash_point`.
    ///
    /// The round crashes at exactly this instant; a cash-out observed at any
    /// earlier millisecond wins.
    pub fn crash_elapsed_ms(&self, crash_point: Multiplier) -> u64 {
        if crash_point <= MULTIPLIER_ONE || self.rate_q32_per_ms == 0 {
            return 0;
        }

        // Exponential search for an upper bound
        let mut hi: u64 = 1;
        while self.multiplier_at(hi) < crash_point {
            if self.exponent_saturated(hi) {
                return hi;
            }
            hi = hi.saturating_mul(2);
        }

        // Binary search for the first millisecond at or above crash_point
        let mut lo: u64 = 0;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.multiplier_at(mid) >= crash_point {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    fn exponent_saturated(&self, elapsed_ms: u64) -> bool {
        (self.rate_q32_per_ms as u128).saturating_mul(elapsed_ms as u128) >= MAX_EXPONENT
    }
}

/// e^x for `x` in Q32, result in Q32.
fn exp_q32(x: u128) -> u128 {
    let mut sum = Q_ONE;
    let mut term = Q_ONE;
    let mut k: u128 = 1;
    loop {
        term = term * x / (k * Q_ONE);
        if term == 0 {
            break;
        }
        sum += term;
        k += 1;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_one() {
        assert_eq!(MultiplierClock::default().multiplier_at(0), MULTIPLIER_ONE);
    }

    #[test]
    fn test_known_points() {
        let clock = MultiplierClock::default();
        // e^0.6 = 1.8221
        assert_eq!(clock.multiplier_at(10_000), 182);
        // e^0.591 = 1.8058
        assert_eq!(clock.multiplier_at(9_850), 180);
        // e^1.2 = 3.3201
        assert_eq!(clock.multiplier_at(20_000), 332);
    }

    #[test]
    fn test_monotonic() {
        let clock = MultiplierClock::default();
        let mut last = 0;
        for t in (0..120_000).step_by(37) {
            let m = clock.multiplier_at(t);
            assert!(m >= last);
            last = m;
        }
    }

    #[test]
    fn test_crash_elapsed_is_first_crossing() {
        let clock = MultiplierClock::default();
        for crash in [101, 150, 180, 235, 1_000, 10_000, 1_000_000] {
            let t = clock.crash_elapsed_ms(crash);
            assert!(clock.multiplier_at(t) >= crash);
            assert!(t == 0 || clock.multiplier_at(t - 1) < crash);
        }
    }

    #[test]
    fn test_crash_elapsed_for_2_35() {
        // ln(2.35) / 0.00006 ≈ 14240.3ms
        let t = MultiplierClock::default().crash_elapsed_ms(235);
        assert!((14_200..14_300).contains(&t));
    }

    #[test]
    fn test_instant_crash() {
        let clock = MultiplierClock::default();
        assert_eq!(clock.crash_elapsed_ms(100), 0);
        assert_eq!(clock.crash_elapsed_ms(0), 0);
    }

    #[test]
    fn test_saturates_without_overflow() {
        let clock = MultiplierClock { rate_q32_per_ms: u64::MAX };
        assert!(clock.multiplier_at(u64::MAX) > 1_000_000);
        assert!(clock.crash_elapsed_ms(Multiplier::MAX) > 0);
    }
}
