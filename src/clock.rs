//! Emulated-clock primitives
//!
//! All chip state advances against a single monotonic emulated clock. The
//! tick rate is a common multiple of every divisor the chips derive from the
//! 3.579545 MHz master crystal, so chip clocks are represented exactly.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Sub};

/// Ticks per emulated second.
///
/// 2880 = 2^6 * 3^2 * 5, so every divisor in use (8, 16, 32, 36, 64, 72)
/// divides the tick rate exactly.
pub const MAIN_FREQ: u64 = 3_579_545 * 2880;

/// A point on the emulated timeline, in [`MAIN_FREQ`] ticks.
///
/// Monotonically increasing; only the driving CPU/scheduler moves it
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct EmuTime(u64);

/// A span of emulated time, in [`MAIN_FREQ`] ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct EmuDuration(u64);

impl EmuTime {
    /// The start of the emulated timeline.
    pub const fn zero() -> Self {
        EmuTime(0)
    }

    /// Construct from a raw tick count.
    pub const fn from_ticks(ticks: u64) -> Self {
        EmuTime(ticks)
    }

    /// Raw tick count since boot.
    pub const fn ticks(self) -> u64 {
        self.0
    }
}

impl EmuDuration {
    /// The empty duration.
    pub const fn zero() -> Self {
        EmuDuration(0)
    }

    /// Construct from a raw tick count.
    pub const fn from_ticks(ticks: u64) -> Self {
        EmuDuration(ticks)
    }

    /// Duration of `n` cycles of a `freq` Hz clock.
    ///
    /// Exact when `freq` divides [`MAIN_FREQ`], which holds for every chip
    /// clock in this crate.
    pub const fn from_cycles(n: u64, freq: u64) -> Self {
        EmuDuration(n * (MAIN_FREQ / freq))
    }

    /// Duration of `n` cycles of the 3.579545 MHz master crystal.
    ///
    /// Chip-internal rates are `master / divisor`; one step of such a clock
    /// is `from_master_cycles(divisor)`.
    pub const fn from_master_cycles(n: u64) -> Self {
        EmuDuration(n * (MAIN_FREQ / 3_579_545))
    }

    /// Duration of `n` host samples at `rate` Hz, rounded down.
    pub const fn from_samples(n: u64, rate: u32) -> Self {
        EmuDuration((n as u128 * MAIN_FREQ as u128 / rate as u128) as u64)
    }

    /// Raw tick count.
    pub const fn ticks(self) -> u64 {
        self.0
    }
}

impl Add<EmuDuration> for EmuTime {
    type Output = EmuTime;
    fn add(self, rhs: EmuDuration) -> EmuTime {
        EmuTime(self.0 + rhs.0)
    }
}

impl AddAssign<EmuDuration> for EmuTime {
    fn add_assign(&mut self, rhs: EmuDuration) {
        self.0 += rhs.0;
    }
}

impl Sub for EmuTime {
    type Output = EmuDuration;
    fn sub(self, rhs: EmuTime) -> EmuDuration {
        EmuDuration(self.0 - rhs.0)
    }
}

impl Add for EmuDuration {
    type Output = EmuDuration;
    fn add(self, rhs: EmuDuration) -> EmuDuration {
        EmuDuration(self.0 + rhs.0)
    }
}

impl Mul<u64> for EmuDuration {
    type Output = EmuDuration;
    fn mul(self, rhs: u64) -> EmuDuration {
        EmuDuration(self.0 * rhs)
    }
}

/// Maps the emulated timeline onto a host sample index without drift.
///
/// The mixer keeps one of these per stream: `samples_until` tells how many
/// whole host samples fit between the stream origin and a given instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleClock {
    origin: EmuTime,
    rate: u32,
}

impl SampleClock {
    /// A sample clock starting at `origin` running at `rate` Hz.
    pub fn new(origin: EmuTime, rate: u32) -> Self {
        SampleClock { origin, rate }
    }

    /// Host sample rate.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Number of whole host samples between the origin and `time`.
    pub fn samples_until(&self, time: EmuTime) -> u64 {
        let dt = (time - self.origin).ticks() as u128;
        (dt * self.rate as u128 / MAIN_FREQ as u128) as u64
    }

    /// The instant at which sample `n` ends.
    pub fn time_of_sample(&self, n: u64) -> EmuTime {
        self.origin + EmuDuration::from_samples(n, self.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chip_divisors_are_exact() {
        // One step of master/div must be a whole number of ticks.
        for div in [8u64, 16, 32, 36, 64, 72] {
            let step = EmuDuration::from_master_cycles(div);
            assert_eq!(step.ticks() % div, 0);
            assert_eq!(step.ticks(), div * MAIN_FREQ / 3_579_545);
        }
        assert_eq!(MAIN_FREQ % 3_579_545, 0);
    }

    #[test]
    fn duration_arithmetic() {
        let t0 = EmuTime::zero();
        let d = EmuDuration::from_cycles(72, 3_579_545);
        let t1 = t0 + d;
        assert_eq!(t1 - t0, d);
        assert!(t1 > t0);
        assert_eq!(d * 2, d + d);
    }

    #[test]
    fn sample_clock_is_monotone_and_exact() {
        let clk = SampleClock::new(EmuTime::zero(), 44_100);
        assert_eq!(clk.samples_until(EmuTime::zero()), 0);
        let one_second = EmuTime::from_ticks(MAIN_FREQ);
        assert_eq!(clk.samples_until(one_second), 44_100);

        // Walking sample end-times back through samples_until is stable.
        let mut prev = 0;
        for n in [1u64, 7, 441, 44_100, 1_000_000] {
            let t = clk.time_of_sample(n);
            let got = clk.samples_until(t);
            assert!(got >= prev);
            assert!(got <= n);
            assert!(n - got <= 1);
            prev = got;
        }
    }
}
