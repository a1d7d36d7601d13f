//! Programmable interval timers shared by the FM chips.
//!
//! OPL-family chips carry two 8-bit timers (80 us and 320 us resolution);
//! the OPM's timer A is 10 bits at a 64-cycle unit. There is no scheduler
//! in this core, so timers advance lazily: every register write or status
//! read syncs them to the supplied emulated time and reports how often
//! they overflowed in between.

use crate::clock::{EmuDuration, EmuTime};
use serde::{Deserialize, Serialize};

/// One chip timer. `period` is the duration of a single count unit;
/// an overflow occurs every `(range - value) * period`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmuTimer {
    period: EmuDuration,
    range: u32,
    value: u32,
    counting: bool,
    next_expiry: EmuTime,
}

impl EmuTimer {
    /// OPL/Y8950 timer 1: one count unit is 4 * 72 master cycles (~80 us).
    pub fn opl_timer1() -> Self {
        EmuTimer::new(EmuDuration::from_master_cycles(4 * 72), 256)
    }

    /// OPL/Y8950 timer 2: one count unit is 16 * 72 master cycles (~320 us).
    pub fn opl_timer2() -> Self {
        EmuTimer::new(EmuDuration::from_master_cycles(16 * 72), 256)
    }

    /// OPM timer A: 10-bit counter, one count unit is 64 master cycles.
    pub fn opm_timer_a() -> Self {
        EmuTimer::new(EmuDuration::from_master_cycles(64), 1024)
    }

    /// OPM timer B: 8-bit counter, one count unit is 1024 master cycles.
    pub fn opm_timer_b() -> Self {
        EmuTimer::new(EmuDuration::from_master_cycles(1024), 256)
    }

    fn new(period: EmuDuration, range: u32) -> Self {
        EmuTimer {
            period,
            range,
            value: 0,
            counting: false,
            next_expiry: EmuTime::zero(),
        }
    }

    /// Program the reload value (masked to the counter range).
    pub fn set_value(&mut self, value: u32) {
        self.value = value & (self.range - 1);
    }

    /// Start or stop the timer at `time`. Starting reloads the interval.
    pub fn set_start(&mut self, start: bool, time: EmuTime) {
        if start == self.counting {
            return;
        }
        self.counting = start;
        if start {
            self.next_expiry = time + self.interval();
        }
    }

    /// Advance to `time`; returns how many overflows happened in between.
    pub fn sync(&mut self, time: EmuTime) -> u32 {
        let mut fired = 0;
        while self.counting && self.next_expiry <= time {
            fired += 1;
            let next = self.next_expiry + self.interval();
            self.next_expiry = next;
        }
        fired
    }

    fn interval(&self) -> EmuDuration {
        self.period * (self.range - self.value).max(1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_at_programmed_interval() {
        let mut t = EmuTimer::opl_timer1();
        t.set_value(256 - 10); // 10 units
        let start = EmuTime::zero();
        t.set_start(true, start);

        let unit = EmuDuration::from_master_cycles(4 * 72);
        assert_eq!(t.sync(start + unit * 9), 0);
        assert_eq!(t.sync(start + unit * 10), 1);
        // Two more intervals elapse in one sync.
        assert_eq!(t.sync(start + unit * 30), 2);
    }

    #[test]
    fn stopped_timer_never_fires() {
        let mut t = EmuTimer::opm_timer_b();
        t.set_value(0);
        assert_eq!(t.sync(EmuTime::from_ticks(u64::MAX / 2)), 0);
    }

    #[test]
    fn restart_reloads_interval() {
        let mut t = EmuTimer::opm_timer_a();
        t.set_value(1024 - 4);
        let unit = EmuDuration::from_master_cycles(64);
        t.set_start(true, EmuTime::zero());
        assert_eq!(t.sync(EmuTime::zero() + unit * 4), 1);
        t.set_start(false, EmuTime::zero() + unit * 5);
        t.set_start(true, EmuTime::zero() + unit * 6);
        assert_eq!(t.sync(EmuTime::zero() + unit * 9), 0);
        assert_eq!(t.sync(EmuTime::zero() + unit * 10), 1);
    }
}
