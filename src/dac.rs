//! 8-bit unsigned DAC.
//!
//! Used by Konami's Synthesizer cartridge, Majutsushi and SIMPL: the CPU
//! writes raw 8-bit samples at arbitrary instants and the DAC holds each
//! level until the next write. Writes are time-stamped; the level changes
//! land on the host sample grid with a fractional-sample carry, queued as
//! run-length (count, level) pairs until the mixer picks them up.

use crate::clock::{EmuTime, MAIN_FREQ};
use crate::device::{ChannelMode, SoundDevice, SoundUnit};
use crate::mixer::Mixer;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const CENTER: u8 = 0x80;
/// Fractional bits of the sample-position bookkeeping.
const POS_FRAC: u32 = 16;

/// 8-bit DAC sound device.
pub struct DacSound {
    vol_table: [i32; 256],
    value: u8,
    sample_rate: u32,

    /// Absolute fill position on the host sample grid, 48.16 fixed point.
    fill_pos: u64,
    /// Whole samples already handed to the mixer.
    played: u64,
    /// Pending run-lengths between `played` and `fill_pos`.
    queue: VecDeque<(u32, i32)>,
    /// Weighted partial sum for the sample `fill_pos` points into.
    partial_acc: i64,
    internal_mute: bool,
}

impl DacSound {
    /// Create and register a DAC. `max_volume` scales full deflection.
    pub fn register(mixer: &Mixer, max_volume: i32) -> Result<SoundUnit<DacSound>> {
        let mut chip = DacSound {
            vol_table: [0; 256],
            value: CENTER,
            sample_rate: 0,
            fill_pos: 0,
            played: 0,
            queue: VecDeque::new(),
            partial_acc: 0,
            internal_mute: true,
        };
        // 0x00 is max negative, 0xFF max positive, 0x80 silent centre.
        for i in 0..256 {
            chip.vol_table[i] = ((i as i32 - CENTER as i32) * max_volume) / 128;
        }
        SoundUnit::register(mixer, chip, ChannelMode::Mono)
    }

    /// Current DAC latch.
    pub fn read_dac(&self) -> u8 {
        self.value
    }

    /// Time-stamped sample write. The interval since the previous write is
    /// queued at the old level; `value` takes over from `time` on.
    pub fn write_dac(&mut self, value: u8, time: EmuTime) {
        let target = self.sample_pos(time);
        let level = self.vol_table[self.value as usize];
        self.fill_to(target, level);
        self.value = value;
        self.internal_mute = false;
    }

    fn sample_pos(&self, time: EmuTime) -> u64 {
        (((time.ticks() as u128 * self.sample_rate as u128) << POS_FRAC)
            / MAIN_FREQ as u128) as u64
    }

    fn fill_to(&mut self, target: u64, level: i32) {
        if target <= self.fill_pos {
            return;
        }
        let one = 1u64 << POS_FRAC;
        // Complete a partially filled sample first.
        let frac = self.fill_pos & (one - 1);
        if frac != 0 {
            let to_boundary = one - frac;
            if target - self.fill_pos >= to_boundary {
                self.partial_acc += level as i64 * to_boundary as i64;
                self.queue.push_back((1, (self.partial_acc >> POS_FRAC) as i32));
                self.partial_acc = 0;
                self.fill_pos += to_boundary;
            } else {
                self.partial_acc += level as i64 * (target - self.fill_pos) as i64;
                self.fill_pos = target;
                return;
            }
        }
        let whole = (target - self.fill_pos) >> POS_FRAC;
        if whole > 0 {
            self.queue.push_back((whole as u32, level));
            self.fill_pos += whole << POS_FRAC;
        }
        let rem = target - self.fill_pos;
        if rem > 0 {
            self.partial_acc = level as i64 * rem as i64;
            self.fill_pos = target;
        }
    }
}

impl SoundDevice for DacSound {
    fn name(&self) -> &'static str {
        "DAC"
    }

    fn num_channels(&self) -> usize {
        1
    }

    fn input_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_sample_rate(&mut self, host_rate: u32) {
        self.sample_rate = host_rate;
    }

    fn amplification_factor(&self) -> f32 {
        1.0
    }

    fn is_muted(&self) -> bool {
        self.internal_mute
    }

    fn generate_channels(&mut self, bufs: &mut [Option<&mut [i32]>], num: usize) {
        let Some(buf) = &mut bufs[0] else { return };
        let mut j = 0;
        while j < num {
            match self.queue.front_mut() {
                Some((count, level)) => {
                    let take = (*count as usize).min(num - j);
                    for s in buf[j..j + take].iter_mut() {
                        *s += *level;
                    }
                    j += take;
                    self.played += take as u64;
                    *count -= take as u32;
                    if *count == 0 {
                        self.queue.pop_front();
                    }
                }
                None => {
                    // Drained: hold the latched level from here on.
                    let level = self.vol_table[self.value as usize];
                    for s in buf[j..num].iter_mut() {
                        *s += level;
                    }
                    self.played += (num - j) as u64;
                    j = num;
                    // These samples are already emitted; move the fill
                    // cursor past them and drop any pending fraction.
                    let boundary = self.played << POS_FRAC;
                    if self.fill_pos < boundary {
                        self.fill_pos = boundary;
                        self.partial_acc = 0;
                    }
                    if self.value == CENTER {
                        self.internal_mute = true;
                    }
                }
            }
        }
    }

    fn peek_register(&self, _reg: u16) -> u8 {
        self.value
    }

    fn reset_core(&mut self) {
        self.queue.clear();
        self.partial_acc = 0;
        self.value = CENTER;
        self.internal_mute = true;
        // Keep fill/played positions: the timeline does not restart.
        let boundary = self.played << POS_FRAC;
        if self.fill_pos < boundary {
            self.fill_pos = boundary;
        }
    }
}

impl SoundUnit<DacSound> {
    /// Time-stamped DAC write.
    pub fn write_dac(&self, value: u8, time: EmuTime) {
        self.sync(time);
        self.with(|c| c.write_dac(value, time));
    }

    /// Current DAC latch.
    pub fn read_dac(&self) -> u8 {
        self.with(|c| c.read_dac())
    }

    /// Snapshot for save states.
    pub fn save_state(&self) -> DacState {
        self.with(|c| DacState {
            value: c.value,
            fill_pos: c.fill_pos,
            played: c.played,
            queue: c.queue.iter().copied().collect(),
            partial_acc: c.partial_acc,
        })
    }

    /// Restore a snapshot.
    pub fn restore_state(&self, state: &DacState) {
        self.with(|c| {
            c.value = state.value;
            c.fill_pos = state.fill_pos;
            c.played = state.played;
            c.queue = state.queue.iter().copied().collect();
            c.partial_acc = state.partial_acc;
            c.internal_mute = c.queue.is_empty() && c.value == CENTER;
        });
    }
}

/// Serializable DAC state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DacState {
    /// Current latch.
    pub value: u8,
    /// Fill cursor (48.16).
    pub fill_pos: u64,
    /// Samples already emitted.
    pub played: u64,
    /// Pending run-lengths.
    pub queue: Vec<(u32, i32)>,
    /// Partial-sample accumulator.
    pub partial_acc: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::EmuDuration;

    fn chip() -> DacSound {
        let mut c = DacSound {
            vol_table: [0; 256],
            value: CENTER,
            sample_rate: 0,
            fill_pos: 0,
            played: 0,
            queue: VecDeque::new(),
            partial_acc: 0,
            internal_mute: true,
        };
        for i in 0..256 {
            c.vol_table[i] = ((i as i32 - CENTER as i32) * 12_000) / 128;
        }
        c.set_sample_rate(44_100);
        c
    }

    fn gen(c: &mut DacSound, n: usize) -> Vec<i32> {
        let mut buf = vec![0i32; n];
        let mut slots: Vec<Option<&mut [i32]>> = vec![Some(buf.as_mut_slice())];
        c.generate_channels(&mut slots, n);
        buf
    }

    #[test]
    fn centre_is_silent_and_muted() {
        let mut c = chip();
        assert!(c.is_muted());
        let buf = gen(&mut c, 16);
        assert!(buf.iter().all(|&s| s == 0));
    }

    #[test]
    fn level_change_lands_on_the_right_sample() {
        let mut c = chip();
        // Write full positive at t=0, then centre after 100 samples.
        c.write_dac(0xFF, EmuTime::zero());
        let t100 = EmuTime::zero() + EmuDuration::from_samples(100, 44_100);
        c.write_dac(CENTER, t100);

        let buf = gen(&mut c, 200);
        let top = c.vol_table[0xFF];
        assert_eq!(buf[0], top);
        assert_eq!(buf[98], top);
        assert!(buf[101] == 0 || buf[100] == 0);
        assert_eq!(buf[150], 0);
    }

    #[test]
    fn fractional_boundary_interpolates_one_sample() {
        let mut c = chip();
        c.write_dac(0xFF, EmuTime::zero());
        // Half a sample later, back to centre: the single affected sample
        // carries roughly half the level.
        let half = EmuTime::zero() + EmuDuration::from_ticks(MAIN_FREQ / 44_100 / 2);
        c.write_dac(CENTER, half);
        let t10 = EmuTime::zero() + EmuDuration::from_samples(10, 44_100);
        c.write_dac(CENTER, t10);

        let buf = gen(&mut c, 10);
        let top = c.vol_table[0xFF];
        assert!((buf[0] - top / 2).abs() <= top / 8, "buf0={}", buf[0]);
        assert_eq!(buf[5], 0);
    }

    #[test]
    fn mutes_after_drain_at_centre() {
        let mut c = chip();
        c.write_dac(0xC0, EmuTime::zero());
        assert!(!c.is_muted());
        c.write_dac(CENTER, EmuTime::zero() + EmuDuration::from_samples(10, 44_100));
        gen(&mut c, 64);
        assert!(c.is_muted());
    }
}
