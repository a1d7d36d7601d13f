//! SN76489 DCSG emulation.
//!
//! Three 10-bit tone generators plus one noise channel with a 15-bit shift
//! register, programmed through the latch/data byte protocol. The core
//! runs at its native rate (master clock / 16); the mixer resamples.

use crate::clock::EmuTime;
use crate::device::{ChannelMode, SoundDevice, SoundUnit};
use crate::mixer::Mixer;
use crate::Result;
use serde::{Deserialize, Serialize};

/// The SN76489 divides its clock input by 8; all MSX users feed it the
/// master crystal through another divide-by-2.
const NATIVE_FREQ: u32 = 223_722; // round((3579545 / 8) / 2)

/// 15-bit noise shift register with deferred stepping.
///
/// When the noise channel is silent its generator still runs; instead of
/// stepping the register per tick we count steps modulo the sequence
/// period and catch up when output is next needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NoiseShifter {
    pattern: u32,
    period: u32,
    random: u32,
    steps_behind: u32,
}

impl NoiseShifter {
    fn new() -> Self {
        let mut s = NoiseShifter {
            pattern: 0,
            period: 1,
            random: 0,
            steps_behind: 0,
        };
        s.init_state(0x6000, (1 << 15) - 1);
        s
    }

    fn init_state(&mut self, pattern: u32, period: u32) {
        self.pattern = pattern;
        self.period = period;
        self.steps_behind = 0;
        // Start with only the top bit of the sequence set.
        let all_ones = flood_right(pattern);
        self.random = all_ones - (all_ones >> 1);
    }

    fn output(&self) -> u32 {
        !self.random & 1
    }

    fn advance(&mut self) {
        self.random = (self.random >> 1) ^ if self.random & 1 != 0 { self.pattern } else { 0 };
    }

    fn queue_advance(&mut self, steps: u32) {
        self.steps_behind = (self.steps_behind + steps) % self.period;
    }

    fn catch_up(&mut self) {
        while self.steps_behind > 0 {
            self.advance();
            self.steps_behind -= 1;
        }
    }
}

fn flood_right(mut x: u32) -> u32 {
    x |= x >> 1;
    x |= x >> 2;
    x |= x >> 4;
    x |= x >> 8;
    x |= x >> 16;
    x
}

/// SN76489 core.
pub struct Sn76489 {
    regs: [u16; 8],
    register_latch: usize,
    counters: [u32; 4],
    outputs: [u32; 4],
    noise: NoiseShifter,
    vol_table: [i32; 16],
}

impl Sn76489 {
    /// Create and register an SN76489.
    pub fn register(mixer: &Mixer) -> Result<SoundUnit<Sn76489>> {
        let mut chip = Sn76489 {
            regs: [0; 8],
            register_latch: 0,
            counters: [0; 4],
            outputs: [0; 4],
            noise: NoiseShifter::new(),
            vol_table: [0; 16],
        };
        chip.init_volume_table(32_768);
        chip.init_state();
        SoundUnit::register(mixer, chip, ChannelMode::Mono)
    }

    fn init_volume_table(&mut self, volume: i32) {
        // 2 dB per step, on amplitude.
        let factor = 0.1f64.powf(0.2 * 0.5);
        let mut out = volume as f64;
        for v in self.vol_table.iter_mut().take(15) {
            *v = (out + 0.5) as i32;
            out *= factor;
        }
        self.vol_table[15] = 0;
    }

    fn init_state(&mut self) {
        self.register_latch = 0;
        // Discrete chips power up with random registers; init to silence
        // for the listener's sake (attenuation 0xF).
        for chan in 0..4 {
            self.regs[chan * 2] = 0;
            self.regs[chan * 2 + 1] = 0xF;
            self.counters[chan] = 0;
            self.outputs[chan] = 0;
        }
        self.init_noise();
    }

    fn init_noise(&mut self) {
        // SN76489A patterns; other variants differ.
        if self.regs[6] & 0x4 != 0 {
            // White noise: full-period pseudo-random sequence.
            self.noise.init_state(0x6000, (1 << 15) - 1);
        } else {
            // Periodic noise: short-duty square wave.
            self.noise.init_state(1 << 14, 15);
        }
    }

    /// The latch/data write protocol on the single I/O port.
    pub fn write(&mut self, value: u8) {
        if value & 0x80 != 0 {
            self.register_latch = ((value & 0x70) >> 4) as usize;
        }
        let reg = self.register_latch;
        let old = self.regs[reg];
        let data = match reg {
            0 | 2 | 4 => {
                // Tone period, 10 bits split over the two write forms.
                if value & 0x80 != 0 {
                    (old & 0x3F0) | (value as u16 & 0x0F)
                } else {
                    (old & 0x00F) | ((value as u16 & 0x3F) << 4)
                }
            }
            6 => value as u16 & 0x07,
            _ => value as u16 & 0x0F,
        };
        self.write_register(reg, data);
    }

    fn write_register(&mut self, reg: usize, value: u16) {
        if reg == 6 || self.regs[reg] != value {
            self.regs[reg] = value;
            if reg == 6 {
                // Every write to the noise control resets the shifter.
                self.init_noise();
            }
        }
    }

    fn synthesize_channel(
        &mut self,
        slot: &mut Option<&mut [i32]>,
        num: usize,
        generator: usize,
        noise: bool,
    ) {
        let period = if generator == 3 {
            16 << (self.regs[6] & 3)
        } else {
            match self.regs[2 * generator] {
                0 => 0x400, // period 0 behaves as maximum
                p => p as u32,
            }
        };

        let mut output = self.outputs[generator];
        let mut counter = self.counters[generator];

        let channel = if noise { 3 } else { generator };
        let volume = self.vol_table[self.regs[2 * channel + 1] as usize];

        if volume == 0 {
            // Channel is silent; don't synthesize it.
            *slot = None;
        }
        match slot.as_deref_mut() {
            Some(buf) => {
                if noise {
                    self.noise.catch_up();
                }
                let mut pos = 0usize;
                let mut remaining = num as u32;
                while remaining != 0 {
                    if counter == 0 {
                        output ^= 1;
                        counter = period;
                        if noise && output != 0 {
                            self.noise.advance();
                        }
                    }
                    let ticks = counter.min(remaining);
                    let on = if noise { self.noise.output() } else { output };
                    if on != 0 {
                        for s in buf[pos..pos + ticks as usize].iter_mut() {
                            *s += volume;
                        }
                    }
                    pos += ticks as usize;
                    counter -= ticks;
                    remaining -= ticks;
                }
            }
            None => {
                // Advance generator state without synthesis.
                let num = num as u32;
                if counter >= num {
                    counter -= num;
                } else {
                    let mut remaining = num - counter;
                    output ^= 1; // partial cycle
                    let cycles = (remaining - 1) / period;
                    if noise {
                        self.noise.queue_advance((cycles + output) / 2);
                    }
                    output ^= cycles & 1; // full cycles
                    remaining -= cycles * period;
                    counter = period - remaining;
                }
            }
        }

        if !noise || generator == 3 {
            self.outputs[generator] = output;
            self.counters[generator] = counter;
        }
    }
}

impl SoundDevice for Sn76489 {
    fn name(&self) -> &'static str {
        "SN76489"
    }

    fn num_channels(&self) -> usize {
        4
    }

    fn input_rate(&self) -> u32 {
        NATIVE_FREQ
    }

    fn set_sample_rate(&mut self, _host_rate: u32) {}

    fn amplification_factor(&self) -> f32 {
        0.25
    }

    fn is_muted(&self) -> bool {
        (0..4).all(|c| self.regs[2 * c + 1] == 0xF)
    }

    fn generate_channels(&mut self, bufs: &mut [Option<&mut [i32]>], num: usize) {
        let (tones, noise) = bufs.split_at_mut(3);
        // Channel 3: noise.
        if (self.regs[6] & 3) == 3 {
            // Clocked by tone generator #3 (channel 2), whose state is
            // committed when its own tone channel is synthesized below.
            self.synthesize_channel(&mut noise[0], num, 2, true);
            // The generator-3 phase keeps running even while it is not
            // driving the shifter.
            self.synthesize_channel(&mut None, num, 3, false);
        } else {
            self.synthesize_channel(&mut noise[0], num, 3, true);
        }
        for (channel, slot) in tones.iter_mut().enumerate() {
            self.synthesize_channel(slot, num, channel, false);
        }
    }

    fn peek_register(&self, reg: u16) -> u8 {
        (self.regs[(reg & 7) as usize] & 0xFF) as u8
    }

    fn reset_core(&mut self) {
        self.init_state();
    }
}

impl SoundUnit<Sn76489> {
    /// Time-stamped write of one command byte.
    pub fn write(&self, value: u8, time: EmuTime) {
        self.sync(time);
        self.with(|c| c.write(value));
    }

    /// Snapshot for save states.
    pub fn save_state(&self) -> Sn76489State {
        self.with(|c| {
            let mut c2 = c.noise.clone();
            c2.catch_up();
            Sn76489State {
                regs: c.regs.to_vec(),
                register_latch: c.register_latch as u8,
                counters: c.counters.to_vec(),
                outputs: c.outputs.to_vec(),
                noise_random: c2.random,
            }
        })
    }

    /// Restore a snapshot; noise pattern/period re-derive from register 6.
    pub fn restore_state(&self, state: &Sn76489State) {
        self.with(|c| {
            for (i, &r) in state.regs.iter().enumerate().take(8) {
                c.regs[i] = r;
            }
            c.register_latch = state.register_latch as usize & 7;
            for i in 0..4 {
                c.counters[i] = state.counters[i];
                c.outputs[i] = state.outputs[i];
            }
            c.init_noise();
            c.noise.random = state.noise_random;
        });
    }
}

/// Serializable SN76489 state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sn76489State {
    /// Register file (tone periods and attenuations).
    pub regs: Vec<u16>,
    /// Current latch.
    pub register_latch: u8,
    /// Per-generator down counters.
    pub counters: Vec<u32>,
    /// Per-generator output bits.
    pub outputs: Vec<u32>,
    /// Noise shift register contents.
    pub noise_random: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chip() -> Sn76489 {
        let mut c = Sn76489 {
            regs: [0; 8],
            register_latch: 0,
            counters: [0; 4],
            outputs: [0; 4],
            noise: NoiseShifter::new(),
            vol_table: [0; 16],
        };
        c.init_volume_table(32_768);
        c.init_state();
        c
    }

    #[test]
    fn powers_up_silent() {
        let c = chip();
        assert!(c.is_muted());
    }

    #[test]
    fn latch_data_protocol() {
        let mut c = chip();
        c.write(0x8F); // latch tone 0, low nibble 0xF
        c.write(0x3F); // data: high 6 bits
        assert_eq!(c.regs[0], 0x3FF);
        c.write(0x90); // latch volume 0, full volume
        assert!(!c.is_muted());
    }

    #[test]
    fn noise_write_resets_shifter() {
        let mut c = chip();
        c.write(0xE4); // white noise
        for _ in 0..100 {
            c.noise.advance();
        }
        let scrambled = c.noise.random;
        c.write(0xE4);
        assert_ne!(c.noise.random, scrambled);
        assert_eq!(c.noise.random, 1 << 14);
    }

    #[test]
    fn white_noise_lfsr_period() {
        let mut n = NoiseShifter::new();
        let seed = n.random;
        let mut steps = 0u64;
        loop {
            n.advance();
            steps += 1;
            if n.random == seed {
                break;
            }
            assert!(steps < 1 << 16);
        }
        assert_eq!(steps, (1 << 15) - 1);
    }

    #[test]
    fn tone_frequency_matches_period() {
        let mut c = chip();
        c.write(0x80 | 0x04); // tone 0 low = 4
        c.write(0x06); // tone 0 high = 6 -> period 0x64 = 100
        c.write(0x90); // volume 0 max
        assert_eq!(c.regs[0], 100);

        let n = NATIVE_FREQ as usize;
        let mut bufs_raw = vec![vec![0i32; n]; 4];
        {
            let mut slots: Vec<Option<&mut [i32]>> =
                bufs_raw.iter_mut().map(|b| Some(b.as_mut_slice())).collect();
            c.generate_channels(&mut slots, n);
        }
        let mut edges = 0;
        for w in bufs_raw[0].windows(2) {
            if w[0] == 0 && w[1] > 0 {
                edges += 1;
            }
        }
        // Full square-wave period is 2 * P ticks.
        let expected = NATIVE_FREQ / (2 * 100);
        assert!((edges as i64 - expected as i64).abs() <= 1, "edges={edges}");
    }

    #[test]
    fn period_zero_acts_as_maximum() {
        let mut c = chip();
        c.write(0x80);
        c.write(0x00);
        c.write(0x90);
        let mut buf = vec![0i32; 4096];
        let mut slots: Vec<Option<&mut [i32]>> =
            vec![Some(buf.as_mut_slice()), None, None, None];
        c.generate_channels(&mut slots, 4096);
        // Output flips every 0x400 ticks.
        let first_edge = buf.iter().position(|&s| s != buf[0]);
        assert_eq!(first_edge, Some(0x400));
    }
}
