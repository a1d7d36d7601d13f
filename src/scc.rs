//! Konami SCC / SCC+ wavetable emulation.
//!
//! Five channels, each with a 32-byte signed waveform, a 12-bit frequency
//! divider and a 4-bit volume. In SCC-compatible modes channel 5 shares
//! channel 4's waveform; SCC+ gives it its own. The memory-mapped register
//! window (0x00..0xFF as seen from the cartridge slot) is mirrored exactly
//! as the hardware does it.

use crate::clock::EmuTime;
use crate::device::{ChannelMode, SoundDevice, SoundUnit};
use crate::mixer::Mixer;
use crate::Result;
use serde::{Deserialize, Serialize};

const CLOCK_FREQ: u32 = 3_579_545;
const GETA_BITS: u32 = 22;

/// Which incarnation of the chip is mapped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChipMode {
    /// Plain SCC: upper half of the window reads 0xFF.
    Real,
    /// SCC+ cartridge in SCC-compatible mode.
    Compatible,
    /// SCC+ mode: channel 5 has its own waveform.
    Plus,
}

/// SCC core.
pub struct Scc {
    mode: ChipMode,
    wave: [[i8; 32]; 5],
    vol_adjusted_wave: [[i32; 32]; 5],
    count: [u32; 5],
    incr: [u32; 5],
    freq: [u16; 5],
    volume: [u8; 5],
    ch_enable: u8,
    deformation: u8,
    cycle_4bit: bool,
    cycle_8bit: bool,
    refresh: bool,
    mem_interface: [u8; 256],

    sample_rate: u32,
    realstep: u32,
    scctime: u32,
    sccstep: u32,
    internal_mute: bool,
}

impl Scc {
    /// Create and register an SCC (starts in [`ChipMode::Real`]).
    pub fn register(mixer: &Mixer) -> Result<SoundUnit<Scc>> {
        let mut chip = Scc {
            mode: ChipMode::Real,
            wave: [[0; 32]; 5],
            vol_adjusted_wave: [[0; 32]; 5],
            count: [0; 5],
            incr: [0; 5],
            freq: [0; 5],
            volume: [0; 5],
            ch_enable: 0xFF,
            deformation: 0,
            cycle_4bit: false,
            cycle_8bit: false,
            refresh: false,
            mem_interface: [0xFF; 256],
            sample_rate: 0,
            realstep: 0,
            scctime: 0,
            sccstep: (1u32 << 31) / (CLOCK_FREQ / 2),
            internal_mute: true,
        };
        chip.reset_core();
        SoundUnit::register(mixer, chip, ChannelMode::Mono)
    }

    /// Switch the mapping mode; the register window is rebuilt.
    pub fn set_chip_mode(&mut self, mode: ChipMode) {
        if self.mode == mode {
            return;
        }
        self.mode = mode;
        match mode {
            ChipMode::Real => {
                for b in &mut self.mem_interface[128..] {
                    *b = 0xFF;
                }
            }
            ChipMode::Compatible => {
                self.mirror_freq_vol(0x80);
                for i in 0..32 {
                    self.mem_interface[0xA0 + i] = self.wave[4][i] as u8;
                }
                self.mirror_deform(0xC0);
                for b in &mut self.mem_interface[0xE0..] {
                    *b = 0xFF;
                }
            }
            ChipMode::Plus => {
                for i in 0..32 {
                    self.mem_interface[0x80 + i] = self.wave[4][i] as u8;
                }
                self.mirror_freq_vol(0xA0);
                self.mirror_deform(0xC0);
                for b in &mut self.mem_interface[0xE0..] {
                    *b = 0xFF;
                }
            }
        }
    }

    fn mirror_deform(&mut self, offset: usize) {
        for i in 0..32 {
            self.mem_interface[offset + i] = self.deformation;
        }
    }

    fn mirror_freq_vol(&mut self, offset: usize) {
        // 10 bytes of frequency, 5 of volume, 1 enable; visible twice.
        for i in 0..10 {
            let value = if i & 1 != 0 {
                (self.freq[i >> 1] >> 8) as u8
            } else {
                (self.freq[i >> 1] & 0xFF) as u8
            };
            self.mem_interface[offset + i] = value;
            self.mem_interface[offset + i + 16] = value;
        }
        for i in 0..5 {
            self.mem_interface[offset + 10 + i] = self.volume[i];
            self.mem_interface[offset + 10 + i + 16] = self.volume[i];
        }
        self.mem_interface[offset + 15] = self.ch_enable;
        self.mem_interface[offset + 31] = self.ch_enable;
    }

    /// Read from the memory-mapped window. Side-effect free.
    pub fn read_mem(&self, address: u8) -> u8 {
        self.mem_interface[address as usize]
    }

    /// Write to the memory-mapped window.
    pub fn write_mem(&mut self, address: u8, value: u8) {
        let addr = address as usize;
        // Waveform area; SCC+ mode maps 32 extra bytes for channel 5.
        let wave_border = if self.mode == ChipMode::Plus { 0xA0 } else { 0x80 };
        if addr < wave_border {
            let ch = addr >> 5;
            let idx = addr & 0x1F;
            self.wave[ch][idx] = value as i8;
            self.vol_adjusted_wave[ch][idx] = value as i8 as i32 * self.volume[ch] as i32;
            if self.mode != ChipMode::Plus && ch == 3 {
                // Channel 5 tracks channel 4's waveform.
                self.wave[4][idx] = value as i8;
                self.vol_adjusted_wave[4][idx] = value as i8 as i32 * self.volume[4] as i32;
                if self.mode == ChipMode::Compatible {
                    self.mem_interface[addr + 64] = value;
                }
            }
            self.mem_interface[addr] = value;
            return;
        }
        match self.mode {
            ChipMode::Real => {
                if addr < 0xA0 {
                    self.set_freq_vol(value, (addr - 0x80) as u8);
                } else if addr >= 0xE0 {
                    self.set_deform(value);
                }
            }
            ChipMode::Compatible => {
                if addr < 0xA0 {
                    self.set_freq_vol(value, (addr - 0x80) as u8);
                    self.mem_interface[addr | 0x10] = value;
                    self.mem_interface[addr & 0xEF] = value;
                } else if (0xC0..0xE0).contains(&addr) {
                    self.set_deform(value);
                    self.mirror_deform(0xC0);
                }
            }
            ChipMode::Plus => {
                if addr < 0xC0 {
                    self.set_freq_vol(value, (addr - 0xA0) as u8);
                    self.mem_interface[addr | 0x10] = value;
                    self.mem_interface[addr & 0xEF] = value;
                } else if (0xC0..0xE0).contains(&addr) {
                    self.set_deform(value);
                    self.mirror_deform(0xC0);
                }
            }
        }
    }

    fn set_deform(&mut self, value: u8) {
        // Bits 6/7 inject noise on real hardware; not modeled (the register
        // value itself is retained and readable).
        self.deformation = value;
        self.cycle_4bit = value & 1 != 0;
        self.cycle_8bit = value & 2 != 0;
        self.refresh = value & 32 != 0;
    }

    fn set_freq_vol(&mut self, value: u8, address: u8) {
        let address = if address > 16 { address - 16 } else { address }; // mirrored region
        let addr = address as usize;
        if addr < 0x0A {
            let ch = addr >> 1;
            if addr & 1 != 0 {
                self.freq[ch] = ((value as u16 & 0x0F) << 8) | (self.freq[ch] & 0xFF);
            } else {
                self.freq[ch] = (self.freq[ch] & 0xF00) | value as u16;
            }
            if self.refresh {
                self.count[ch] = 0;
            }
            let mut frq = self.freq[ch] as u32;
            if self.cycle_8bit {
                frq &= 0xFF;
            }
            if self.cycle_4bit {
                frq >>= 8;
            }
            self.incr[ch] = if frq <= 8 { 0 } else { (2 << GETA_BITS) / (frq + 1) };
        } else if addr < 0x0F {
            let ch = addr - 0x0A;
            self.volume[ch] = value & 0x0F;
            for i in 0..32 {
                self.vol_adjusted_wave[ch][i] = self.wave[ch][i] as i32 * self.volume[ch] as i32;
            }
            self.check_mute();
        } else if addr == 0x0F {
            self.ch_enable = value & 0x1F;
            self.check_mute();
        }
    }

    fn check_mute(&mut self) {
        if self.ch_enable & 0x1F == 0 {
            self.internal_mute = true;
            return;
        }
        let mut audible = 0u8;
        for ch in 0..5 {
            if self.volume[ch] != 0 {
                audible |= (1 << ch) & self.ch_enable;
            }
        }
        self.internal_mute = audible == 0;
    }
}

impl SoundDevice for Scc {
    fn name(&self) -> &'static str {
        "SCC"
    }

    fn num_channels(&self) -> usize {
        5
    }

    fn input_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_sample_rate(&mut self, host_rate: u32) {
        self.sample_rate = host_rate;
        self.realstep = (1u32 << 31) / host_rate;
    }

    fn amplification_factor(&self) -> f32 {
        1.0
    }

    fn is_muted(&self) -> bool {
        self.internal_mute
    }

    fn generate_channels(&mut self, bufs: &mut [Option<&mut [i32]>], num: usize) {
        for (ch, slot) in bufs.iter_mut().enumerate().take(5) {
            if self.ch_enable & (1 << ch) == 0 {
                *slot = None;
            }
        }
        for j in 0..num {
            for (ch, slot) in bufs.iter_mut().enumerate().take(5) {
                if let Some(buf) = slot {
                    buf[j] +=
                        self.vol_adjusted_wave[ch][(self.count[ch] >> GETA_BITS) as usize & 0x1F];
                }
            }
            // Advance the chip-clock/2 counters to the next host sample.
            while self.realstep > self.scctime {
                self.scctime += self.sccstep;
                for ch in 0..5 {
                    if self.ch_enable & (1 << ch) != 0 {
                        self.count[ch] = self.count[ch].wrapping_add(self.incr[ch]);
                    }
                }
            }
            self.scctime -= self.realstep;
        }
    }

    fn peek_register(&self, reg: u16) -> u8 {
        self.mem_interface[(reg & 0xFF) as usize]
    }

    fn reset_core(&mut self) {
        self.mode = ChipMode::Real;
        self.deformation = 0;
        self.wave = [[0; 32]; 5];
        self.vol_adjusted_wave = [[0; 32]; 5];
        self.count = [0; 5];
        self.freq = [0; 5];
        self.incr = [0; 5];
        self.volume = [0; 5];
        self.ch_enable = 0xFF;
        self.cycle_4bit = false;
        self.cycle_8bit = false;
        self.refresh = false;
        self.scctime = 0;
        self.mem_interface = [0xFF; 256];
        for b in &mut self.mem_interface[..0x80] {
            *b = 0;
        }
        self.internal_mute = true;
    }
}

impl SoundUnit<Scc> {
    /// Time-stamped write through the cartridge window.
    pub fn write_register(&self, address: u8, value: u8, time: EmuTime) {
        self.sync(time);
        self.with(|c| c.write_mem(address, value));
    }

    /// Read through the cartridge window.
    pub fn read_register(&self, address: u8, _time: EmuTime) -> u8 {
        self.with(|c| c.read_mem(address))
    }

    /// Switch SCC / SCC-compatible / SCC+ mapping.
    pub fn set_chip_mode(&self, mode: ChipMode, time: EmuTime) {
        self.sync(time);
        self.with(|c| c.set_chip_mode(mode));
    }

    /// Snapshot for save states.
    pub fn save_state(&self) -> SccState {
        self.with(|c| c.save_state())
    }

    /// Restore a snapshot.
    pub fn restore_state(&self, state: &SccState) {
        self.with(|c| c.restore_state(state));
    }
}

/// Serializable SCC state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SccState {
    /// Mapping mode.
    pub mode: ChipMode,
    /// The five 32-byte waveforms.
    pub wave: Vec<Vec<i8>>,
    /// Phase accumulators.
    pub count: Vec<u32>,
    /// 12-bit frequency registers.
    pub freq: Vec<u16>,
    /// 4-bit volumes.
    pub volume: Vec<u8>,
    /// Channel enable mask.
    pub ch_enable: u8,
    /// Deformation register.
    pub deformation: u8,
    /// Rate-converter phase.
    pub scctime: u32,
}

impl Scc {
    /// Snapshot the dynamic state.
    pub fn save_state(&self) -> SccState {
        SccState {
            mode: self.mode,
            wave: self.wave.iter().map(|w| w.to_vec()).collect(),
            count: self.count.to_vec(),
            freq: self.freq.to_vec(),
            volume: self.volume.to_vec(),
            ch_enable: self.ch_enable,
            deformation: self.deformation,
            scctime: self.scctime,
        }
    }

    /// Rebuild derived tables from the snapshot.
    pub fn restore_state(&mut self, state: &SccState) {
        self.reset_core();
        self.set_chip_mode(state.mode);
        self.set_deform(state.deformation);
        for ch in 0..5 {
            for i in 0..32 {
                self.wave[ch][i] = state.wave[ch][i];
            }
            self.volume[ch] = state.volume[ch];
            self.freq[ch] = state.freq[ch];
            // Re-derive increments and volume-scaled waves.
            self.set_freq_vol((state.freq[ch] & 0xFF) as u8, (ch * 2) as u8);
            self.set_freq_vol((state.freq[ch] >> 8) as u8, (ch * 2 + 1) as u8);
            self.set_freq_vol(state.volume[ch], (0x0A + ch) as u8);
            self.count[ch] = state.count[ch];
        }
        self.set_freq_vol(state.ch_enable, 0x0F);
        self.scctime = state.scctime;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chip() -> Scc {
        let mut c = Scc {
            mode: ChipMode::Real,
            wave: [[0; 32]; 5],
            vol_adjusted_wave: [[0; 32]; 5],
            count: [0; 5],
            incr: [0; 5],
            freq: [0; 5],
            volume: [0; 5],
            ch_enable: 0xFF,
            deformation: 0,
            cycle_4bit: false,
            cycle_8bit: false,
            refresh: false,
            mem_interface: [0xFF; 256],
            sample_rate: 0,
            realstep: 0,
            scctime: 0,
            sccstep: (1u32 << 31) / (CLOCK_FREQ / 2),
            internal_mute: true,
        };
        c.reset_core();
        c.set_sample_rate(44_100);
        c
    }

    #[test]
    fn waveform_write_reads_back() {
        let mut c = chip();
        c.write_mem(0x00, 0x7F);
        c.write_mem(0x1F, 0x80);
        assert_eq!(c.read_mem(0x00), 0x7F);
        assert_eq!(c.wave[0][0], 127);
        assert_eq!(c.wave[0][31], -128);
    }

    #[test]
    fn channel4_shares_waveform_outside_plus_mode() {
        let mut c = chip();
        c.write_mem(0x60 + 3, 0x12); // channel 3 waveform
        assert_eq!(c.wave[4][3], 0x12);

        c.set_chip_mode(ChipMode::Plus);
        c.write_mem(0x60 + 4, 0x34);
        assert_eq!(c.wave[4][4], 0); // own waveform now
        c.write_mem(0x80 + 4, 0x56); // channel 5's own area
        assert_eq!(c.wave[4][4], 0x56);
    }

    #[test]
    fn mute_follows_volume_and_enable() {
        let mut c = chip();
        assert!(c.is_muted());
        c.write_mem(0x8A, 0x0F); // channel 0 volume
        assert!(!c.is_muted());
        c.write_mem(0x8F, 0x00); // all channels off
        assert!(c.is_muted());
    }

    #[test]
    fn tone_period_matches_divider() {
        let mut c = chip();
        // Square-ish wave: first half +100, second half -100.
        for i in 0..16 {
            c.write_mem(i, 100);
            c.write_mem(i + 16, 156); // -100 as u8
        }
        c.write_mem(0x80, 0xFF); // freq low
        c.write_mem(0x81, 0x00); // freq high -> divider 255
        c.write_mem(0x8A, 0x0F);
        c.write_mem(0x8F, 0x01);

        let n = 44_100;
        let mut buf = vec![0i32; n];
        let mut slots: Vec<Option<&mut [i32]>> =
            vec![Some(buf.as_mut_slice()), None, None, None, None];
        c.generate_channels(&mut slots, n);

        let mut edges = 0;
        for w in buf.windows(2) {
            if w[0] < 0 && w[1] > 0 {
                edges += 1;
            }
        }
        // f = clock / (32 * (frq + 1))
        let expected = CLOCK_FREQ as f64 / (32.0 * 256.0);
        assert!((edges as f64 - expected).abs() <= 2.0, "edges={edges}");
    }

    #[test]
    fn deform_register_is_retained() {
        let mut c = chip();
        c.write_mem(0xE0, 0x23);
        assert_eq!(c.deformation, 0x23);
        assert!(c.cycle_4bit);
        assert!(c.refresh);
        assert!(!c.cycle_8bit);
    }

    #[test]
    fn save_restore_round_trip() {
        let mut c = chip();
        c.write_mem(0x00, 42);
        c.write_mem(0x80, 0x23);
        c.write_mem(0x8A, 0x0C);
        c.write_mem(0x8F, 0x1F);
        let mut slots: Vec<Option<&mut [i32]>> = (0..5).map(|_| None).collect();
        c.generate_channels(&mut slots, 100);

        let state = c.save_state();
        let json = serde_json::to_string(&state).unwrap();
        let state2: SccState = serde_json::from_str(&json).unwrap();

        let mut d = chip();
        d.restore_state(&state2);
        assert_eq!(d.wave[0][0], 42);
        assert_eq!(d.freq[0], 0x23);
        assert_eq!(d.volume[0], 0x0C);
        assert_eq!(d.count[0], c.count[0]);
        assert_eq!(d.incr[0], c.incr[0]);
        assert!(!d.is_muted());
    }
}
