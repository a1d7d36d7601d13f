//! Y8950 ADPCM unit.
//!
//! 4-bit Yamaha delta PCM with 256 KiB sample RAM and 256 KiB sample ROM.
//! The pointer either replays autonomously between the start and stop
//! addresses or is pumped one byte at a time by the CPU through register
//! 0x0F (with the hardware's two dummy reads and BUF_RDY pulsing).

use super::{Y8950Status, StatusRegister};
use serde::{Deserialize, Serialize};

// Register 0x07 bits.
pub(super) const R07_RESET: u8 = 0x01;
pub(super) const R07_SP_OFF: u8 = 0x08;
pub(super) const R07_REPEAT: u8 = 0x10;
pub(super) const R07_MEMORY_DATA: u8 = 0x20;
pub(super) const R07_REC: u8 = 0x40;
pub(super) const R07_START: u8 = 0x80;
pub(super) const R07_MODE: u8 = 0xE0;

// Register 0x08 bits.
const R08_ROM: u8 = 0x01;
const R08_64K: u8 = 0x02;

const DIFF_MAX: i32 = 0x6000;
const DIFF_MIN: i32 = 0x7F;
const DIFF_DEFAULT: i32 = 0x7F;

const STEP_BITS: u32 = 16;
const STEP_MASK: u32 = (1 << STEP_BITS) - 1;

const SAMPLE_RAM: usize = 256 * 1024;
const SAMPLE_ROM: usize = 256 * 1024;

// Per-nibble deltas, from Yamaha's published decoder.
const F1: [i32; 16] = [
    1, 3, 5, 7, 9, 11, 13, 15, -1, -3, -5, -7, -9, -11, -13, -15,
];
const F2: [i32; 16] = [
    57, 57, 57, 57, 77, 102, 128, 153, 57, 57, 57, 57, 77, 102, 128, 153,
];

/// Predictor and replay-pointer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayData {
    mem_ptr: u32,
    now_step: u32,
    out: i32,
    output: i32,
    diff: i32,
    next_leveling: i32,
    sample_step: i32,
    adpcm_data: u8,
}

/// The ADPCM block of the Y8950.
pub struct Adpcm {
    ram: Vec<u8>,
    rom: Vec<u8>,
    start_addr: u32,
    stop_addr: u32,
    addr_mask: u32,
    reg7: u8,
    reg15: u8,
    read_delay: u8,
    rom_bank: bool,
    volume: i32,
    volume_w_step: i32,
    delta: u32,
    /// Delta scaled to the host sample rate.
    host_delta: u32,
    sample_rate: u32,
    play: PlayData,
}

impl Adpcm {
    pub(super) fn new() -> Self {
        Adpcm {
            ram: vec![0xFF; SAMPLE_RAM],
            rom: vec![0xFF; SAMPLE_ROM],
            start_addr: 0,
            stop_addr: 7,
            addr_mask: (1 << 18) - 1,
            reg7: 0,
            reg15: 0,
            read_delay: 0,
            rom_bank: false,
            volume: 0,
            volume_w_step: 0,
            delta: 0,
            host_delta: 0,
            sample_rate: 0,
            play: PlayData {
                mem_ptr: 0,
                now_step: 0,
                out: 0,
                output: 0,
                diff: DIFF_DEFAULT,
                next_leveling: 0,
                sample_step: 0,
                adpcm_data: 0,
            },
        }
    }

    pub(super) fn set_sample_rate(&mut self, rate: u32) {
        self.sample_rate = rate;
        self.update_host_delta();
    }

    fn update_host_delta(&mut self) {
        // Nibble clock is delta/2^16 of the chip's natural rate; scale it
        // to host samples.
        self.host_delta = (self.delta as f64 * super::CLOCK_FREQ as f64 / 72.0
            / self.sample_rate.max(1) as f64
            + 0.5) as u32;
    }

    pub(super) fn reset(&mut self, status: &mut StatusRegister) {
        self.start_addr = 0;
        self.stop_addr = 7;
        self.delta = 0;
        self.update_host_delta();
        self.addr_mask = (1 << 18) - 1;
        self.reg7 = 0;
        self.reg15 = 0;
        self.read_delay = 0;
        self.rom_bank = false;
        self.write_reg(0x12, 255, status);
        self.restart();
        status.set(Y8950Status::BUF_RDY);
    }

    pub(super) fn is_playing(&self) -> bool {
        self.reg7 & 0xC0 == 0x80
    }

    pub(super) fn is_muted(&self) -> bool {
        !self.is_playing() || (self.reg7 & R07_SP_OFF) != 0
    }

    fn restart(&mut self) {
        self.play.mem_ptr = self.start_addr;
        self.play.now_step = (1 << STEP_BITS) - self.delta;
        self.play.out = 0;
        self.play.output = 0;
        self.play.diff = DIFF_DEFAULT;
        self.play.next_leveling = 0;
        self.play.sample_step = 0;
        self.play.adpcm_data = 0;
    }

    /// Register write (0x07..=0x12 subset relevant to ADPCM).
    pub(super) fn write_reg(&mut self, rg: u8, data: u8, status: &mut StatusRegister) {
        match rg {
            0x07 => {
                self.reg7 = data;
                if self.reg7 & R07_START != 0 {
                    status.set(Y8950Status::PCM_BSY);
                } else {
                    status.reset(Y8950Status::PCM_BSY);
                }
                if self.reg7 & R07_RESET != 0 {
                    self.reg7 = 0;
                }
                if self.reg7 & R07_START != 0 {
                    self.restart();
                }
                if self.reg7 & R07_MEMORY_DATA != 0 {
                    // External memory access: two dummy reads follow.
                    self.play.mem_ptr = self.start_addr;
                    self.read_delay = 2;
                    if self.reg7 & 0xA0 == 0x20 {
                        status.set(Y8950Status::BUF_RDY);
                    }
                } else {
                    self.play.mem_ptr = 0;
                }
            }
            0x08 => {
                self.rom_bank = data & R08_ROM != 0;
                self.addr_mask = if data & R08_64K != 0 {
                    (1 << 16) - 1
                } else {
                    (1 << 18) - 1
                };
            }
            0x09 => self.start_addr = (self.start_addr & 0x7F807) | ((data as u32) << 3),
            0x0A => self.start_addr = (self.start_addr & 0x007FF) | ((data as u32) << 11),
            0x0B => self.stop_addr = (self.stop_addr & 0x7F807) | ((data as u32) << 3),
            0x0C => self.stop_addr = (self.stop_addr & 0x007FF) | ((data as u32) << 11),
            0x0F => self.write_data(data, status),
            0x10 => {
                self.delta = (self.delta & 0xFF00) | data as u32;
                self.volume_w_step = ((self.volume as i64 * self.delta as i64) >> STEP_BITS) as i32;
                self.update_host_delta();
            }
            0x11 => {
                self.delta = (self.delta & 0x00FF) | ((data as u32) << 8);
                self.volume_w_step = ((self.volume as i64 * self.delta as i64) >> STEP_BITS) as i32;
                self.update_host_delta();
            }
            0x12 => {
                self.volume = data as i32;
                self.volume_w_step = ((self.volume as i64 * self.delta as i64) >> STEP_BITS) as i32;
            }
            _ => {}
        }
    }

    fn write_data(&mut self, data: u8, status: &mut StatusRegister) {
        self.reg15 = data;
        if self.reg7 & R07_MODE == 0x60 {
            // External memory write, one byte (two nibbles) per poke.
            if self.read_delay != 0 {
                self.play.mem_ptr = self.start_addr;
                self.read_delay = 0;
            }
            if self.play.mem_ptr <= self.stop_addr {
                self.write_memory(self.play.mem_ptr, data);
                self.play.mem_ptr += 2;

                // The hardware takes ~10 master cycles to accept the byte;
                // modelled as an immediate BUF_RDY pulse.
                status.reset(Y8950Status::BUF_RDY);
                status.set(Y8950Status::BUF_RDY);

                if self.play.mem_ptr > self.stop_addr {
                    // Last byte: EOS rises together with BUF_RDY, and the
                    // pointer wraps for further writes.
                    status.set(Y8950Status::EOS);
                    self.play.mem_ptr = self.start_addr;
                }
            }
        } else if self.reg7 & R07_MODE == 0x80 {
            // Feeding synthesis from the CPU; buffer now full.
            status.reset(Y8950Status::BUF_RDY);
        }
    }

    /// Register 0x0F read with hardware side effects.
    pub(super) fn read_data(&mut self, status: &mut StatusRegister) -> u8 {
        if self.reg7 & R07_MODE == R07_MEMORY_DATA && self.read_delay != 0 {
            self.play.mem_ptr = self.start_addr;
        }
        let result = self.peek_data();
        if self.reg7 & R07_MODE == R07_MEMORY_DATA {
            if self.read_delay != 0 {
                // Two dummy reads before real data appears.
                self.read_delay -= 1;
                status.set(Y8950Status::BUF_RDY);
            } else if self.play.mem_ptr > self.stop_addr {
                status.set(Y8950Status::EOS);
            } else {
                self.play.mem_ptr += 2;
                status.reset(Y8950Status::BUF_RDY);
                status.set(Y8950Status::BUF_RDY);
            }
        }
        result
    }

    /// Re-evaluate BUF_RDY after an IRQ-flag reset: while transferring to
    /// or from sample memory, or with no function selected, the bit reads
    /// as set (the MSX-Audio BIOS detection depends on this).
    pub(super) fn reset_status_edge(&self, status: &mut StatusRegister) {
        let mode = self.reg7 & R07_MODE;
        if (mode & !R07_REC) == R07_MEMORY_DATA || mode == 0 {
            status.set(Y8950Status::BUF_RDY);
        }
    }

    /// Last decoded predictor value (introspection / tests).
    pub fn final_out(&self) -> i32 {
        self.play.out
    }

    pub(super) fn peek_data(&self) -> u8 {
        if self.reg7 & R07_MODE == R07_MEMORY_DATA {
            if self.read_delay != 0 {
                self.reg15
            } else if self.play.mem_ptr > self.stop_addr {
                0
            } else {
                self.read_memory(self.play.mem_ptr)
            }
        } else {
            0
        }
    }

    pub(super) fn peek_reg(&self, rg: u8) -> u8 {
        match rg {
            0x0F => self.peek_data(),
            // Decoded sample readback, high and low halves.
            0x13 => ((self.play.output >> 8) & 0xFF) as u8,
            0x14 => (self.play.output >> 16) as u8,
            _ => 0xFF,
        }
    }

    fn write_memory(&mut self, mem_ptr: u32, value: u8) {
        let addr = ((mem_ptr / 2) & self.addr_mask) as usize;
        if !self.rom_bank && addr < self.ram.len() {
            self.ram[addr] = value;
        }
    }

    fn read_memory(&self, mem_ptr: u32) -> u8 {
        let addr = ((mem_ptr / 2) & self.addr_mask) as usize;
        if self.rom_bank {
            self.rom.get(addr).copied().unwrap_or(0)
        } else {
            // Out-of-range reads return 0, as on the real machine.
            self.ram.get(addr).copied().unwrap_or(0)
        }
    }

    /// Direct sample-memory access (RAM bank).
    pub fn write_mem(&mut self, addr: u32, value: u8) {
        let a = (addr & self.addr_mask) as usize;
        if a < self.ram.len() {
            self.ram[a] = value;
        }
    }

    /// Direct sample-memory read (selected bank).
    pub fn read_mem(&self, addr: u32) -> u8 {
        let a = (addr & self.addr_mask) as usize;
        let bank = if self.rom_bank { &self.rom } else { &self.ram };
        bank.get(a).copied().unwrap_or(0)
    }

    /// Load data into the sample ROM bank.
    pub fn load_rom(&mut self, data: &[u8]) {
        let n = data.len().min(self.rom.len());
        self.rom[..n].copy_from_slice(&data[..n]);
    }

    /// One host sample of ADPCM output.
    pub(super) fn calc_sample(&mut self, status: &mut StatusRegister) -> i32 {
        if !self.is_playing() {
            return 0;
        }
        let output = self.step_sample(status);
        if self.reg7 & R07_SP_OFF != 0 {
            0
        } else {
            output
        }
    }

    fn step_sample(&mut self, status: &mut StatusRegister) -> i32 {
        self.play.now_step += self.host_delta;
        if self.play.now_step & !STEP_MASK != 0 {
            while self.play.now_step & !STEP_MASK != 0 {
                self.play.now_step -= 1 << STEP_BITS;
                if !self.consume_nibble(status) {
                    break;
                }
            }
            self.play.now_step &= STEP_MASK;
        } else {
            self.play.output += self.play.sample_step;
        }
        self.play.output >> 12
    }

    /// Decode one nibble; false when playback stopped.
    fn consume_nibble(&mut self, status: &mut StatusRegister) -> bool {
        let val = if self.play.mem_ptr & 1 == 0 {
            // Even nibble: fetch the next byte.
            if self.reg7 & R07_MEMORY_DATA != 0 {
                self.play.adpcm_data = self.read_memory(self.play.mem_ptr);
            } else {
                self.play.adpcm_data = self.reg15;
                // Ready for the CPU to push the next byte.
                status.set(Y8950Status::BUF_RDY);
            }
            (self.play.adpcm_data >> 4) as usize
        } else {
            (self.play.adpcm_data & 0x0F) as usize
        };

        let prev_out = self.play.out;
        self.play.out = (self.play.out + (self.play.diff * F1[val]) / 8)
            .clamp(i16::MIN as i32, i16::MAX as i32);
        self.play.diff = ((self.play.diff * F2[val]) / 64).clamp(DIFF_MIN, DIFF_MAX);

        let prev_leveling = self.play.next_leveling;
        self.play.next_leveling = (prev_out + self.play.out) / 2;
        let delta_leveling = self.play.next_leveling - prev_leveling;
        self.play.sample_step = delta_leveling * self.volume_w_step;
        let tmp = delta_leveling * ((self.volume * self.play.now_step as i32) >> STEP_BITS);
        self.play.output = prev_leveling * self.volume + tmp;

        self.play.mem_ptr += 1;
        if self.reg7 & R07_MEMORY_DATA != 0 && self.play.mem_ptr > self.stop_addr {
            // End of sample: EOS on every pass, even when looping.
            status.set(Y8950Status::EOS);
            if self.reg7 & R07_REPEAT != 0 {
                self.restart();
            } else {
                self.reg7 = 0;
                return false;
            }
        }
        true
    }

    pub(super) fn save_state(&self) -> AdpcmState {
        AdpcmState {
            ram: self.ram.clone(),
            start_addr: self.start_addr,
            stop_addr: self.stop_addr,
            addr_mask: self.addr_mask,
            reg7: self.reg7,
            reg15: self.reg15,
            read_delay: self.read_delay,
            rom_bank: self.rom_bank,
            volume: self.volume,
            delta: self.delta,
            play: self.play.clone(),
        }
    }

    pub(super) fn restore_state(&mut self, state: &AdpcmState) {
        let n = state.ram.len().min(self.ram.len());
        self.ram[..n].copy_from_slice(&state.ram[..n]);
        self.start_addr = state.start_addr;
        self.stop_addr = state.stop_addr;
        self.addr_mask = state.addr_mask;
        self.reg7 = state.reg7;
        self.reg15 = state.reg15;
        self.read_delay = state.read_delay;
        self.rom_bank = state.rom_bank;
        self.volume = state.volume;
        self.delta = state.delta;
        self.volume_w_step = ((self.volume as i64 * self.delta as i64) >> STEP_BITS) as i32;
        self.update_host_delta();
        self.play = state.play.clone();
    }
}

/// Serializable ADPCM state (sample RAM included; ROM is reloaded by the
/// machine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdpcmState {
    /// Sample RAM contents.
    pub ram: Vec<u8>,
    /// Start address (in nibble units).
    pub start_addr: u32,
    /// Stop address.
    pub stop_addr: u32,
    /// 64K/256K mask.
    pub addr_mask: u32,
    /// Register 0x07 latch.
    pub reg7: u8,
    /// Register 0x0F latch.
    pub reg15: u8,
    /// Dummy reads outstanding.
    pub read_delay: u8,
    /// ROM bank selected.
    pub rom_bank: bool,
    /// DAC volume.
    pub volume: i32,
    /// Delta-N.
    pub delta: u32,
    /// Predictor state.
    pub play: PlayData,
}
