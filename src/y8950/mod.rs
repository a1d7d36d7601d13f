//! Y8950 (MSX-AUDIO) emulation.
//!
//! An OPL2-style FM core — nine 2-operator channels with a rhythm mode —
//! paired with a 4-bit ADPCM sample unit, two interval timers, a status
//! register and a maskable IRQ output. The FM voice parameters live
//! directly in the register file (no preset patches).

pub mod adpcm;

pub use adpcm::{Adpcm, AdpcmState};

use crate::clock::EmuTime;
use crate::device::{ChannelMode, SoundDevice, SoundUnit};
use crate::emutimer::EmuTimer;
use crate::irq::IrqSink;
use crate::mixer::Mixer;
use crate::Result;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub(crate) const CLOCK_FREQ: u32 = 3_579_545;

// Phase generator: 10-bit sine under a 19-bit accumulator.
const PG_BITS: u32 = 10;
const PG_WIDTH: usize = 1 << PG_BITS;
const DP_BITS: u32 = 19;
const DP_WIDTH: i32 = 1 << DP_BITS;
const DP_BASE_BITS: u32 = DP_BITS - PG_BITS;

// Envelope: 9 bits at 0.1875 dB per step, 23-bit phase counter.
const EG_STEP: f64 = 0.1875;
const EG_BITS: u32 = 9;
const EG_DP_BITS: u32 = 23;
const EG_DP_WIDTH: i32 = 1 << EG_DP_BITS;

const TL_STEP: f64 = 0.75;
const SL_STEP: f64 = 3.0;

const DB_STEP: f64 = 0.1875;
const DB_MUTE: usize = 1 << 9;

const SLOT_AMP_BITS: u32 = 11;

const PM_PG_WIDTH: usize = 256;
const PM_DP_BITS: u32 = 16;
const PM_DP_WIDTH: i32 = 1 << PM_DP_BITS;
const AM_PG_WIDTH: usize = 256;
const AM_DP_BITS: u32 = 16;
const AM_DP_WIDTH: i32 = 1 << AM_DP_BITS;
const PM_AMP_BITS: u32 = 8;
const PM_AMP: f64 = 256.0;

const PM_SPEED: f64 = 6.4;
const PM_DEPTH: f64 = 13.75 / 2.0;
const PM_DEPTH2: f64 = 13.75;
const AM_SPEED: f64 = 3.7;
const AM_DEPTH: f64 = 1.0;
const AM_DEPTH2: f64 = 4.8;

const SLOT_BD1: usize = 12;
const SLOT_BD2: usize = 13;
const SLOT_HH: usize = 14;
const SLOT_SD: usize = 15;
const SLOT_TOM: usize = 16;
const SLOT_CYM: usize = 17;

bitflags! {
    /// Status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Y8950Status: u8 {
        /// ADPCM busy.
        const PCM_BSY = 0x01;
        /// ADPCM data buffer ready.
        const BUF_RDY = 0x08;
        /// End of sample.
        const EOS = 0x10;
        /// Timer 2 expired.
        const T2 = 0x20;
        /// Timer 1 expired.
        const T1 = 0x40;
        /// IRQ summary bit.
        const IRQ = 0x80;
    }
}

/// Status byte plus IRQ-line bookkeeping, shared between the FM core and
/// the ADPCM unit.
pub struct StatusRegister {
    status: u8,
    mask: u8,
    irq: Box<dyn IrqSink>,
}

impl StatusRegister {
    fn new(irq: Box<dyn IrqSink>) -> Self {
        StatusRegister {
            status: 0,
            mask: 0,
            irq,
        }
    }

    fn set(&mut self, flag: Y8950Status) {
        self.status |= flag.bits();
        if self.status & self.mask != 0 {
            self.status |= Y8950Status::IRQ.bits();
            self.irq.set();
        }
    }

    fn reset(&mut self, flag: Y8950Status) {
        self.status &= !flag.bits();
        if self.status & self.mask == 0 {
            self.status &= !Y8950Status::IRQ.bits();
            self.irq.reset();
        }
    }

    fn change_mask(&mut self, mask: u8) {
        self.mask = mask;
        self.status &= self.mask | Y8950Status::IRQ.bits();
        if self.status & self.mask != 0 {
            self.status |= Y8950Status::IRQ.bits();
            self.irq.set();
        } else {
            self.status &= !Y8950Status::IRQ.bits();
            self.irq.reset();
        }
    }

    fn read(&self) -> u8 {
        self.status
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Patch {
    am: bool,
    pm: bool,
    eg: bool,
    kr: u8,
    ml: u8,
    kl: u8,
    tl: u8,
    fb: u8,
    ar: u8,
    dr: u8,
    sl: u8,
    rr: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum EnvMode {
    Attack,
    Decay,
    SusHold,
    Sustine,
    Release,
    Finish,
}

struct StaticTables {
    full_sin: [u16; PG_WIDTH],
    ar_adjust: [u16; 1 << EG_BITS],
    tll: Box<[[[[i32; 4]; 64]; 8]; 16]>,
    rks: [[[i32; 2]; 8]; 2],
    sl: [i32; 16],
    pm: [[i32; PM_PG_WIDTH]; 2],
    am: [[i32; AM_PG_WIDTH]; 2],
}

fn static_tables() -> &'static StaticTables {
    static TABLES: OnceLock<StaticTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let lin2db = |d: f64| -> u16 {
            if d == 0.0 {
                (DB_MUTE - 1) as u16
            } else {
                ((-(20.0 * d.log10() / DB_STEP)) as usize).min(DB_MUTE - 1) as u16
            }
        };
        let mut full_sin = [0u16; PG_WIDTH];
        for i in 0..PG_WIDTH / 4 {
            full_sin[i] = lin2db((2.0 * std::f64::consts::PI * i as f64 / PG_WIDTH as f64).sin());
        }
        for i in 0..PG_WIDTH / 4 {
            full_sin[PG_WIDTH / 2 - 1 - i] = full_sin[i];
        }
        for i in 0..PG_WIDTH / 2 {
            full_sin[PG_WIDTH / 2 + i] = (2 * DB_MUTE) as u16 + full_sin[i];
        }

        let mut ar_adjust = [0u16; 1 << EG_BITS];
        ar_adjust[0] = 1 << EG_BITS;
        for i in 1..(1 << EG_BITS) {
            let e = (1 << EG_BITS) as f64;
            ar_adjust[i] = (((e - 1.0 - e * (i as f64).ln() / e.ln()) as i32) >> 1) as u16;
        }

        let db2 = |x: f64| (x * 2.0) as i32;
        let kl_table = [
            db2(0.000),
            db2(9.000),
            db2(12.000),
            db2(13.875),
            db2(15.000),
            db2(16.125),
            db2(16.875),
            db2(17.625),
            db2(18.000),
            db2(18.750),
            db2(19.125),
            db2(19.500),
            db2(19.875),
            db2(20.250),
            db2(20.625),
            db2(21.000),
        ];
        let align = |tl: i32| tl * (TL_STEP / EG_STEP) as i32;
        let mut tll = Box::new([[[[0i32; 4]; 64]; 8]; 16]);
        for fnum in 0..16 {
            for block in 0..8 {
                for tl in 0..64 {
                    for kl in 0..4 {
                        tll[fnum][block][tl][kl] = if kl == 0 {
                            align(tl as i32)
                        } else {
                            let tmp = kl_table[fnum] - db2(3.000) * (7 - block as i32);
                            if tmp <= 0 {
                                align(tl as i32)
                            } else {
                                ((tmp >> (3 - kl)) as f64 / EG_STEP) as i32 + align(tl as i32)
                            }
                        };
                    }
                }
            }
        }

        let mut rks = [[[0i32; 2]; 8]; 2];
        for (fnum9, row) in rks.iter_mut().enumerate() {
            for (block, cell) in row.iter_mut().enumerate() {
                cell[0] = (block >> 1) as i32;
                cell[1] = ((block << 1) + fnum9) as i32;
            }
        }

        let mut sl = [0i32; 16];
        for (i, v) in sl.iter_mut().enumerate() {
            let db = if i == 15 { 93.0 } else { 3.0 * i as f64 };
            *v = (((db / SL_STEP) as i32) * (SL_STEP / EG_STEP) as i32) << (EG_DP_BITS - EG_BITS);
        }

        let mut pm = [[0i32; PM_PG_WIDTH]; 2];
        let mut am = [[0i32; AM_PG_WIDTH]; 2];
        for i in 0..PM_PG_WIDTH {
            let s = (2.0 * std::f64::consts::PI * i as f64 / PM_PG_WIDTH as f64).sin();
            pm[0][i] = (PM_AMP * 2f64.powf(PM_DEPTH * s / 1200.0)) as i32;
            pm[1][i] = (PM_AMP * 2f64.powf(PM_DEPTH2 * s / 1200.0)) as i32;
            am[0][i] = (AM_DEPTH / 2.0 / DB_STEP * (1.0 + s)) as i32;
            am[1][i] = (AM_DEPTH2 / 2.0 / DB_STEP * (1.0 + s)) as i32;
        }

        StaticTables {
            full_sin,
            ar_adjust,
            tll,
            rks,
            sl,
            pm,
            am,
        }
    })
}

struct RateTables {
    dphase: Box<[[[i32; 16]; 8]; 1024]>,
    dphase_ar: [[i32; 16]; 16],
    dphase_dr: [[i32; 16]; 16],
    pm_dphase: i32,
    am_dphase: i32,
    rate: u32,
}

fn rate_adjust(x: f64, rate: u32) -> i32 {
    (x * CLOCK_FREQ as f64 / 72.0 / rate as f64 + 0.5) as i32
}

impl RateTables {
    fn new(rate: u32) -> Self {
        let ml_table: [i64; 16] = [
            1, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 20, 24, 24, 30, 30,
        ];
        let mut dphase = Box::new([[[0i32; 16]; 8]; 1024]);
        for fnum in 0..1024i64 {
            for block in 0..8 {
                for ml in 0..16 {
                    let base = ((fnum * ml_table[ml]) << block) >> (21 - DP_BITS);
                    dphase[fnum as usize][block][ml] = rate_adjust(base as f64, rate);
                }
            }
        }
        let mut dphase_ar = [[0i32; 16]; 16];
        for ar in 0..16usize {
            for rks in 0..16usize {
                let rm = (ar + (rks >> 2)).min(15);
                let rl = (rks & 3) as i64;
                dphase_ar[ar][rks] = match ar {
                    0 => 0,
                    15 => EG_DP_WIDTH,
                    _ => rate_adjust((3 * (rl + 4) * (1i64 << (rm + 1))) as f64, rate),
                };
            }
        }
        let mut dphase_dr = [[0i32; 16]; 16];
        for dr in 0..16usize {
            for rks in 0..16usize {
                let rm = (dr + (rks >> 2)).min(15);
                let rl = (rks & 3) as i64;
                dphase_dr[dr][rks] = match dr {
                    0 => 0,
                    _ => rate_adjust(((rl + 4) * (1i64 << (rm - 1))) as f64, rate),
                };
            }
        }
        let natural = CLOCK_FREQ as f64 / 72.0;
        RateTables {
            dphase,
            dphase_ar,
            dphase_dr,
            pm_dphase: rate_adjust(PM_SPEED * PM_DP_WIDTH as f64 / natural, rate),
            am_dphase: rate_adjust(AM_SPEED * AM_DP_WIDTH as f64 / natural, rate),
            rate,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Slot {
    patch: Patch,
    feedback: i32,
    output: [i32; 2],
    phase: i32,
    dphase: i32,
    pgout: i32,
    fnum: i32,
    block: i32,
    tll: i32,
    rks: i32,
    eg_mode: EnvMode,
    eg_phase: i32,
    eg_dphase: i32,
    egout: i32,
}

impl Slot {
    fn new() -> Self {
        Slot {
            patch: Patch::default(),
            feedback: 0,
            output: [0; 2],
            phase: 0,
            dphase: 0,
            pgout: 0,
            fnum: 0,
            block: 0,
            tll: 0,
            rks: 0,
            eg_mode: EnvMode::Finish,
            eg_phase: EG_DP_WIDTH,
            eg_dphase: 0,
            egout: 0,
        }
    }

    fn reset(&mut self) {
        *self = Slot::new();
    }

    fn calc_eg_dphase(&self, rt: &RateTables) -> i32 {
        let rks = self.rks as usize;
        match self.eg_mode {
            EnvMode::Attack => rt.dphase_ar[self.patch.ar as usize][rks],
            EnvMode::Decay => rt.dphase_dr[self.patch.dr as usize][rks],
            EnvMode::SusHold => 0,
            EnvMode::Sustine => rt.dphase_dr[self.patch.rr as usize][rks],
            EnvMode::Release => {
                if self.patch.eg {
                    rt.dphase_dr[self.patch.rr as usize][rks]
                } else {
                    rt.dphase_dr[7][rks]
                }
            }
            EnvMode::Finish => 0,
        }
    }

    fn update_pg(&mut self, rt: &RateTables) {
        self.dphase = rt.dphase[self.fnum as usize][self.block as usize][self.patch.ml as usize];
    }

    fn update_tll(&mut self) {
        self.tll = static_tables().tll[(self.fnum >> 6) as usize][self.block as usize]
            [self.patch.tl as usize][self.patch.kl as usize];
    }

    fn update_rks(&mut self) {
        self.rks = static_tables().rks[(self.fnum >> 9) as usize][self.block as usize]
            [self.patch.kr as usize];
    }

    fn update_eg(&mut self, rt: &RateTables) {
        self.eg_dphase = self.calc_eg_dphase(rt);
    }

    fn update_all(&mut self, rt: &RateTables) {
        self.update_pg(rt);
        self.update_tll();
        self.update_rks();
        self.update_eg(rt); // EG last: it reads rks
    }

    fn slot_on(&mut self) {
        self.eg_mode = EnvMode::Attack;
        self.phase = 0;
        self.eg_phase = 0;
    }

    fn slot_off(&mut self) {
        if self.eg_mode == EnvMode::Attack {
            let idx = (self.eg_phase >> (EG_DP_BITS - EG_BITS)) as usize & ((1 << EG_BITS) - 1);
            self.eg_phase = (static_tables().ar_adjust[idx] as i32) << (EG_DP_BITS - EG_BITS);
        }
        self.eg_mode = EnvMode::Release;
    }

    fn calc_phase(&mut self, lfo_pm: i32) -> i32 {
        if self.patch.pm {
            self.phase += (self.dphase * lfo_pm) >> PM_AMP_BITS;
        } else {
            self.phase += self.dphase;
        }
        self.phase &= DP_WIDTH - 1;
        self.phase >> DP_BASE_BITS
    }

    fn calc_envelope(&mut self, rt: &RateTables, lfo_am: i32) -> i32 {
        let tables = static_tables();
        let max = (1 << EG_BITS) - 1;
        let mut egout;
        match self.eg_mode {
            EnvMode::Attack => {
                self.eg_phase += self.eg_dphase;
                if EG_DP_WIDTH & self.eg_phase != 0 {
                    egout = 0;
                    self.eg_phase = 0;
                    self.eg_mode = EnvMode::Decay;
                    self.update_eg(rt);
                } else {
                    egout =
                        tables.ar_adjust[(self.eg_phase >> (EG_DP_BITS - EG_BITS)) as usize] as i32;
                }
            }
            EnvMode::Decay => {
                self.eg_phase += self.eg_dphase;
                egout = self.eg_phase >> (EG_DP_BITS - EG_BITS);
                if self.eg_phase >= tables.sl[self.patch.sl as usize] {
                    self.eg_phase = tables.sl[self.patch.sl as usize];
                    self.eg_mode = if self.patch.eg {
                        EnvMode::SusHold
                    } else {
                        EnvMode::Sustine
                    };
                    self.update_eg(rt);
                    egout = self.eg_phase >> (EG_DP_BITS - EG_BITS);
                }
            }
            EnvMode::SusHold => {
                egout = self.eg_phase >> (EG_DP_BITS - EG_BITS);
                if !self.patch.eg {
                    self.eg_mode = EnvMode::Sustine;
                    self.update_eg(rt);
                }
            }
            EnvMode::Sustine | EnvMode::Release => {
                self.eg_phase += self.eg_dphase;
                egout = self.eg_phase >> (EG_DP_BITS - EG_BITS);
                if egout >= max {
                    self.eg_mode = EnvMode::Finish;
                    egout = max;
                }
            }
            EnvMode::Finish => egout = max,
        }
        // EG and dB share the same step here; only TL needs aligning.
        egout += self.tll;
        if self.patch.am {
            egout += lfo_am;
        }
        egout.min(DB_MUTE as i32 - 1)
    }
}

fn wave2_4pi(e: i32) -> i32 {
    let shift = SLOT_AMP_BITS as i32 - PG_BITS as i32 - 1;
    if shift > 0 {
        e >> shift
    } else {
        e << -shift
    }
}

fn wave2_8pi(e: i32) -> i32 {
    let shift = SLOT_AMP_BITS as i32 - PG_BITS as i32 - 2;
    if shift > 0 {
        e >> shift
    } else {
        e << -shift
    }
}

fn db_pos(db: f64) -> i32 {
    (db / DB_STEP) as i32
}

fn db_neg(db: f64) -> i32 {
    (2 * DB_MUTE) as i32 + (db / DB_STEP) as i32
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Channel {
    alg: bool,
    mod_slot: Slot,
    car_slot: Slot,
}

impl Channel {
    fn new() -> Self {
        Channel {
            alg: false,
            mod_slot: Slot::new(),
            car_slot: Slot::new(),
        }
    }

    fn reset(&mut self) {
        self.mod_slot.reset();
        self.car_slot.reset();
        self.alg = false;
    }
}

/// Y8950 core.
pub struct Y8950 {
    regs: [u8; 0x100],
    channels: [Channel; 9],
    slot_on_flag: [u8; 18],
    rhythm_mode: bool,
    am_mode: usize,
    pm_mode: usize,
    pm_phase: i32,
    am_phase: i32,
    lfo_pm: i32,
    lfo_am: i32,
    noise_seed: u32,
    white_noise: i32,
    noise_a: i32,
    noise_b: i32,
    noise_a_phase: i32,
    noise_b_phase: i32,
    noise_a_dphase: i32,
    noise_b_dphase: i32,

    db2lin: [i16; 4 * DB_MUTE],
    rate_tables: Option<RateTables>,
    sample_rate: u32,
    internal_mute: bool,

    /// ADPCM block.
    pub adpcm: Adpcm,
    status: StatusRegister,
    timer1: EmuTimer,
    timer2: EmuTimer,
}

impl Y8950 {
    /// Create and register a Y8950.
    pub fn register(mixer: &Mixer, irq: Box<dyn IrqSink>) -> Result<SoundUnit<Y8950>> {
        let mut chip = Y8950::new(10_000, irq);
        chip.reset(EmuTime::zero());
        SoundUnit::register(mixer, chip, ChannelMode::Mono)
    }

    fn new(max_volume: i32, irq: Box<dyn IrqSink>) -> Self {
        let mut db2lin = [0i16; 4 * DB_MUTE];
        for i in 0..2 * DB_MUTE {
            let v = if i < DB_MUTE {
                (max_volume as f64 * 10f64.powf(-(i as f64) * DB_STEP / 20.0)) as i16
            } else {
                0
            };
            db2lin[i] = v;
            db2lin[i + 2 * DB_MUTE] = -v;
        }
        Y8950 {
            regs: [0; 0x100],
            channels: [Channel::new(); 9],
            slot_on_flag: [0; 18],
            rhythm_mode: false,
            am_mode: 0,
            pm_mode: 0,
            pm_phase: 0,
            am_phase: 0,
            lfo_pm: 0,
            lfo_am: 0,
            noise_seed: 0xFFFF,
            white_noise: 0,
            noise_a: 0,
            noise_b: 0,
            noise_a_phase: 0,
            noise_b_phase: 0,
            noise_a_dphase: 0,
            noise_b_dphase: 0,
            db2lin,
            rate_tables: None,
            sample_rate: 0,
            internal_mute: true,
            adpcm: Adpcm::new(),
            status: StatusRegister::new(irq),
            timer1: EmuTimer::opl_timer1(),
            timer2: EmuTimer::opl_timer2(),
        }
    }

    fn sync_timers(&mut self, time: EmuTime) {
        if self.timer1.sync(time) > 0 {
            self.status.set(Y8950Status::T1);
        }
        if self.timer2.sync(time) > 0 {
            self.status.set(Y8950Status::T2);
        }
    }

    fn rt(&self) -> &RateTables {
        self.rate_tables.as_ref().expect("sample rate set")
    }

    fn slot(&mut self, idx: usize) -> &mut Slot {
        let ch = idx / 2;
        if idx & 1 == 0 {
            &mut self.channels[ch].mod_slot
        } else {
            &mut self.channels[ch].car_slot
        }
    }

    fn update_slot<F>(&mut self, idx: usize, f: F)
    where
        F: FnOnce(&mut Slot, &RateTables),
    {
        let rt = self.rate_tables.take().expect("sample rate set");
        f(self.slot(idx), &rt);
        self.rate_tables = Some(rt);
    }

    fn key_on(&mut self, ch: usize) {
        self.channels[ch].mod_slot.slot_on();
        self.channels[ch].car_slot.slot_on();
    }

    fn key_off(&mut self, ch: usize) {
        self.channels[ch].mod_slot.slot_off();
        self.channels[ch].car_slot.slot_off();
    }

    fn key_on_rhythm(&mut self, slot: usize) {
        if self.slot_on_flag[slot] == 0 {
            self.slot(slot).slot_on();
        }
    }

    fn key_off_rhythm(&mut self, slot: usize) {
        if self.slot_on_flag[slot] != 0 {
            self.slot(slot).slot_off();
        }
    }

    fn set_fnumber(&mut self, ch: usize, fnum: i32) {
        self.channels[ch].mod_slot.fnum = fnum;
        self.channels[ch].car_slot.fnum = fnum;
    }

    fn set_block(&mut self, ch: usize, block: i32) {
        self.channels[ch].mod_slot.block = block;
        self.channels[ch].car_slot.block = block;
    }

    fn noise_dphase(&self, fnum: i32, block: i32) -> i32 {
        rate_adjust(((fnum as i64) << block) as f64, self.rt().rate)
    }

    fn refresh_noise_dphases(&mut self) {
        if self.rate_tables.is_none() {
            return;
        }
        let fnum_a = self.regs[0xA7] as i32 + (((self.regs[0xB7] & 3) as i32) << 8);
        let block_a = ((self.regs[0xB7] >> 2) & 7) as i32;
        self.noise_a_dphase = self.noise_dphase(fnum_a, block_a);
        let fnum_b = self.regs[0xA8] as i32 + (((self.regs[0xB8] & 3) as i32) << 8);
        let block_b = ((self.regs[0xB8] >> 2) & 7) as i32;
        self.noise_b_dphase = self.noise_dphase(fnum_b, block_b);
    }

    fn refresh_slot_on_flags(&mut self) {
        let rbd = self.regs[0xBD];
        if self.rhythm_mode {
            self.slot_on_flag[SLOT_BD1] = (rbd & 0x10) | (self.regs[0xB6] & 0x20);
            self.slot_on_flag[SLOT_BD2] = (rbd & 0x10) | (self.regs[0xB6] & 0x20);
            self.slot_on_flag[SLOT_SD] = (rbd & 0x08) | (self.regs[0xB7] & 0x20);
            self.slot_on_flag[SLOT_HH] = (rbd & 0x01) | (self.regs[0xB7] & 0x20);
            self.slot_on_flag[SLOT_TOM] = (rbd & 0x04) | (self.regs[0xB8] & 0x20);
            self.slot_on_flag[SLOT_CYM] = (rbd & 0x02) | (self.regs[0xB8] & 0x20);
        } else {
            for ch in 6..9 {
                let on = self.regs[0xB0 + ch] & 0x20;
                self.slot_on_flag[ch * 2] = on;
                self.slot_on_flag[ch * 2 + 1] = on;
            }
        }
    }

    /// Register write at the chip level (timers and ADPCM use `time`).
    pub fn write(&mut self, rg: u8, data: u8, time: EmuTime) {
        const STBL: [i8; 32] = [
            0, 2, 4, 1, 3, 5, -1, -1, 6, 8, 10, 7, 9, 11, -1, -1, 12, 14, 16, 13, 15, 17, -1, -1,
            -1, -1, -1, -1, -1, -1, -1, -1,
        ];
        let rg = rg as usize;
        if rg < 0x20 {
            match rg {
                0x01 => {} // test register
                0x02 => {
                    self.sync_timers(time);
                    self.timer1.set_value(data as u32);
                }
                0x03 => {
                    self.sync_timers(time);
                    self.timer2.set_value(data as u32);
                }
                0x04 => {
                    self.sync_timers(time);
                    if data & 0x80 != 0 {
                        // IRQ reset clears every flag.
                        self.status.reset(Y8950Status::from_bits_retain(0x78));
                        self.adpcm.reset_status_edge(&mut self.status);
                    } else {
                        self.status.change_mask(!data & 0x78);
                        self.timer1.set_start(data & 0x01 != 0, time);
                        self.timer2.set_start(data & 0x02 != 0, time);
                    }
                }
                0x07..=0x12 => self.adpcm.write_reg(rg as u8, data, &mut self.status),
                _ => {}
            }
            self.regs[rg] = data;
        } else if rg < 0x40 {
            if let Some(s) = stbl_slot(&STBL, rg - 0x20) {
                let slot = self.slot(s);
                slot.patch.am = data & 0x80 != 0;
                slot.patch.pm = data & 0x40 != 0;
                slot.patch.eg = data & 0x20 != 0;
                slot.patch.kr = (data >> 4) & 1;
                slot.patch.ml = data & 15;
                self.update_slot(s, |sl, rt| sl.update_all(rt));
            }
            self.regs[rg] = data;
        } else if rg < 0x60 {
            if let Some(s) = stbl_slot(&STBL, rg - 0x40) {
                let slot = self.slot(s);
                slot.patch.kl = (data >> 6) & 3;
                slot.patch.tl = data & 63;
                self.update_slot(s, |sl, rt| sl.update_all(rt));
            }
            self.regs[rg] = data;
        } else if rg < 0x80 {
            if let Some(s) = stbl_slot(&STBL, rg - 0x60) {
                let slot = self.slot(s);
                slot.patch.ar = (data >> 4) & 15;
                slot.patch.dr = data & 15;
                self.update_slot(s, |sl, rt| sl.update_eg(rt));
            }
            self.regs[rg] = data;
        } else if rg < 0xA0 {
            if let Some(s) = stbl_slot(&STBL, rg - 0x80) {
                let slot = self.slot(s);
                slot.patch.sl = (data >> 4) & 15;
                slot.patch.rr = data & 15;
                self.update_slot(s, |sl, rt| sl.update_eg(rt));
            }
            self.regs[rg] = data;
        } else if (0xA0..0xA9).contains(&rg) {
            let ch = rg - 0xA0;
            let fnum = data as i32 + (((self.regs[rg + 0x10] & 3) as i32) << 8);
            self.set_fnumber(ch, fnum);
            self.update_slot(ch * 2, |sl, rt| sl.update_all(rt));
            self.update_slot(ch * 2 + 1, |sl, rt| sl.update_all(rt));
            self.regs[rg] = data;
            self.refresh_noise_dphases();
        } else if (0xB0..0xB9).contains(&rg) {
            let ch = rg - 0xB0;
            let fnum = (((data & 3) as i32) << 8) + self.regs[rg - 0x10] as i32;
            self.set_fnumber(ch, fnum);
            self.set_block(ch, ((data >> 2) & 7) as i32);
            if self.regs[rg] & 0x20 == 0 && data & 0x20 != 0 {
                self.key_on(ch);
            } else if data & 0x20 == 0 && self.regs[rg] & 0x20 != 0 {
                self.key_off(ch);
            }
            self.update_slot(ch * 2, |sl, rt| sl.update_all(rt));
            self.update_slot(ch * 2 + 1, |sl, rt| sl.update_all(rt));
            self.regs[rg] = data;
            self.refresh_slot_on_flags();
            self.refresh_noise_dphases();
        } else if (0xC0..0xC9).contains(&rg) {
            let ch = rg - 0xC0;
            self.channels[ch].mod_slot.patch.fb = (data >> 1) & 7;
            self.channels[ch].alg = data & 1 != 0;
            self.regs[rg] = data;
        } else if rg == 0xBD {
            self.am_mode = ((data >> 7) & 1) as usize;
            self.pm_mode = ((data >> 6) & 1) as usize;
            // Flags reflect the state before this write so key edges can
            // be detected; the key handlers guard on them per slot.
            self.refresh_slot_on_flags();
            self.rhythm_mode = data & 0x20 != 0;
            if self.rhythm_mode {
                // Bit order: BD, SD, TOM, top cymbal, hi-hat.
                if data & 0x10 != 0 {
                    self.key_on_rhythm(SLOT_BD1);
                    self.key_on_rhythm(SLOT_BD2);
                } else {
                    self.key_off_rhythm(SLOT_BD1);
                    self.key_off_rhythm(SLOT_BD2);
                }
                if data & 0x08 != 0 {
                    self.key_on_rhythm(SLOT_SD);
                } else {
                    self.key_off_rhythm(SLOT_SD);
                }
                if data & 0x04 != 0 {
                    self.key_on_rhythm(SLOT_TOM);
                } else {
                    self.key_off_rhythm(SLOT_TOM);
                }
                if data & 0x02 != 0 {
                    self.key_on_rhythm(SLOT_CYM);
                } else {
                    self.key_off_rhythm(SLOT_CYM);
                }
                if data & 0x01 != 0 {
                    self.key_on_rhythm(SLOT_HH);
                } else {
                    self.key_off_rhythm(SLOT_HH);
                }
            }
            self.regs[rg] = data;
        } else {
            self.regs[rg] = data;
        }
        self.check_mute();
    }

    /// Register read with side effects (register 0x0F advances the memory
    /// pointer).
    pub fn read_reg(&mut self, rg: u8, time: EmuTime) -> u8 {
        self.sync_timers(time);
        match rg {
            0x0F => self.adpcm.read_data(&mut self.status),
            0x13 | 0x14 => self.adpcm.peek_reg(rg),
            _ => self.regs[rg as usize],
        }
    }

    /// Status register.
    pub fn read_status(&mut self, time: EmuTime) -> u8 {
        self.sync_timers(time);
        self.status.read()
    }

    /// Hardware reset at `time`.
    pub fn reset(&mut self, time: EmuTime) {
        for ch in &mut self.channels {
            ch.reset();
        }
        self.rhythm_mode = false;
        self.am_mode = 0;
        self.pm_mode = 0;
        self.pm_phase = 0;
        self.am_phase = 0;
        self.noise_seed = 0xFFFF;
        self.noise_a_phase = 0;
        self.noise_b_phase = 0;
        self.noise_a_dphase = 0;
        self.noise_b_dphase = 0;
        self.slot_on_flag = [0; 18];
        self.regs = [0; 0x100];
        self.regs[0x04] = 0x18;
        self.status.change_mask(!0x18 & 0x78);
        if self.rate_tables.is_some() {
            for rg in 0x20..=0xC8u32 {
                self.write(rg as u8, 0, time);
            }
        }
        self.adpcm.reset(&mut self.status);
        self.internal_mute = true;
    }

    fn update_ampm(&mut self) {
        let (pm_dphase, am_dphase) = {
            let rt = self.rt();
            (rt.pm_dphase, rt.am_dphase)
        };
        self.pm_phase = (self.pm_phase + pm_dphase) & (PM_DP_WIDTH - 1);
        self.am_phase = (self.am_phase + am_dphase) & (AM_DP_WIDTH - 1);
        let t = static_tables();
        self.lfo_am = t.am[self.am_mode][(self.am_phase >> (AM_DP_BITS - 8)) as usize];
        self.lfo_pm = t.pm[self.pm_mode][(self.pm_phase >> (PM_DP_BITS - 8)) as usize];
    }

    fn update_noise(&mut self) {
        // 16-bit LFSR plus the two tuned noise phases for the rhythm
        // section.
        self.noise_seed =
            ((self.noise_seed >> 15) ^ ((self.noise_seed >> 12) & 1)) | ((self.noise_seed << 1) & 0xFFFF);
        self.white_noise = if self.noise_seed & 1 != 0 {
            db_pos(6.0)
        } else {
            db_neg(6.0)
        };

        self.noise_a_phase = (self.noise_a_phase + self.noise_a_dphase) & ((0x40 << 11) - 1);
        if (self.noise_a_phase >> 11) == 0x3F {
            self.noise_a_phase = 0;
        }
        self.noise_a = if self.noise_a_phase & (0x03 << 11) != 0 {
            db_pos(6.0)
        } else {
            db_neg(6.0)
        };

        self.noise_b_phase = (self.noise_b_phase + self.noise_b_dphase) & ((0x10 << 11) - 1);
        self.noise_b = if self.noise_b_phase & (0x0A << 11) != 0 {
            db_pos(6.0)
        } else {
            db_neg(6.0)
        };
    }

    fn db2lin(&self, idx: i32) -> i32 {
        self.db2lin[idx as usize] as i32
    }

    fn calc_slot_mod(&mut self, ch: usize) -> i32 {
        let rt = self.rate_tables.take().expect("sample rate set");
        let (lfo_am, lfo_pm) = (self.lfo_am, self.lfo_pm);
        let slot = &mut self.channels[ch].mod_slot;
        slot.output[1] = slot.output[0];
        slot.egout = slot.calc_envelope(&rt, lfo_am);
        slot.pgout = slot.calc_phase(lfo_pm);
        let sin_idx = if slot.egout >= DB_MUTE as i32 - 1 {
            None
        } else if slot.patch.fb != 0 {
            let fm = wave2_4pi(slot.feedback) >> (7 - slot.patch.fb);
            Some((slot.pgout + fm) & (PG_WIDTH as i32 - 1))
        } else {
            Some(slot.pgout)
        };
        self.rate_tables = Some(rt);
        let egout = self.channels[ch].mod_slot.egout;
        let out = match sin_idx {
            None => 0,
            Some(i) => {
                self.db2lin(static_tables().full_sin[i as usize] as i32 + egout)
            }
        };
        let slot = &mut self.channels[ch].mod_slot;
        slot.output[0] = out;
        slot.feedback = (slot.output[1] + slot.output[0]) >> 1;
        slot.feedback
    }

    fn calc_slot_car(&mut self, ch: usize, fm: i32) -> i32 {
        let rt = self.rate_tables.take().expect("sample rate set");
        let (lfo_am, lfo_pm) = (self.lfo_am, self.lfo_pm);
        let slot = &mut self.channels[ch].car_slot;
        slot.egout = slot.calc_envelope(&rt, lfo_am);
        slot.pgout = slot.calc_phase(lfo_pm);
        let (egout, pgout) = (slot.egout, slot.pgout);
        self.rate_tables = Some(rt);
        if egout >= DB_MUTE as i32 - 1 {
            self.channels[ch].car_slot.output[0] = 0;
            return 0;
        }
        let idx = (pgout + wave2_8pi(fm)) & (PG_WIDTH as i32 - 1);
        let out = self.db2lin(static_tables().full_sin[idx as usize] as i32 + egout);
        self.channels[ch].car_slot.output[0] = out;
        out
    }

    fn calc_slot_tom(&mut self, ch: usize) -> i32 {
        let rt = self.rate_tables.take().expect("sample rate set");
        let (lfo_am, lfo_pm) = (self.lfo_am, self.lfo_pm);
        let slot = &mut self.channels[ch].mod_slot;
        slot.egout = slot.calc_envelope(&rt, lfo_am);
        slot.pgout = slot.calc_phase(lfo_pm);
        let (egout, pgout) = (slot.egout, slot.pgout);
        self.rate_tables = Some(rt);
        if egout >= DB_MUTE as i32 - 1 {
            0
        } else {
            self.db2lin(static_tables().full_sin[pgout as usize] as i32 + egout)
        }
    }

    fn calc_slot_snare(&mut self, ch: usize) -> i32 {
        let rt = self.rate_tables.take().expect("sample rate set");
        let (lfo_am, lfo_pm) = (self.lfo_am, self.lfo_pm);
        let slot = &mut self.channels[ch].car_slot;
        slot.egout = slot.calc_envelope(&rt, lfo_am);
        slot.pgout = slot.calc_phase(lfo_pm);
        let (egout, pgout) = (slot.egout, slot.pgout);
        self.rate_tables = Some(rt);
        if egout >= DB_MUTE as i32 - 1 {
            return 0;
        }
        let wn = self.white_noise;
        if pgout & (1 << (PG_BITS - 1)) != 0 {
            (self.db2lin(egout) + self.db2lin(egout + wn)) >> 1
        } else {
            (self.db2lin(2 * DB_MUTE as i32 + egout) + self.db2lin(egout + wn)) >> 1
        }
    }

    fn calc_slot_cym(&mut self, ch: usize) -> i32 {
        let rt = self.rate_tables.take().expect("sample rate set");
        let lfo_am = self.lfo_am;
        let slot = &mut self.channels[ch].car_slot;
        slot.egout = slot.calc_envelope(&rt, lfo_am);
        let egout = slot.egout;
        self.rate_tables = Some(rt);
        if egout >= DB_MUTE as i32 - 1 {
            0
        } else {
            (self.db2lin(egout + self.noise_a) + self.db2lin(egout + self.noise_b)) >> 1
        }
    }

    fn calc_slot_hat(&mut self, ch: usize) -> i32 {
        let rt = self.rate_tables.take().expect("sample rate set");
        let lfo_am = self.lfo_am;
        let slot = &mut self.channels[ch].mod_slot;
        slot.egout = slot.calc_envelope(&rt, lfo_am);
        let egout = slot.egout;
        self.rate_tables = Some(rt);
        if egout >= DB_MUTE as i32 - 1 {
            0
        } else {
            (self.db2lin(egout + self.white_noise)
                + self.db2lin(egout + self.noise_a)
                + self.db2lin(egout + self.noise_b))
                >> 2
        }
    }

    fn calc_channel(&mut self, ch: usize) -> i32 {
        if self.channels[ch].alg {
            // Additive: carrier plays unmodulated beside the modulator.
            let m = self.calc_slot_mod(ch);
            self.calc_slot_car(ch, 0) + m
        } else {
            let fm = self.calc_slot_mod(ch);
            self.calc_slot_car(ch, fm)
        }
    }

    fn check_mute(&mut self) {
        self.internal_mute = self.check_mute_helper() && self.adpcm.is_muted();
    }

    fn check_mute_helper(&self) -> bool {
        for ch in 0..6 {
            if self.channels[ch].car_slot.eg_mode != EnvMode::Finish {
                return false;
            }
        }
        if !self.rhythm_mode {
            for ch in 6..9 {
                if self.channels[ch].car_slot.eg_mode != EnvMode::Finish {
                    return false;
                }
            }
        } else {
            if self.channels[6].car_slot.eg_mode != EnvMode::Finish {
                return false;
            }
            if self.channels[7].mod_slot.eg_mode != EnvMode::Finish {
                return false;
            }
            if self.channels[7].car_slot.eg_mode != EnvMode::Finish {
                return false;
            }
            if self.channels[8].mod_slot.eg_mode != EnvMode::Finish {
                return false;
            }
            if self.channels[8].car_slot.eg_mode != EnvMode::Finish {
                return false;
            }
        }
        true
    }
}

fn stbl_slot(stbl: &[i8; 32], off: usize) -> Option<usize> {
    match stbl[off & 0x1F] {
        -1 => None,
        s => Some(s as usize),
    }
}

impl SoundDevice for Y8950 {
    fn name(&self) -> &'static str {
        "Y8950"
    }

    fn num_channels(&self) -> usize {
        10 // 9 FM + 1 ADPCM
    }

    fn input_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_sample_rate(&mut self, host_rate: u32) {
        self.sample_rate = host_rate;
        self.rate_tables = Some(RateTables::new(host_rate));
        self.adpcm.set_sample_rate(host_rate);
    }

    fn amplification_factor(&self) -> f32 {
        1.0
    }

    fn is_muted(&self) -> bool {
        self.internal_mute
    }

    fn generate_channels(&mut self, bufs: &mut [Option<&mut [i32]>], num: usize) {
        for j in 0..num {
            self.update_ampm();
            self.update_noise();

            for ch in 0..6 {
                if self.channels[ch].car_slot.eg_mode != EnvMode::Finish {
                    let v = self.calc_channel(ch);
                    if let Some(buf) = &mut bufs[ch] {
                        buf[j] += v;
                    }
                }
            }
            if !self.rhythm_mode {
                for ch in 6..9 {
                    if self.channels[ch].car_slot.eg_mode != EnvMode::Finish {
                        let v = self.calc_channel(ch);
                        if let Some(buf) = &mut bufs[ch] {
                            buf[j] += v;
                        }
                    }
                }
            } else {
                if self.channels[6].car_slot.eg_mode != EnvMode::Finish {
                    let fm = self.calc_slot_mod(6);
                    let v = 2 * self.calc_slot_car(6, fm);
                    if let Some(buf) = &mut bufs[6] {
                        buf[j] += v;
                    }
                }
                let mut ch7 = 0;
                if self.channels[7].mod_slot.eg_mode != EnvMode::Finish {
                    ch7 += 2 * self.calc_slot_hat(7);
                }
                if self.channels[7].car_slot.eg_mode != EnvMode::Finish {
                    ch7 += 2 * self.calc_slot_snare(7);
                }
                if ch7 != 0 {
                    if let Some(buf) = &mut bufs[7] {
                        buf[j] += ch7;
                    }
                }
                let mut ch8 = 0;
                if self.channels[8].mod_slot.eg_mode != EnvMode::Finish {
                    ch8 += 2 * self.calc_slot_tom(8);
                }
                if self.channels[8].car_slot.eg_mode != EnvMode::Finish {
                    ch8 += 2 * self.calc_slot_cym(8);
                }
                if ch8 != 0 {
                    if let Some(buf) = &mut bufs[8] {
                        buf[j] += ch8;
                    }
                }
            }

            let pcm = self.adpcm.calc_sample(&mut self.status);
            if pcm != 0 {
                if let Some(buf) = &mut bufs[9] {
                    buf[j] += pcm;
                }
            }
        }
        self.check_mute();
    }

    fn peek_register(&self, reg: u16) -> u8 {
        let rg = (reg & 0xFF) as u8;
        match rg {
            0x0F | 0x13 | 0x14 => self.adpcm.peek_reg(rg),
            _ => self.regs[rg as usize],
        }
    }

    fn reset_core(&mut self) {
        self.reset(EmuTime::zero());
    }
}

impl SoundUnit<Y8950> {
    /// Time-stamped register write.
    pub fn write_register(&self, reg: u8, value: u8, time: EmuTime) {
        self.sync(time);
        self.with(|c| c.write(reg, value, time));
    }

    /// Time-stamped register read (register 0x0F has side effects).
    pub fn read_register(&self, reg: u8, time: EmuTime) -> u8 {
        self.sync(time);
        self.with(|c| c.read_reg(reg, time))
    }

    /// Status register read. Syncs the stream so ADPCM flags (EOS,
    /// BUF_RDY) are current.
    pub fn read_status(&self, time: EmuTime) -> u8 {
        self.sync(time);
        self.with(|c| c.read_status(time))
    }

    /// Snapshot for save states.
    pub fn save_state(&self) -> Y8950State {
        self.with(|c| {
            let mut slots = Vec::with_capacity(18);
            for ch in &c.channels {
                for slot in [&ch.mod_slot, &ch.car_slot] {
                    slots.push((slot.phase, slot.eg_phase, slot.eg_mode as u8, slot.feedback));
                }
            }
            Y8950State {
                regs: c.regs.to_vec(),
                slots,
                lfo: (c.pm_phase, c.am_phase),
                noise: (c.noise_seed, c.noise_a_phase, c.noise_b_phase),
                status: c.status.status,
                adpcm: c.adpcm.save_state(),
            }
        })
    }

    /// Restore a snapshot.
    pub fn restore_state(&self, state: &Y8950State) {
        self.with(|c| {
            let t = EmuTime::zero();
            c.reset(t);
            for rg in 0x20..=0xC8u32 {
                c.write(rg as u8, state.regs[rg as usize], t);
            }
            c.write(0xBD, state.regs[0xBD], t);
            const MODES: [EnvMode; 6] = [
                EnvMode::Attack,
                EnvMode::Decay,
                EnvMode::SusHold,
                EnvMode::Sustine,
                EnvMode::Release,
                EnvMode::Finish,
            ];
            for i in 0..18 {
                let (phase, eg_phase, mode, feedback) = state.slots[i];
                c.update_slot(i, |s, rt| {
                    s.phase = phase;
                    s.eg_phase = eg_phase;
                    s.eg_mode = MODES[(mode as usize).min(5)];
                    s.feedback = feedback;
                    s.update_eg(rt);
                });
            }
            let (pm, am) = state.lfo;
            c.pm_phase = pm;
            c.am_phase = am;
            let (seed, na, nb) = state.noise;
            c.noise_seed = seed;
            c.noise_a_phase = na;
            c.noise_b_phase = nb;
            c.status.status = state.status;
            c.adpcm.restore_state(&state.adpcm);
            c.check_mute();
        });
    }
}

/// Serializable Y8950 state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Y8950State {
    /// Register file.
    pub regs: Vec<u8>,
    /// Per-slot (phase, eg_phase, eg_mode, feedback), mod/car per channel.
    pub slots: Vec<(i32, i32, u8, i32)>,
    /// LFO phases (PM, AM).
    pub lfo: (i32, i32),
    /// Noise LFSR and rhythm noise phases.
    pub noise: (u32, i32, i32),
    /// Status byte.
    pub status: u8,
    /// ADPCM unit state.
    pub adpcm: AdpcmState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::EmuDuration;
    use crate::irq::NullIrq;

    fn chip() -> Y8950 {
        let mut c = Y8950::new(10_000, Box::new(NullIrq));
        c.set_sample_rate(44_100);
        c.reset(EmuTime::zero());
        c
    }

    fn gen(c: &mut Y8950, n: usize) -> Vec<Vec<i32>> {
        let mut bufs = vec![vec![0i32; n]; 10];
        let mut slots: Vec<Option<&mut [i32]>> =
            bufs.iter_mut().map(|b| Some(b.as_mut_slice())).collect();
        c.generate_channels(&mut slots, n);
        bufs
    }

    fn t0() -> EmuTime {
        EmuTime::zero()
    }

    fn setup_fm_voice(c: &mut Y8950) {
        // Channel 0: modulator = slot reg 0x00, carrier = slot reg 0x03.
        c.write(0x20, 0x01, t0());
        c.write(0x23, 0x01, t0());
        c.write(0x40, 0x3F, t0()); // mod TL max
        c.write(0x43, 0x00, t0()); // car TL 0
        c.write(0x60, 0xF2, t0());
        c.write(0x63, 0xF2, t0());
        c.write(0x80, 0x27, t0());
        c.write(0x83, 0x27, t0());
        c.write(0xA0, 0x45, t0());
        c.write(0xB0, 0x2A, t0()); // key on, block 2
    }

    #[test]
    fn fm_voice_sounds_and_releases() {
        let mut c = chip();
        assert!(c.is_muted());
        setup_fm_voice(&mut c);
        assert!(!c.is_muted());
        let bufs = gen(&mut c, 4096);
        assert!(bufs[0].iter().any(|&s| s != 0));
        assert!(bufs[1].iter().all(|&s| s == 0));
        c.write(0xB0, 0x0A, t0()); // key off
        gen(&mut c, 44_100);
        assert!(c.is_muted());
    }

    #[test]
    fn buf_rdy_set_after_reset() {
        let mut c = chip();
        assert_ne!(c.read_status(t0()) & Y8950Status::BUF_RDY.bits(), 0);
    }

    #[test]
    fn adpcm_cpu_write_then_replay_sets_eos() {
        let mut c = chip();
        // Program an 8-byte window at RAM address 0.
        c.write(0x08, 0x00, t0());
        c.write(0x09, 0x00, t0());
        c.write(0x0A, 0x00, t0());
        c.write(0x0B, 0x01, t0()); // stop = 8 bytes (15 nibbles span)
        c.write(0x0C, 0x00, t0());
        // Memory-write mode, then push 8 bytes.
        c.write(0x07, 0x60, t0());
        for i in 0..8 {
            c.write(0x0F, 0x11 * (i as u8 + 1), t0());
        }
        // Replay: delta at full rate, volume max, start.
        c.write(0x10, 0xFF, t0());
        c.write(0x11, 0xFF, t0());
        c.write(0x12, 0xFF, t0());
        c.write(0x07, 0xA0, t0());
        assert_ne!(c.read_status(t0()) & Y8950Status::PCM_BSY.bits(), 0);

        let bufs = gen(&mut c, 512);
        assert!(bufs[9].iter().any(|&s| s != 0));
        assert_ne!(c.read_status(t0()) & Y8950Status::EOS.bits(), 0);
    }

    #[test]
    fn adpcm_decoder_matches_reference() {
        // Reference predictor per the published decoder tables.
        fn reference(nibbles: &[u8]) -> Vec<i32> {
            let f1 = [1, 3, 5, 7, 9, 11, 13, 15, -1, -3, -5, -7, -9, -11, -13, -15];
            let f2 = [57, 57, 57, 57, 77, 102, 128, 153, 57, 57, 57, 57, 77, 102, 128, 153];
            let mut out = 0i32;
            let mut diff = 0x7F;
            let mut res = Vec::new();
            for &n in nibbles {
                out = (out + (diff * f1[n as usize]) / 8).clamp(-32768, 32767);
                diff = ((diff * f2[n as usize]) / 64).clamp(0x7F, 0x6000);
                res.push(out);
            }
            res
        }

        let mut c = chip();
        c.write(0x08, 0x00, t0());
        c.write(0x09, 0x00, t0());
        c.write(0x0A, 0x00, t0());
        c.write(0x0B, 0x00, t0()); // stop stays at nibble 7: exactly 4 bytes
        c.write(0x0C, 0x00, t0());
        c.write(0x07, 0x60, t0());
        let data = [0x12u8, 0x34, 0x56, 0x70];
        for &b in &data {
            c.write(0x0F, b, t0());
        }
        c.write(0x10, 0xFF, t0());
        c.write(0x11, 0x7F, t0()); // half-ish rate
        c.write(0x12, 0xFF, t0());
        c.write(0x07, 0xA0, t0());

        // Consume enough samples to decode all nibbles, tracking the raw
        // predictor output through register 0x13/0x14 is lossy; instead
        // compare the final predictor value.
        gen(&mut c, 2000);
        let nibbles: Vec<u8> = data.iter().flat_map(|b| [b >> 4, b & 0xF]).collect();
        let expected = reference(&nibbles);
        assert_eq!(c.adpcm.final_out(), *expected.last().unwrap());
    }

    #[test]
    fn rhythm_mode_produces_percussion() {
        let mut c = chip();
        // Pitch setup for the rhythm channels.
        c.write(0xA6, 0x20, t0());
        c.write(0xB6, 0x05, t0());
        c.write(0xA7, 0x50, t0());
        c.write(0xB7, 0x05, t0());
        c.write(0xA8, 0xC1, t0());
        c.write(0xB8, 0x01, t0());
        // Voice levels for the six rhythm slots.
        for r in [0x51u8, 0x52, 0x53, 0x54, 0x55] {
            c.write(r, 0x00, t0());
        }
        for r in [0x71u8, 0x72, 0x73, 0x74, 0x75] {
            c.write(r, 0xF8, t0());
        }
        for r in [0x91u8, 0x92, 0x93, 0x94, 0x95] {
            c.write(r, 0xF7, t0());
        }
        c.write(0xBD, 0x20 | 0x1F, t0()); // rhythm mode + all drums keyed
        assert!(!c.is_muted());
        let bufs = gen(&mut c, 2048);
        let e7: i64 = bufs[7].iter().map(|&s| s.abs() as i64).sum();
        let e8: i64 = bufs[8].iter().map(|&s| s.abs() as i64).sum();
        assert!(e7 > 0);
        assert!(e8 > 0);
    }

    #[test]
    fn timers_raise_flags() {
        let mut c = chip();
        c.write(0x02, 0xFF, t0());
        c.write(0x04, 0x01, t0());
        let later = t0() + EmuDuration::from_master_cycles(4 * 72 * 2);
        assert_ne!(c.read_status(later) & Y8950Status::T1.bits(), 0);
        c.write(0x04, 0x80, later); // IRQ reset clears flags
        assert_eq!(c.read_status(later) & Y8950Status::T1.bits(), 0);
    }
}
