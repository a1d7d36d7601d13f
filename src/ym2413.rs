//! YM2413 (OPLL) emulation.
//!
//! Nine 2-operator FM channels at chip-clock/72, or six melodic channels
//! plus five rhythm instruments. Fifteen ROM instruments plus one
//! user-programmable patch; registers 0x00-0x07 edit the user patch live.
//!
//! The DSP follows the fast software-synthesis model: per-sample slot
//! evaluation in the log/dB domain with table-driven envelope and phase
//! generators.

use crate::clock::EmuTime;
use crate::device::{ChannelMode, SoundDevice, SoundUnit};
use crate::mixer::Mixer;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const CLOCK_FREQ: u32 = 3_579_545;

// Phase generator: 9-bit sine table under an 18-bit accumulator.
const PG_BITS: u32 = 9;
const PG_WIDTH: usize = 1 << PG_BITS;
const DP_BITS: u32 = 18;
const DP_WIDTH: i32 = 1 << DP_BITS;
const DP_BASE_BITS: u32 = DP_BITS - PG_BITS;

// Dynamic range of the sine table: 48 dB in 0.1875 dB steps.
const DB_BITS: u32 = 8;
const DB_STEP: f64 = 48.0 / (1 << DB_BITS) as f64;
const DB_MUTE: usize = 1 << DB_BITS;

// Envelope: 7 bits at 0.375 dB per step, 22-bit phase counter.
const EG_STEP: f64 = 0.375;
const EG_BITS: u32 = 7;
const EG_DP_BITS: u32 = 22;
const EG_DP_WIDTH: i32 = 1 << EG_DP_BITS;

// Total level: 6 bits at 0.75 dB; sustain level: 4 bits at 3 dB.
const TL_STEP: f64 = 0.75;
const SL_STEP: f64 = 3.0;

const SLOT_AMP_BITS: u32 = 15;

// Pitch / amplitude LFOs.
const PM_PG_BITS: u32 = 8;
const PM_PG_WIDTH: usize = 1 << PM_PG_BITS;
const PM_DP_BITS: u32 = 16;
const PM_DP_WIDTH: i32 = 1 << PM_DP_BITS;
const AM_PG_BITS: u32 = 8;
const AM_PG_WIDTH: usize = 1 << AM_PG_BITS;
const AM_DP_BITS: u32 = 16;
const AM_DP_WIDTH: i32 = 1 << AM_DP_BITS;

const PM_AMP_BITS: u32 = 8;
const PM_AMP: f64 = (1 << PM_AMP_BITS) as f64;

/// Vibrato: 6.4 Hz, +-13.75 cents.
const PM_SPEED: f64 = 6.4;
const PM_DEPTH: f64 = 13.75;
/// Tremolo: 3.7 Hz, 4.875 dB.
const AM_SPEED: f64 = 3.7;
const AM_DEPTH: f64 = 4.875;

const SLOT_BD1: usize = 12;
const SLOT_BD2: usize = 13;
const SLOT_HH: usize = 14;
const SLOT_SD: usize = 15;
const SLOT_TOM: usize = 16;
const SLOT_CYM: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum EnvMode {
    Settle,
    Attack,
    Decay,
    SusHold,
    Sustine,
    Release,
    Finish,
}

/// One voice: all parameters of a modulator/carrier pair member.
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
    wf: u8,
    ar: u8,
    dr: u8,
    sl: u8,
    rr: u8,
}

/// The 15 ROM instruments, the silent user default and the 3 rhythm
/// voices, in the chip's dump format (8 significant bytes per voice).
#[rustfmt::skip]
const ROM_INST: [[u8; 8]; 19] = [
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    [0x61, 0x61, 0x1e, 0x17, 0xf0, 0x7f, 0x07, 0x17],
    [0x13, 0x41, 0x0f, 0x0d, 0xce, 0xf5, 0x43, 0x23],
    [0x03, 0x01, 0x9a, 0x04, 0xf3, 0xf4, 0x13, 0x23],
    [0x21, 0x61, 0x1d, 0x07, 0xfa, 0x64, 0x30, 0x28],
    [0x22, 0x21, 0x1e, 0x06, 0xf0, 0x76, 0x18, 0x28],
    [0x31, 0x02, 0x16, 0x05, 0x90, 0x71, 0x00, 0x10],
    [0x21, 0x61, 0x1d, 0x07, 0x82, 0x80, 0x10, 0x17],
    [0x23, 0x21, 0x2d, 0x16, 0xc0, 0x70, 0x07, 0x07],
    [0x61, 0x21, 0x1b, 0x06, 0x64, 0x65, 0x18, 0x18],
    [0x61, 0x61, 0x0c, 0x18, 0x85, 0xa0, 0x79, 0x07],
    [0x23, 0x21, 0x87, 0x11, 0xf0, 0xa4, 0x00, 0xf7],
    [0x97, 0xe1, 0x28, 0x07, 0xff, 0xf3, 0x02, 0xf8],
    [0x61, 0x10, 0x0c, 0x05, 0xf2, 0xc4, 0x40, 0xc8],
    [0x01, 0x01, 0x56, 0x03, 0xb4, 0xb2, 0x23, 0x58],
    [0x61, 0x41, 0x89, 0x03, 0xf1, 0xf4, 0xf0, 0x13],
    // Rhythm voices: bass drum, hi-hat/snare, tom/cymbal.
    [0x04, 0x21, 0x16, 0x00, 0xdf, 0xf8, 0xff, 0xf8],
    [0x23, 0x32, 0x00, 0x00, 0xd8, 0xf7, 0xf8, 0xf7],
    [0x25, 0x18, 0x00, 0x00, 0xf8, 0xda, 0xf8, 0x55],
];

fn dump_to_patch(dump: &[u8; 8]) -> [Patch; 2] {
    let mut p = [Patch::default(); 2];
    for (i, op) in p.iter_mut().enumerate() {
        op.am = dump[i] & 0x80 != 0;
        op.pm = dump[i] & 0x40 != 0;
        op.eg = dump[i] & 0x20 != 0;
        op.kr = (dump[i] >> 4) & 1;
        op.ml = dump[i] & 15;
        op.kl = (dump[2 + i] >> 6) & 3;
        op.ar = (dump[4 + i] >> 4) & 15;
        op.dr = dump[4 + i] & 15;
        op.sl = (dump[6 + i] >> 4) & 15;
        op.rr = dump[6 + i] & 15;
    }
    p[0].tl = dump[2] & 63;
    p[0].fb = dump[3] & 7;
    p[0].wf = (dump[3] >> 3) & 1;
    p[1].wf = (dump[3] >> 4) & 1;
    p
}

fn tl2eg(tl: i32) -> i32 {
    tl * (TL_STEP / EG_STEP) as i32
}

fn eg2db(eg: i32) -> i32 {
    eg * (EG_STEP / DB_STEP) as i32
}

fn db_pos(db: f64) -> i32 {
    (db / DB_STEP) as i32
}

fn db_neg(db: f64) -> i32 {
    (2 * DB_MUTE) as i32 + (db / DB_STEP) as i32
}

/// Tables that only depend on chip constants.
struct StaticTables {
    full_sin: [u16; PG_WIDTH],
    half_sin: [u16; PG_WIDTH],
    pm: [i32; PM_PG_WIDTH],
    am: [i32; AM_PG_WIDTH],
    ar_adjust: [u16; 1 << EG_BITS],
    tll: Box<[[[[i32; 4]; 64]; 8]; 16]>,
    rks: [[[i32; 2]; 8]; 2],
    sl: [i32; 16],
    patches: [[Patch; 2]; 19],
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
        let mut half_sin = [0u16; PG_WIDTH];
        half_sin[..PG_WIDTH / 2].copy_from_slice(&full_sin[..PG_WIDTH / 2]);
        for h in half_sin.iter_mut().skip(PG_WIDTH / 2) {
            *h = full_sin[0];
        }

        let mut pm = [0i32; PM_PG_WIDTH];
        for (i, v) in pm.iter_mut().enumerate() {
            let s = (2.0 * std::f64::consts::PI * i as f64 / PM_PG_WIDTH as f64).sin();
            *v = (PM_AMP * 2f64.powf(PM_DEPTH * s / 1200.0)) as i32;
        }
        let mut am = [0i32; AM_PG_WIDTH];
        for (i, v) in am.iter_mut().enumerate() {
            let s = (2.0 * std::f64::consts::PI * i as f64 / AM_PG_WIDTH as f64).sin();
            *v = (AM_DEPTH / 2.0 / DB_STEP * (1.0 + s)) as i32;
        }

        let mut ar_adjust = [0u16; 1 << EG_BITS];
        ar_adjust[0] = 1 << EG_BITS;
        for i in 1..(1 << EG_BITS) {
            let e = (1 << EG_BITS) as f64;
            ar_adjust[i] = (e - 1.0 - e * (i as f64).ln() / 128f64.ln()) as u16;
        }

        // KSL in half-dB units.
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
        let mut tll = Box::new([[[[0i32; 4]; 64]; 8]; 16]);
        for fnum in 0..16 {
            for block in 0..8 {
                for tl in 0..64 {
                    for kl in 0..4 {
                        tll[fnum][block][tl][kl] = if kl == 0 {
                            tl2eg(tl as i32)
                        } else {
                            let tmp = kl_table[fnum] - db2(3.000) * (7 - block as i32);
                            if tmp <= 0 {
                                tl2eg(tl as i32)
                            } else {
                                ((tmp >> (3 - kl)) as f64 / EG_STEP) as i32 + tl2eg(tl as i32)
                            }
                        };
                    }
                }
            }
        }

        let mut rks = [[[0i32; 2]; 8]; 2];
        for (fnum8, row) in rks.iter_mut().enumerate() {
            for (block, cell) in row.iter_mut().enumerate() {
                cell[0] = (block >> 1) as i32;
                cell[1] = ((block << 1) + fnum8) as i32;
            }
        }

        let mut sl = [0i32; 16];
        for (i, v) in sl.iter_mut().enumerate() {
            let db = if i == 15 { 48.0 } else { 3.0 * i as f64 };
            *v = (((db / SL_STEP) as i32) * (SL_STEP / EG_STEP) as i32) << (EG_DP_BITS - EG_BITS);
        }

        let mut patches = [[Patch::default(); 2]; 19];
        for (i, dump) in ROM_INST.iter().enumerate() {
            patches[i] = dump_to_patch(dump);
        }

        StaticTables {
            full_sin,
            half_sin,
            pm,
            am,
            ar_adjust,
            tll,
            rks,
            sl,
            patches,
        }
    })
}

/// Sample-rate dependent tables.
struct RateTables {
    dphase: Box<[[[i32; 16]; 8]; 512]>,
    dphase_ar: [[i32; 16]; 16],
    dphase_dr: [[i32; 16]; 16],
    dphase_noise: Box<[[i32; 8]; 512]>,
    pm_dphase: i32,
    am_dphase: i32,
}

/// Envelope speed scales with the ratio of the chip's natural rate
/// (clock/72) to the host rate.
fn rate_adjust(x: f64, rate: u32) -> i32 {
    (x * CLOCK_FREQ as f64 / 72.0 / rate as f64 + 0.5) as i32
}

impl RateTables {
    fn new(rate: u32) -> Self {
        let ml_table: [i32; 16] = [
            1, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 20, 24, 24, 30, 30,
        ];
        let mut dphase = Box::new([[[0i32; 16]; 8]; 512]);
        for fnum in 0..512i64 {
            for block in 0..8 {
                for ml in 0..16 {
                    let base = ((fnum * ml_table[ml] as i64) << block) >> (20 - DP_BITS);
                    dphase[fnum as usize][block][ml] = rate_adjust(base as f64, rate);
                }
            }
        }

        let mut dphase_ar = [[0i32; 16]; 16];
        for ar in 0..16usize {
            for rks in 0..16usize {
                let rm = (ar + (rks >> 2)).min(15);
                let rl = (rks & 3) as i32;
                dphase_ar[ar][rks] = match ar {
                    0 => 0,
                    15 => EG_DP_WIDTH,
                    _ => rate_adjust((3 * (rl + 4) as i64 * (1i64 << (rm + 1))) as f64, rate),
                };
            }
        }

        let mut dphase_dr = [[0i32; 16]; 16];
        for dr in 0..16usize {
            for rks in 0..16usize {
                let rm = (dr + (rks >> 2)).min(15);
                let rl = (rks & 3) as i32;
                dphase_dr[dr][rks] = match dr {
                    0 => 0,
                    _ => rate_adjust(((rl + 4) as i64 * (1i64 << (rm - 1))) as f64, rate),
                };
            }
        }

        let mut dphase_noise = Box::new([[0i32; 8]; 512]);
        for fnum in 0..512 {
            for block in 0..8 {
                dphase_noise[fnum][block] = rate_adjust((fnum << block) as f64, rate);
            }
        }

        let natural = CLOCK_FREQ as f64 / 72.0;
        RateTables {
            dphase,
            dphase_ar,
            dphase_dr,
            dphase_noise,
            pm_dphase: rate_adjust(PM_SPEED * PM_DP_WIDTH as f64 / natural, rate),
            am_dphase: rate_adjust(AM_SPEED * AM_DP_WIDTH as f64 / natural, rate),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Slot {
    /// 0 = modulator, 1 = carrier (rhythm can turn a modulator into a
    /// volume-controlled voice).
    slot_type: u8,
    patch_num: usize,

    feedback: i32,
    output: [i32; 2],

    half_wave: bool,
    phase: i32,
    dphase: i32,
    pgout: i32,

    fnum: i32,
    block: i32,
    volume: i32,
    sustine: bool,
    tll: i32,
    rks: i32,
    eg_mode: EnvMode,
    eg_phase: i32,
    eg_dphase: i32,
    egout: i32,
}

impl Slot {
    fn new(slot_type: u8) -> Self {
        Slot {
            slot_type,
            patch_num: 0,
            feedback: 0,
            output: [0; 2],
            half_wave: false,
            phase: 0,
            dphase: 0,
            pgout: 0,
            fnum: 0,
            block: 0,
            volume: 0,
            sustine: false,
            tll: 0,
            rks: 0,
            eg_mode: EnvMode::Finish,
            eg_phase: EG_DP_WIDTH,
            eg_dphase: 0,
            egout: 0,
        }
    }

    fn reset(&mut self) {
        let t = self.slot_type;
        *self = Slot::new(t);
    }

    fn calc_eg_dphase(&self, patch: &Patch, rt: &RateTables) -> i32 {
        let rks = self.rks as usize;
        match self.eg_mode {
            EnvMode::Attack => rt.dphase_ar[patch.ar as usize][rks],
            EnvMode::Decay => rt.dphase_dr[patch.dr as usize][rks],
            EnvMode::SusHold => 0,
            EnvMode::Sustine => rt.dphase_dr[patch.rr as usize][rks],
            EnvMode::Settle => rt.dphase_dr[15][0],
            EnvMode::Release => {
                if self.sustine {
                    rt.dphase_dr[5][rks]
                } else if patch.eg {
                    rt.dphase_dr[patch.rr as usize][rks]
                } else {
                    rt.dphase_dr[7][rks]
                }
            }
            EnvMode::Finish => 0,
        }
    }

    fn update_pg(&mut self, patch: &Patch, rt: &RateTables) {
        self.dphase = rt.dphase[self.fnum as usize][self.block as usize][patch.ml as usize];
    }

    fn update_tll(&mut self, patch: &Patch) {
        let level = if self.slot_type == 0 {
            patch.tl as usize
        } else {
            self.volume as usize
        };
        self.tll = static_tables().tll[(self.fnum >> 5) as usize][self.block as usize][level]
            [patch.kl as usize];
    }

    fn update_rks(&mut self, patch: &Patch) {
        self.rks =
            static_tables().rks[(self.fnum >> 8) as usize][self.block as usize][patch.kr as usize];
    }

    fn update_wf(&mut self, patch: &Patch) {
        self.half_wave = patch.wf != 0;
    }

    fn update_eg(&mut self, patch: &Patch, rt: &RateTables) {
        self.eg_dphase = self.calc_eg_dphase(patch, rt);
    }

    fn update_all(&mut self, patch: &Patch, rt: &RateTables) {
        self.update_pg(patch, rt);
        self.update_tll(patch);
        self.update_rks(patch);
        self.update_wf(patch);
        self.update_eg(patch, rt); // EG last: it reads rks
    }

    fn slot_on(&mut self) {
        self.eg_mode = EnvMode::Attack;
        self.phase = 0;
        self.eg_phase = 0;
    }

    fn slot_off(&mut self) {
        if self.eg_mode == EnvMode::Attack {
            // Map the attack position onto the equivalent decay position.
            let idx = (self.eg_phase >> (EG_DP_BITS - EG_BITS)) as usize & ((1 << EG_BITS) - 1);
            self.eg_phase = (static_tables().ar_adjust[idx] as i32) << (EG_DP_BITS - EG_BITS);
        }
        self.eg_mode = EnvMode::Release;
    }

    fn calc_phase(&mut self, patch: &Patch, lfo_pm: i32) -> i32 {
        if patch.pm {
            self.phase += (self.dphase * lfo_pm) >> PM_AMP_BITS;
        } else {
            self.phase += self.dphase;
        }
        self.phase &= DP_WIDTH - 1;
        self.phase >> DP_BASE_BITS
    }

    fn calc_envelope(&mut self, patch: &Patch, rt: &RateTables, lfo_am: i32) -> i32 {
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
                    self.update_eg(patch, rt);
                } else {
                    egout =
                        tables.ar_adjust[(self.eg_phase >> (EG_DP_BITS - EG_BITS)) as usize] as i32;
                }
            }
            EnvMode::Decay => {
                self.eg_phase += self.eg_dphase;
                egout = self.eg_phase >> (EG_DP_BITS - EG_BITS);
                if self.eg_phase >= tables.sl[patch.sl as usize] {
                    self.eg_phase = tables.sl[patch.sl as usize];
                    self.eg_mode = if patch.eg {
                        EnvMode::SusHold
                    } else {
                        EnvMode::Sustine
                    };
                    self.update_eg(patch, rt);
                    egout = self.eg_phase >> (EG_DP_BITS - EG_BITS);
                }
            }
            EnvMode::SusHold => {
                egout = self.eg_phase >> (EG_DP_BITS - EG_BITS);
                if !patch.eg {
                    self.eg_mode = EnvMode::Sustine;
                    self.update_eg(patch, rt);
                }
            }
            EnvMode::Sustine | EnvMode::Release | EnvMode::Settle => {
                self.eg_phase += self.eg_dphase;
                egout = self.eg_phase >> (EG_DP_BITS - EG_BITS);
                if egout >= max {
                    self.eg_mode = EnvMode::Finish;
                    egout = max;
                }
            }
            EnvMode::Finish => egout = max,
        }
        egout = eg2db(egout + self.tll);
        if patch.am {
            egout += lfo_am;
        }
        egout.min(DB_MUTE as i32 - 1)
    }

    fn sin(&self, idx: i32) -> i32 {
        let tables = static_tables();
        let idx = (idx & (PG_WIDTH as i32 - 1)) as usize;
        if self.half_wave {
            tables.half_sin[idx] as i32
        } else {
            tables.full_sin[idx] as i32
        }
    }
}

/// Convert slot amplitude to a 4-pi (feedback) phase offset.
fn wave2_4pi(e: i32) -> i32 {
    let shift = SLOT_AMP_BITS as i32 - PG_BITS as i32 - 1;
    if shift > 0 {
        e >> shift
    } else {
        e << -shift
    }
}

/// Convert slot amplitude to an 8-pi (modulation) phase offset.
fn wave2_8pi(e: i32) -> i32 {
    let shift = SLOT_AMP_BITS as i32 - PG_BITS as i32 - 2;
    if shift > 0 {
        e >> shift
    } else {
        e << -shift
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Channel {
    patch_number: usize,
    key_status: bool,
    /// Re-trigger pending: the carrier is settling to silence before both
    /// slots restart from phase 0.
    settling: bool,
    mod_slot: Slot,
    car_slot: Slot,
}

impl Channel {
    fn new() -> Self {
        Channel {
            patch_number: 0,
            key_status: false,
            settling: false,
            mod_slot: Slot::new(0),
            car_slot: Slot::new(1),
        }
    }

    fn reset(&mut self) {
        self.mod_slot.reset();
        self.car_slot.reset();
        self.key_status = false;
        self.settling = false;
    }

    fn set_patch(&mut self, num: usize) {
        self.patch_number = num;
        self.mod_slot.patch_num = num;
        self.car_slot.patch_num = num;
    }
}

/// YM2413 core.
pub struct Ym2413 {
    regs: [u8; 0x40],
    user_patch: [Patch; 2],
    channels: [Channel; 9],
    slot_on_flag: [u8; 18],
    rhythm_mode: bool,

    pm_phase: i32,
    lfo_pm: i32,
    am_phase: i32,
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
}

impl Ym2413 {
    /// Create and register a YM2413.
    pub fn register(mixer: &Mixer) -> Result<SoundUnit<Ym2413>> {
        let chip = Ym2413::new(20_000);
        SoundUnit::register(mixer, chip, ChannelMode::Mono)
    }

    fn new(max_volume: i32) -> Self {
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
        let mut chip = Ym2413 {
            regs: [0; 0x40],
            user_patch: static_tables().patches[0],
            channels: [Channel::new(); 9],
            slot_on_flag: [0; 18],
            rhythm_mode: false,
            pm_phase: 0,
            lfo_pm: 0,
            am_phase: 0,
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
        };
        chip.reset_core();
        chip
    }

    /// The effective patch pair for patch number `num`: number 0 is the
    /// user patch, everything else ROM.
    fn patch_pair(&self, num: usize) -> [Patch; 2] {
        if num == 0 {
            self.user_patch
        } else {
            static_tables().patches[num]
        }
    }

    fn slot_patch(&self, ch: usize, car: bool) -> Patch {
        let slot = if car {
            &self.channels[ch].car_slot
        } else {
            &self.channels[ch].mod_slot
        };
        self.patch_pair(slot.patch_num)[car as usize]
    }

    fn update_slot<F>(&mut self, ch: usize, car: bool, f: F)
    where
        F: FnOnce(&mut Slot, &Patch, &RateTables),
    {
        let patch = self.slot_patch(ch, car);
        let rt = self.rate_tables.take().expect("sample rate set");
        {
            let chan = &mut self.channels[ch];
            let slot = if car { &mut chan.car_slot } else { &mut chan.mod_slot };
            f(slot, &patch, &rt);
        }
        self.rate_tables = Some(rt);
    }

    fn key_on(&mut self, ch: usize) {
        let retrigger = self.slot_on_flag[ch * 2] == 0
            && self.slot_on_flag[ch * 2 + 1] == 0
            && self.channels[ch].car_slot.eg_mode != EnvMode::Finish;
        if retrigger {
            // Still audible: ramp the carrier down fast, then restart both
            // slots from phase 0.
            self.channels[ch].settling = true;
            let chan = &mut self.channels[ch];
            chan.car_slot.eg_mode = EnvMode::Settle;
            self.update_slot(ch, true, |s, p, rt| s.update_eg(p, rt));
        } else {
            if self.slot_on_flag[ch * 2] == 0 {
                self.channels[ch].mod_slot.slot_on();
            }
            if self.slot_on_flag[ch * 2 + 1] == 0 {
                self.channels[ch].car_slot.slot_on();
            }
        }
        self.channels[ch].key_status = true;
    }

    fn key_off(&mut self, ch: usize) {
        if self.slot_on_flag[ch * 2 + 1] != 0 {
            self.channels[ch].settling = false;
            self.channels[ch].car_slot.slot_off();
        }
        self.channels[ch].key_status = false;
    }

    fn key_on_rhythm(&mut self, slot: usize) {
        if self.slot_on_flag[slot] == 0 {
            let (ch, car) = (slot / 2, slot & 1 == 1);
            if car {
                self.channels[ch].car_slot.slot_on();
            } else {
                self.channels[ch].mod_slot.slot_on();
            }
        }
    }

    fn key_off_rhythm(&mut self, slot: usize) {
        if self.slot_on_flag[slot] != 0 {
            let (ch, car) = (slot / 2, slot & 1 == 1);
            if car {
                self.channels[ch].car_slot.slot_off();
            } else {
                self.channels[ch].mod_slot.slot_off();
            }
        }
    }

    fn update_all_slots(&mut self, ch: usize) {
        self.update_slot(ch, false, |s, p, rt| s.update_all(p, rt));
        self.update_slot(ch, true, |s, p, rt| s.update_all(p, rt));
    }

    fn set_rhythm_mode(&mut self, data: u8) {
        let new_mode = data & 0x20 != 0;
        if self.rhythm_mode == new_mode {
            return;
        }
        self.rhythm_mode = new_mode;
        if new_mode {
            self.channels[6].set_patch(16);
            self.channels[7].set_patch(17);
            self.channels[8].set_patch(18);
            self.channels[7].mod_slot.slot_type = 1; // HH is volume-controlled
            self.channels[8].mod_slot.slot_type = 1; // TOM too
        } else {
            let p6 = (self.regs[0x36] >> 4) as usize;
            let p7 = (self.regs[0x37] >> 4) as usize;
            let p8 = (self.regs[0x38] >> 4) as usize;
            self.channels[6].set_patch(p6);
            self.channels[7].set_patch(p7);
            self.channels[7].mod_slot.slot_type = 0;
            self.channels[8].set_patch(p8);
            self.channels[8].mod_slot.slot_type = 0;

            let finish = |chip: &mut Ym2413, slot: usize| {
                let (ch, car) = (slot / 2, slot & 1 == 1);
                if car {
                    chip.channels[ch].car_slot.eg_mode = EnvMode::Finish;
                } else {
                    chip.channels[ch].mod_slot.eg_mode = EnvMode::Finish;
                }
            };
            if self.regs[0x26] & 0x10 == 0 && data & 0x10 == 0 {
                finish(self, SLOT_BD1);
                finish(self, SLOT_BD2);
            }
            if self.regs[0x27] & 0x10 == 0 && data & 0x08 == 0 {
                finish(self, SLOT_HH);
            }
            if self.regs[0x27] & 0x10 == 0 && data & 0x04 == 0 {
                finish(self, SLOT_SD);
            }
            if self.regs[0x28] & 0x10 == 0 && data & 0x02 == 0 {
                finish(self, SLOT_TOM);
            }
            if self.regs[0x28] & 0x10 == 0 && data & 0x01 == 0 {
                finish(self, SLOT_CYM);
            }
        }
    }

    /// Register write at the chip level (no stream sync).
    pub fn write(&mut self, reg: u8, data: u8) {
        let reg = (reg & 0x3F) as usize;
        match reg {
            0x00 | 0x01 => {
                let i = reg;
                self.user_patch[i].am = data & 0x80 != 0;
                self.user_patch[i].pm = data & 0x40 != 0;
                self.user_patch[i].eg = data & 0x20 != 0;
                self.user_patch[i].kr = (data >> 4) & 1;
                self.user_patch[i].ml = data & 15;
                for ch in 0..9 {
                    if self.channels[ch].patch_number == 0 {
                        self.update_slot(ch, i == 1, |s, p, rt| {
                            s.update_pg(p, rt);
                            s.update_rks(p);
                            s.update_eg(p, rt);
                        });
                    }
                }
            }
            0x02 => {
                self.user_patch[0].kl = (data >> 6) & 3;
                self.user_patch[0].tl = data & 63;
                for ch in 0..9 {
                    if self.channels[ch].patch_number == 0 {
                        self.update_slot(ch, false, |s, p, _| s.update_tll(p));
                    }
                }
            }
            0x03 => {
                self.user_patch[1].kl = (data >> 6) & 3;
                self.user_patch[1].wf = (data >> 4) & 1;
                self.user_patch[0].wf = (data >> 3) & 1;
                self.user_patch[0].fb = data & 7;
                for ch in 0..9 {
                    if self.channels[ch].patch_number == 0 {
                        self.update_slot(ch, false, |s, p, _| s.update_wf(p));
                        self.update_slot(ch, true, |s, p, _| s.update_wf(p));
                    }
                }
            }
            0x04 | 0x05 => {
                let i = reg - 0x04;
                self.user_patch[i].ar = (data >> 4) & 15;
                self.user_patch[i].dr = data & 15;
                for ch in 0..9 {
                    if self.channels[ch].patch_number == 0 {
                        self.update_slot(ch, i == 1, |s, p, rt| s.update_eg(p, rt));
                    }
                }
            }
            0x06 | 0x07 => {
                let i = reg - 0x06;
                self.user_patch[i].sl = (data >> 4) & 15;
                self.user_patch[i].rr = data & 15;
                for ch in 0..9 {
                    if self.channels[ch].patch_number == 0 {
                        self.update_slot(ch, i == 1, |s, p, rt| s.update_eg(p, rt));
                    }
                }
            }
            0x0E => {
                self.refresh_slot_on_flags();
                // Rhythm-mode change is evaluated before the key-on bits.
                if ((data >> 5) & 1 != 0) != self.rhythm_mode {
                    self.set_rhythm_mode(data);
                }
                if self.rhythm_mode {
                    if data & 0x10 != 0 {
                        self.key_on(6);
                    } else {
                        self.key_off(6);
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
                for ch in 6..9 {
                    self.update_all_slots(ch);
                }
            }
            0x10..=0x18 => {
                let ch = reg - 0x10;
                let fnum = data as i32 + (((self.regs[0x20 + ch] & 1) as i32) << 8);
                self.set_fnumber(ch, fnum);
                self.update_all_slots(ch);
                if let Some(rt) = &self.rate_tables {
                    if reg == 0x17 {
                        let idx = data as usize + (((self.regs[0x27] & 1) as usize) << 8);
                        self.noise_a_dphase = rt.dphase_noise[idx][((self.regs[0x27] >> 1) & 7) as usize];
                    } else if reg == 0x18 {
                        let idx = data as usize + (((self.regs[0x28] & 1) as usize) << 8);
                        self.noise_b_dphase = rt.dphase_noise[idx][((self.regs[0x28] >> 1) & 7) as usize];
                    }
                }
            }
            0x20..=0x28 => {
                let ch = reg - 0x20;
                let fnum = (((data & 1) as i32) << 8) + self.regs[0x10 + ch] as i32;
                self.set_fnumber(ch, fnum);
                self.set_block(ch, ((data >> 1) & 7) as i32);
                // Flags carry the pre-write key state so the handlers below
                // see rising and falling edges.
                let old_on = self.regs[reg] & 0x10;
                self.slot_on_flag[ch * 2] = old_on;
                self.slot_on_flag[ch * 2 + 1] = old_on;
                match reg {
                    0x26 if self.rhythm_mode => {
                        self.slot_on_flag[SLOT_BD1] |= self.regs[0x0E] & 0x10;
                        self.slot_on_flag[SLOT_BD2] |= self.regs[0x0E] & 0x10;
                    }
                    0x27 => {
                        if let Some(rt) = &self.rate_tables {
                            let idx = (((data & 1) as usize) << 8) + self.regs[0x17] as usize;
                            self.noise_a_dphase = rt.dphase_noise[idx][((data >> 1) & 7) as usize];
                        }
                        if self.rhythm_mode {
                            self.slot_on_flag[SLOT_SD] |= self.regs[0x0E] & 0x08;
                            self.slot_on_flag[SLOT_HH] |= self.regs[0x0E] & 0x01;
                        }
                    }
                    0x28 => {
                        if let Some(rt) = &self.rate_tables {
                            let idx = (((data & 1) as usize) << 8) + self.regs[0x18] as usize;
                            self.noise_b_dphase = rt.dphase_noise[idx][((data >> 1) & 7) as usize];
                        }
                        if self.rhythm_mode {
                            self.slot_on_flag[SLOT_TOM] |= self.regs[0x0E] & 0x04;
                            self.slot_on_flag[SLOT_CYM] |= self.regs[0x0E] & 0x02;
                        }
                    }
                    _ => {}
                }
                if (self.regs[reg] ^ data) & 0x20 != 0 {
                    self.set_sustine(ch, data & 0x20 != 0);
                }
                if data & 0x10 != 0 {
                    self.key_on(ch);
                } else {
                    self.key_off(ch);
                }
                self.update_all_slots(ch);
            }
            0x30..=0x38 => {
                let ch = reg - 0x30;
                let inst = (data >> 4) as usize;
                let vol = (data & 15) as i32;
                if self.rhythm_mode && reg >= 0x36 {
                    // HH and TOM volume live in the instrument nibble.
                    match reg {
                        0x37 => self.channels[7].mod_slot.volume = (inst as i32) << 2,
                        0x38 => self.channels[8].mod_slot.volume = (inst as i32) << 2,
                        _ => {}
                    }
                } else {
                    self.channels[ch].set_patch(inst);
                }
                self.channels[ch].car_slot.volume = vol << 2;
                self.update_all_slots(ch);
            }
            _ => {}
        }
        self.regs[reg] = data;
        self.check_mute();
    }

    fn refresh_slot_on_flags(&mut self) {
        let r0e = self.regs[0x0E];
        if self.rhythm_mode {
            self.slot_on_flag[SLOT_BD1] = (r0e & 0x10) | (self.regs[0x26] & 0x10);
            self.slot_on_flag[SLOT_BD2] = (r0e & 0x10) | (self.regs[0x26] & 0x10);
            self.slot_on_flag[SLOT_SD] = (r0e & 0x08) | (self.regs[0x27] & 0x10);
            self.slot_on_flag[SLOT_HH] = (r0e & 0x01) | (self.regs[0x27] & 0x10);
            self.slot_on_flag[SLOT_TOM] = (r0e & 0x04) | (self.regs[0x28] & 0x10);
            self.slot_on_flag[SLOT_CYM] = (r0e & 0x02) | (self.regs[0x28] & 0x10);
        } else {
            self.slot_on_flag[SLOT_BD1] = self.regs[0x26] & 0x10;
            self.slot_on_flag[SLOT_BD2] = self.regs[0x26] & 0x10;
            self.slot_on_flag[SLOT_SD] = self.regs[0x27] & 0x10;
            self.slot_on_flag[SLOT_HH] = self.regs[0x27] & 0x10;
            self.slot_on_flag[SLOT_TOM] = self.regs[0x28] & 0x10;
            self.slot_on_flag[SLOT_CYM] = self.regs[0x28] & 0x10;
        }
    }

    fn set_fnumber(&mut self, ch: usize, fnum: i32) {
        self.channels[ch].car_slot.fnum = fnum;
        self.channels[ch].mod_slot.fnum = fnum;
    }

    fn set_block(&mut self, ch: usize, block: i32) {
        self.channels[ch].car_slot.block = block;
        self.channels[ch].mod_slot.block = block;
    }

    fn set_sustine(&mut self, ch: usize, sustine: bool) {
        self.channels[ch].car_slot.sustine = sustine;
        if self.channels[ch].mod_slot.slot_type == 1 {
            self.channels[ch].mod_slot.sustine = sustine;
        }
    }

    fn update_ampm(&mut self) {
        let rt = self.rate_tables.as_ref().expect("sample rate set");
        self.pm_phase = (self.pm_phase + rt.pm_dphase) & (PM_DP_WIDTH - 1);
        self.am_phase = (self.am_phase + rt.am_dphase) & (AM_DP_WIDTH - 1);
        let tables = static_tables();
        self.lfo_am = tables.am[(self.am_phase >> (AM_DP_BITS - AM_PG_BITS)) as usize];
        self.lfo_pm = tables.pm[(self.pm_phase >> (PM_DP_BITS - PM_PG_BITS)) as usize];
    }

    fn update_noise(&mut self) {
        // 15-bit maximal LFSR.
        if self.noise_seed & 1 != 0 {
            self.noise_seed ^= 0x6000 << 1;
        }
        self.noise_seed >>= 1;
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

    fn calc_slot_car(&mut self, ch: usize, fm: i32) -> i32 {
        let patch = self.slot_patch(ch, true);
        let rt = self.rate_tables.take().expect("sample rate set");
        let (lfo_am, lfo_pm) = (self.lfo_am, self.lfo_pm);
        let slot = &mut self.channels[ch].car_slot;
        slot.egout = slot.calc_envelope(&patch, &rt, lfo_am);
        slot.pgout = slot.calc_phase(&patch, lfo_pm);
        slot.output[1] = slot.output[0];
        let (egout, idx) = (slot.egout, slot.pgout + wave2_8pi(fm));
        let sinv = slot.sin(idx);
        self.rate_tables = Some(rt);
        let slot = &mut self.channels[ch].car_slot;
        slot.output[0] = if egout >= DB_MUTE as i32 - 1 {
            0
        } else {
            self.db2lin[(sinv + egout) as usize] as i32
        };
        (slot.output[1] + slot.output[0]) >> 1
    }

    fn calc_slot_mod(&mut self, ch: usize) -> i32 {
        let patch = self.slot_patch(ch, false);
        let rt = self.rate_tables.take().expect("sample rate set");
        let (lfo_am, lfo_pm) = (self.lfo_am, self.lfo_pm);
        let slot = &mut self.channels[ch].mod_slot;
        slot.output[1] = slot.output[0];
        slot.egout = slot.calc_envelope(&patch, &rt, lfo_am);
        slot.pgout = slot.calc_phase(&patch, lfo_pm);
        let sinv = if slot.egout >= DB_MUTE as i32 - 1 {
            None
        } else if patch.fb != 0 {
            let fm = wave2_4pi(slot.feedback) >> (7 - patch.fb);
            Some(slot.sin(slot.pgout + fm))
        } else {
            Some(slot.sin(slot.pgout))
        };
        self.rate_tables = Some(rt);
        let egout = self.channels[ch].mod_slot.egout;
        let out = match sinv {
            None => 0,
            Some(s) => self.db2lin[(s + egout) as usize] as i32,
        };
        let slot = &mut self.channels[ch].mod_slot;
        slot.output[0] = out;
        slot.feedback = (slot.output[1] + slot.output[0]) >> 1;
        slot.feedback
    }

    fn calc_slot_tom(&mut self, ch: usize) -> i32 {
        let patch = self.slot_patch(ch, false);
        let rt = self.rate_tables.take().expect("sample rate set");
        let (lfo_am, lfo_pm) = (self.lfo_am, self.lfo_pm);
        let slot = &mut self.channels[ch].mod_slot;
        slot.egout = slot.calc_envelope(&patch, &rt, lfo_am);
        slot.pgout = slot.calc_phase(&patch, lfo_pm);
        let (egout, sinv) = (slot.egout, slot.sin(slot.pgout));
        self.rate_tables = Some(rt);
        if egout >= DB_MUTE as i32 - 1 {
            0
        } else {
            self.db2lin(sinv + egout)
        }
    }

    fn calc_slot_snare(&mut self, ch: usize) -> i32 {
        let patch = self.slot_patch(ch, true);
        let rt = self.rate_tables.take().expect("sample rate set");
        let (lfo_am, lfo_pm) = (self.lfo_am, self.lfo_pm);
        let slot = &mut self.channels[ch].car_slot;
        slot.egout = slot.calc_envelope(&patch, &rt, lfo_am);
        slot.pgout = slot.calc_phase(&patch, lfo_pm);
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
        let patch = self.slot_patch(ch, true);
        let rt = self.rate_tables.take().expect("sample rate set");
        let lfo_am = self.lfo_am;
        let slot = &mut self.channels[ch].car_slot;
        slot.egout = slot.calc_envelope(&patch, &rt, lfo_am);
        let egout = slot.egout;
        self.rate_tables = Some(rt);
        if egout >= DB_MUTE as i32 - 1 {
            0
        } else {
            (self.db2lin(egout + self.noise_a) + self.db2lin(egout + self.noise_b)) >> 1
        }
    }

    fn calc_slot_hat(&mut self, ch: usize) -> i32 {
        let patch = self.slot_patch(ch, false);
        let rt = self.rate_tables.take().expect("sample rate set");
        let lfo_am = self.lfo_am;
        let slot = &mut self.channels[ch].mod_slot;
        slot.egout = slot.calc_envelope(&patch, &rt, lfo_am);
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

    /// Handle a pending re-trigger: once the settling carrier has faded
    /// out, both slots restart from phase 0.
    fn service_settle(&mut self, ch: usize) {
        if !self.channels[ch].settling {
            return;
        }
        let car = &self.channels[ch].car_slot;
        if car.eg_mode == EnvMode::Finish || car.eg_mode == EnvMode::Settle && car.egout >= DB_MUTE as i32 - 1 {
            self.channels[ch].settling = false;
            self.channels[ch].mod_slot.slot_on();
            self.channels[ch].car_slot.slot_on();
            self.update_all_slots(ch);
        }
    }

    fn check_mute(&mut self) {
        self.internal_mute = self.check_mute_helper();
    }

    fn check_mute_helper(&self) -> bool {
        // A pending re-trigger must keep running until it restarts.
        if self.channels.iter().any(|c| c.settling) {
            return false;
        }
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

impl SoundDevice for Ym2413 {
    fn name(&self) -> &'static str {
        "YM2413"
    }

    fn num_channels(&self) -> usize {
        9
    }

    fn input_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_sample_rate(&mut self, host_rate: u32) {
        self.sample_rate = host_rate;
        self.rate_tables = Some(RateTables::new(host_rate));
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
                self.service_settle(ch);
                if self.channels[ch].car_slot.eg_mode != EnvMode::Finish {
                    let fm = self.calc_slot_mod(ch);
                    let v = self.calc_slot_car(ch, fm);
                    if let Some(buf) = &mut bufs[ch] {
                        buf[j] += v;
                    }
                }
            }
            if !self.rhythm_mode {
                for ch in 6..9 {
                    self.service_settle(ch);
                    if self.channels[ch].car_slot.eg_mode != EnvMode::Finish {
                        let fm = self.calc_slot_mod(ch);
                        let v = self.calc_slot_car(ch, fm);
                        if let Some(buf) = &mut bufs[ch] {
                            buf[j] += v;
                        }
                    }
                }
            } else {
                // HH and CYM share phase sources; advance them first.
                {
                    let patch = self.slot_patch(7, false);
                    let lfo_pm = self.lfo_pm;
                    let s = &mut self.channels[7].mod_slot;
                    s.pgout = s.calc_phase(&patch, lfo_pm);
                }
                {
                    let patch = self.slot_patch(8, true);
                    let lfo_pm = self.lfo_pm;
                    let s = &mut self.channels[8].car_slot;
                    s.pgout = s.calc_phase(&patch, lfo_pm);
                }

                self.service_settle(6);
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
        }
        self.check_mute();
    }

    fn peek_register(&self, reg: u16) -> u8 {
        self.regs[(reg & 0x3F) as usize]
    }

    fn reset_core(&mut self) {
        self.pm_phase = 0;
        self.am_phase = 0;
        self.noise_seed = 0xFFFF;
        self.noise_a = 0;
        self.noise_b = 0;
        self.noise_a_phase = 0;
        self.noise_b_phase = 0;
        self.noise_a_dphase = 0;
        self.noise_b_dphase = 0;
        self.rhythm_mode = false;
        self.slot_on_flag = [0; 18];
        for ch in 0..9 {
            self.channels[ch].reset();
            self.channels[ch].set_patch(0);
        }
        if self.rate_tables.is_some() {
            for reg in 0..0x40 {
                self.write(reg, 0);
            }
        }
        self.internal_mute = true;
    }
}

impl SoundUnit<Ym2413> {
    /// Time-stamped register write.
    pub fn write_register(&self, reg: u8, value: u8, time: EmuTime) {
        self.sync(time);
        self.with(|c| c.write(reg, value));
    }

    /// Snapshot for save states.
    pub fn save_state(&self) -> Ym2413State {
        self.with(|c| c.save_state())
    }

    /// Restore a snapshot.
    pub fn restore_state(&self, state: &Ym2413State) {
        self.with(|c| c.restore_state(state));
    }
}

/// Serializable YM2413 state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ym2413State {
    /// Register file.
    pub regs: Vec<u8>,
    /// Per-slot dynamic state in slot order (mod/car per channel).
    pub slots: Vec<SlotState>,
    /// LFO phases (PM, AM).
    pub lfo: (i32, i32),
    /// Noise LFSR and the two noise phase accumulators.
    pub noise: (u32, i32, i32),
}

/// Dynamic accumulators of one operator slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotState {
    /// 18-bit phase accumulator.
    pub phase: i32,
    /// 22-bit envelope phase.
    pub eg_phase: i32,
    /// Envelope state index.
    pub eg_mode: u8,
    /// Feedback memory.
    pub feedback: i32,
    /// Last two slot outputs.
    pub output: [i32; 2],
}

impl Ym2413 {
    /// Snapshot the dynamic state.
    pub fn save_state(&self) -> Ym2413State {
        let mut slots = Vec::with_capacity(18);
        for ch in 0..9 {
            for slot in [&self.channels[ch].mod_slot, &self.channels[ch].car_slot] {
                slots.push(SlotState {
                    phase: slot.phase,
                    eg_phase: slot.eg_phase,
                    eg_mode: slot.eg_mode as u8,
                    feedback: slot.feedback,
                    output: slot.output,
                });
            }
        }
        Ym2413State {
            regs: self.regs.to_vec(),
            slots,
            lfo: (self.pm_phase, self.am_phase),
            noise: (self.noise_seed, self.noise_a_phase, self.noise_b_phase),
        }
    }

    /// Replay the register file, then overwrite the dynamic accumulators.
    pub fn restore_state(&mut self, state: &Ym2413State) {
        self.reset_core();
        for (reg, &value) in state.regs.iter().enumerate().take(0x40) {
            self.write(reg as u8, value);
        }
        const MODES: [EnvMode; 7] = [
            EnvMode::Settle,
            EnvMode::Attack,
            EnvMode::Decay,
            EnvMode::SusHold,
            EnvMode::Sustine,
            EnvMode::Release,
            EnvMode::Finish,
        ];
        for ch in 0..9 {
            for (i, car) in [(ch * 2, false), (ch * 2 + 1, true)] {
                let ss = state.slots[i].clone();
                self.update_slot(ch, car, |s, p, rt| {
                    s.phase = ss.phase;
                    s.eg_phase = ss.eg_phase;
                    s.eg_mode = MODES[(ss.eg_mode as usize).min(6)];
                    s.feedback = ss.feedback;
                    s.output = ss.output;
                    s.update_eg(p, rt);
                });
            }
        }
        let (pm, am) = state.lfo;
        self.pm_phase = pm;
        self.am_phase = am;
        let (seed, na, nb) = state.noise;
        self.noise_seed = seed;
        self.noise_a_phase = na;
        self.noise_b_phase = nb;
        self.check_mute();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chip() -> Ym2413 {
        let mut c = Ym2413::new(20_000);
        c.set_sample_rate(44_100);
        c.reset_core();
        c
    }

    fn gen(c: &mut Ym2413, n: usize) -> Vec<Vec<i32>> {
        let mut bufs = vec![vec![0i32; n]; 9];
        let mut slots: Vec<Option<&mut [i32]>> =
            bufs.iter_mut().map(|b| Some(b.as_mut_slice())).collect();
        c.generate_channels(&mut slots, n);
        bufs
    }

    #[test]
    fn rom_patch_decode_spot_checks() {
        let p = &static_tables().patches[1]; // Violin
        assert_eq!(p[0].ml, 1);
        assert_eq!(p[1].ml, 1);
        assert!(!p[0].am && p[0].pm);
        assert_eq!(p[0].tl, 0x1e);
        assert_eq!(p[0].ar, 0xf);
        assert_eq!(p[1].ar, 0x7);
        // Bass-drum patch carries feedback.
        let bd = &static_tables().patches[16];
        assert_eq!(bd[0].fb, 0);
        assert_eq!(bd[0].ar, 0xd);
    }

    #[test]
    fn noise_lfsr_has_15_bit_period() {
        let mut c = chip();
        c.noise_seed = 0x1FFF;
        let seed = c.noise_seed;
        let mut steps = 0u64;
        loop {
            if c.noise_seed & 1 != 0 {
                c.noise_seed ^= 0x6000 << 1;
            }
            c.noise_seed >>= 1;
            steps += 1;
            if c.noise_seed == seed {
                break;
            }
            assert!(steps < 1 << 16);
        }
        assert_eq!(steps, (1 << 15) - 1);
    }

    #[test]
    fn sin_table_shape() {
        let t = static_tables();
        // Zero crossing is max attenuation, peak is 0 dB.
        assert_eq!(t.full_sin[0], (DB_MUTE - 1) as u16);
        assert_eq!(t.full_sin[PG_WIDTH / 4], 0);
        // Negative half is offset by 2*DB_MUTE.
        assert!(t.full_sin[PG_WIDTH / 2 + 10] >= (2 * DB_MUTE) as u16);
        // Half wave mutes the negative half.
        assert_eq!(t.half_sin[PG_WIDTH - 1], t.full_sin[0]);
    }

    #[test]
    fn key_on_produces_sound_and_key_off_decays() {
        let mut c = chip();
        c.write(0x30, 0x10); // instrument 1, max volume
        c.write(0x10, 0x45); // fnum low
        c.write(0x20, 0x15); // key on, block 2, fnum high 1
        assert!(!c.is_muted());

        let bufs = gen(&mut c, 4096);
        let peak: i32 = bufs[0].iter().map(|s| s.abs()).max().unwrap();
        assert!(peak > 1000, "peak={peak}");
        assert!(bufs[1].iter().all(|&s| s == 0));

        // Key off: the tail decays toward silence.
        c.write(0x20, 0x05);
        let bufs2 = gen(&mut c, 44_100);
        let early: i64 = bufs2[0][..2000].iter().map(|&s| s.abs() as i64).sum();
        let late: i64 = bufs2[0][40_000..42_000].iter().map(|&s| s.abs() as i64).sum();
        assert!(late < early / 4, "early={early} late={late}");
    }

    #[test]
    fn attack_envelope_is_monotonic() {
        let mut c = chip();
        c.write(0x30, 0x30); // instrument 3
        c.write(0x10, 0x80);
        c.write(0x20, 0x14); // block 2, key on
        let mut last = i32::MAX;
        let mut violations = 0;
        for _ in 0..2000 {
            gen(&mut c, 1);
            let egout = c.channels[0].car_slot.egout;
            if c.channels[0].car_slot.eg_mode == EnvMode::Attack {
                if egout > last {
                    violations += 1;
                }
                last = egout;
            }
        }
        assert_eq!(violations, 0);
    }

    #[test]
    fn retrigger_settles_before_restarting() {
        let mut c = chip();
        c.write(0x30, 0x10);
        c.write(0x10, 0x45);
        c.write(0x20, 0x15);
        gen(&mut c, 2000);
        c.write(0x20, 0x05); // key off
        gen(&mut c, 50);
        assert_ne!(c.channels[0].car_slot.eg_mode, EnvMode::Finish);
        c.write(0x20, 0x15); // key on while still audible
        assert!(c.channels[0].settling);
        assert_eq!(c.channels[0].car_slot.eg_mode, EnvMode::Settle);
        gen(&mut c, 4000);
        // Settled and restarted: key is on and envelope is active again.
        assert!(!c.channels[0].settling);
        assert!(matches!(
            c.channels[0].car_slot.eg_mode,
            EnvMode::Attack | EnvMode::Decay | EnvMode::SusHold | EnvMode::Sustine
        ));
    }

    #[test]
    fn rhythm_mode_register_order() {
        let mut c = chip();
        // Turning rhythm on and keying BD in the same write keys the drum.
        c.write(0x16, 0x20);
        c.write(0x26, 0x05);
        c.write(0x0E, 0x30);
        assert!(c.rhythm_mode);
        assert_eq!(c.channels[6].patch_number, 16);
        assert_ne!(c.channels[6].car_slot.eg_mode, EnvMode::Finish);
        assert!(!c.is_muted());
    }

    #[test]
    fn reset_silences_everything() {
        let mut c = chip();
        c.write(0x30, 0x10);
        c.write(0x10, 0x45);
        c.write(0x20, 0x15);
        gen(&mut c, 512);
        c.reset_core();
        assert!(c.is_muted());
        let bufs = gen(&mut c, 512);
        assert!(bufs.iter().all(|b| b.iter().all(|&s| s == 0)));
        for ch in 0..9 {
            assert_eq!(c.channels[ch].car_slot.eg_mode, EnvMode::Finish);
            assert_eq!(c.channels[ch].car_slot.phase, 0);
        }
    }

    #[test]
    fn save_restore_round_trip() {
        let mut c = chip();
        c.write(0x30, 0x21);
        c.write(0x10, 0x45);
        c.write(0x20, 0x15);
        gen(&mut c, 777);
        let state = c.save_state();

        let mut d = chip();
        d.restore_state(&state);
        let a = gen(&mut c, 256);
        let b = gen(&mut d, 256);
        assert_eq!(a, b);
    }
}
