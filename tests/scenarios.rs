//! End-to-end scenarios: chips driven through the mixer with time-stamped
//! register writes, observed at the host-audio boundary.

use msx_sound::clock::EmuDuration;
use msx_sound::{
    Ay8910, Ay8910Config, DacSound, EmuTime, IrqLine, Mixer, MixerConfig, Sn76489, Y8950, Ym2413,
    Ymf262, Ymf262Mode,
};

fn mixer() -> Mixer {
    Mixer::new(MixerConfig::default())
}

fn sample_time(n: u64) -> EmuTime {
    EmuTime::zero() + EmuDuration::from_samples(n, 44_100)
}

fn pull(mixer: &Mixer, frames: usize) -> Vec<i16> {
    let mut out = vec![0i16; 2 * frames];
    mixer.audio_callback(&mut out);
    out
}

/// Count rising edges of the left channel.
fn rising_edges(stereo: &[i16]) -> usize {
    let left: Vec<i16> = stereo.iter().step_by(2).copied().collect();
    left.windows(2).filter(|w| w[0] <= 0 && w[1] > 0).count()
}

#[test]
fn psg_single_tone_frequency_and_level() {
    let mixer = mixer();
    let psg = Ay8910::register(&mixer, Ay8910Config::default()).unwrap();

    let t = EmuTime::zero();
    psg.write_register(0x00, 0x55, t); // fine
    psg.write_register(0x01, 0x01, t); // coarse
    psg.write_register(0x08, 0x0F, t); // volume A max
    psg.write_register(0x07, 0x3E, t); // tone A only, ports output

    let out = pull(&mixer, 44_100);

    // Peak amplitude within 2% of the table maximum.
    let peak = out.iter().map(|&s| s as i32).max().unwrap();
    assert!((peak - 21_000).abs() <= 420, "peak={peak}");

    // One full square wave takes 2 * P steps of chip-clock/8.
    let period = 256 + 0x55;
    let expected = (3_579_545.0 / 2.0) / 16.0 / period as f64;
    let edges = rising_edges(&out) as f64;
    assert!((edges - expected).abs() <= 2.0, "edges={edges} expected={expected}");
}

#[test]
fn opll_sine_envelope_and_key_off() {
    let mixer = mixer();
    let opll = Ym2413::register(&mixer).unwrap();

    let t = EmuTime::zero();
    opll.write_register(0x30, 0x10, t); // instrument 1, max volume
    opll.write_register(0x10, 0x45, t); // fnum low
    opll.write_register(0x20, 0x15, t); // key on, block 2

    let out = pull(&mixer, 4096);
    let peak: i32 = out.iter().map(|&s| s.abs() as i32).max().unwrap();
    assert!(peak > 300, "peak={peak}");

    // Key off at the 4096-sample mark: the tail decays.
    opll.write_register(0x20, 0x05, sample_time(4096));
    let tail = pull(&mixer, 44_100);
    let early: i64 = tail[..4000].iter().map(|&s| s.abs() as i64).sum();
    let late: i64 = tail[80_000..].iter().map(|&s| s.abs() as i64).sum();
    assert!(late < early / 2, "early={early} late={late}");
}

#[test]
fn opl3_four_op_channel_sounds() {
    let mixer = mixer();
    let irq = IrqLine::new();
    let opl3 = Ymf262::register(&mixer, Ymf262Mode::Opl3, Box::new(irq.clone())).unwrap();

    let t = EmuTime::zero();
    opl3.write_register(0x105, 0x01, t); // NEW2
    opl3.write_register(0x104, 0x01, t); // pair channels 0+3
    // Carrier of the pair is channel 3's second operator (offset 0x0B).
    for (reg, val) in [
        (0x20u16, 0x01u8),
        (0x23, 0x01),
        (0x28, 0x01),
        (0x2B, 0x01),
        (0x40, 0x3F),
        (0x43, 0x3F),
        (0x48, 0x3F),
        (0x4B, 0x00),
        (0x60, 0xF4),
        (0x63, 0xF4),
        (0x68, 0xF4),
        (0x6B, 0xF4),
        (0x80, 0x0F),
        (0x83, 0x0F),
        (0x88, 0x0F),
        (0x8B, 0x0F),
        (0xC0, 0x30),
        (0xC3, 0x30),
        (0xA0, 0x45),
        (0xB0, 0x2A), // key on both halves of the pair
    ] {
        opl3.write_register(reg, val, t);
    }

    let out = pull(&mixer, 4096);
    assert!(out.iter().any(|&s| s != 0));
}

#[test]
fn y8950_adpcm_replay_raises_eos() {
    let mixer = mixer();
    let irq = IrqLine::new();
    let audio = Y8950::register(&mixer, Box::new(irq.clone())).unwrap();

    let t = EmuTime::zero();
    // 8 bytes at RAM address 0.
    audio.write_register(0x08, 0x00, t);
    audio.write_register(0x09, 0x00, t);
    audio.write_register(0x0A, 0x00, t);
    audio.write_register(0x0B, 0x01, t);
    audio.write_register(0x0C, 0x00, t);
    audio.write_register(0x07, 0x60, t); // memory-write mode
    for i in 0..8u8 {
        audio.write_register(0x0F, 0x24 + i, t);
    }
    audio.write_register(0x10, 0xFF, t);
    audio.write_register(0x11, 0xFF, t);
    audio.write_register(0x12, 0xFF, t);
    audio.write_register(0x07, 0xA0, t); // start

    let st = audio.read_status(t);
    assert_ne!(st & 0x01, 0, "PCM_BSY after start");

    // Pull enough host samples to consume all 16 nibbles, then the status
    // read (which syncs the stream) must show EOS.
    let _ = pull(&mixer, 512);
    let st = audio.read_status(sample_time(512));
    assert_ne!(st & 0x10, 0, "EOS after the block is consumed");
}

#[test]
fn mixer_panning_has_no_crosstalk() {
    let mixer = mixer();
    let dac_l = DacSound::register(&mixer, 12_000).unwrap();
    let dac_r = DacSound::register(&mixer, 12_000).unwrap();
    let t = EmuTime::zero();
    dac_l.set_software_volume(1.0, 0.0, t);
    dac_r.set_software_volume(0.0, 1.0, t);
    dac_l.write_dac(0xFF, t);
    dac_r.write_dac(0xC0, t);

    let out = pull(&mixer, 64);
    // Constant DC appears on exactly one side per device.
    assert_eq!(out[2], 11_906); // left: (0xFF-0x80)*12000/128
    assert_eq!(out[3], 6_000); // right: (0xC0-0x80)*12000/128
    assert_eq!(out[20], out[2]);
    assert_eq!(out[21], out[3]);
}

#[test]
fn mid_block_volume_write_splits_the_block() {
    let mixer = mixer();
    let psg = Ay8910::register(&mixer, Ay8910Config::default()).unwrap();

    let t = EmuTime::zero();
    psg.write_register(0x00, 0x55, t);
    psg.write_register(0x01, 0x01, t);
    psg.write_register(0x08, 0x0F, t);
    psg.write_register(0x07, 0x3E, t);

    // Volume to zero exactly at sample 256.
    psg.write_register(0x08, 0x00, sample_time(256));

    let out = pull(&mixer, 512);
    let first: i64 = out[..2 * 256].iter().map(|&s| s.abs() as i64).sum();
    let second: i64 = out[2 * 256..].iter().map(|&s| s.abs() as i64).sum();
    assert!(first > 0);
    assert_eq!(second, 0);
}

#[test]
fn update_stream_is_idempotent_across_devices() {
    let mixer = mixer();
    let psg = Ay8910::register(&mixer, Ay8910Config::default()).unwrap();
    let t = EmuTime::zero();
    psg.write_register(0x00, 0x10, t);
    psg.write_register(0x08, 0x0F, t);
    psg.write_register(0x07, 0x3E, t);

    // Repeated syncs to the same instant generate nothing extra; the
    // callback output is identical to a single sync.
    let t1 = sample_time(300);
    mixer.update_stream(t1);
    mixer.update_stream(t1);
    mixer.update_stream(t1);
    let out = pull(&mixer, 600);
    assert!(out.iter().any(|&s| s != 0));
}

#[test]
fn saturation_never_wraps() {
    let mixer = mixer();
    let a = DacSound::register(&mixer, 32_000).unwrap();
    let b = DacSound::register(&mixer, 32_000).unwrap();
    let t = EmuTime::zero();
    a.write_dac(0xFF, t);
    b.write_dac(0xFF, t);
    let out = pull(&mixer, 64);
    assert!(out[2..].iter().all(|&s| s == i16::MAX));
}

#[test]
fn alternate_host_rates_work() {
    for rate in [22_050u32, 48_000] {
        let mixer = Mixer::new(MixerConfig {
            sample_rate: rate,
            ..MixerConfig::default()
        });
        let sn = Sn76489::register(&mixer).unwrap();
        let t = EmuTime::zero();
        sn.write(0x84, t); // tone 0 latch, low 4
        sn.write(0x06, t); // period 100
        sn.write(0x90, t); // full volume
        let mut out = vec![0i16; 2 * rate as usize];
        mixer.audio_callback(&mut out);
        let edges = rising_edges(&out);
        // f = native / (2 * period); one second of output.
        let expected = 223_722 / (2 * 100);
        assert!(
            (edges as i64 - expected as i64).abs() <= 2,
            "rate {rate}: edges={edges} expected={expected}"
        );
    }
}
