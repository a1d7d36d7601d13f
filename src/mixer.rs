//! Process-wide audio mixer.
//!
//! One mixer per emulated machine. Chips register at boot; from then on two
//! callers drive it: the emulation thread, which calls
//! [`update_stream`](Mixer::update_stream) just before every audible
//! register write, and the host audio thread, which pulls finished blocks
//! through [`audio_callback`](Mixer::audio_callback).
//!
//! The contract both sides rely on: all devices are always advanced to the
//! same emulated instant before any register write proceeds, so the PCM
//! stream reflects every write at the exact host sample corresponding to
//! its timestamp. A write mid-block simply splits the block — chip inner
//! loops are straight-line code and never suspend.

use crate::clock::{EmuTime, SampleClock};
use crate::device::{ChannelMode, DeviceId, SoundDevice};
use crate::resample::Resampler;
use crate::{Result, SoundError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Mixer configuration.
#[derive(Debug, Clone, Copy)]
pub struct MixerConfig {
    /// Host sample rate in Hz. 44100, 48000 and 22050 are all exercised.
    pub sample_rate: u32,
    /// Frames per mixing block; also the largest `num` ever passed to a
    /// device's `generate_channels` for a 1:1 device.
    pub block_size: usize,
    /// Upper bound on a single device's channel count.
    pub max_channels: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        MixerConfig {
            sample_rate: 44_100,
            block_size: 512,
            max_channels: 18,
        }
    }
}

struct DeviceEntry {
    id: DeviceId,
    device: Arc<Mutex<dyn SoundDevice>>,
    mode: ChannelMode,
    num_channels: usize,
    stereo: bool,
    amplification: f32,
    volume_left: f32,
    volume_right: f32,
    user_mute: bool,
    /// None when the device generates at the host rate already.
    resampler: Option<Resampler>,
    /// Per-channel buffers, `frames * (2 if stereo else 1)` each.
    chan_bufs: Vec<Vec<i32>>,
    /// Per-device native-rate stereo sum, interleaved.
    native_sum: Vec<i32>,
    /// Largest native-frame count one block can demand.
    native_frames: usize,
}

struct MixerInner {
    cfg: MixerConfig,
    clock: SampleClock,
    /// Frames generated since the stream origin.
    mixed_frames: u64,
    /// Frames handed to the host since the stream origin.
    consumed_frames: u64,
    /// Generated, not yet consumed stereo frames (i32 accumulators).
    pending: VecDeque<(i32, i32)>,
    devices: Vec<DeviceEntry>,
    next_id: u32,
    /// Scratch for resampled frames of one chunk.
    host_frames: Vec<(i32, i32)>,
}

/// Process-wide mixer handle. Cloning shares the same mixer.
#[derive(Clone)]
pub struct Mixer {
    inner: Arc<Mutex<MixerInner>>,
}

impl Mixer {
    /// Create a mixer. Exactly one per emulated machine; created before any
    /// chip registers.
    pub fn new(cfg: MixerConfig) -> Self {
        Mixer {
            inner: Arc::new(Mutex::new(MixerInner {
                cfg,
                clock: SampleClock::new(EmuTime::zero(), cfg.sample_rate),
                mixed_frames: 0,
                consumed_frames: 0,
                pending: VecDeque::new(),
                devices: Vec::new(),
                next_id: 0,
                host_frames: vec![(0, 0); cfg.block_size],
            })),
        }
    }

    /// Host sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.inner.lock().cfg.sample_rate
    }

    /// Frames per mixing block — the maximum ever requested from a 1:1
    /// device in one `generate_channels` call.
    pub fn block_size(&self) -> usize {
        self.inner.lock().cfg.block_size
    }

    /// Register a sound device.
    ///
    /// Called from the emulation thread during machine construction. The
    /// device's `set_sample_rate` runs here, then it joins the mix with
    /// software volume 1.0/1.0 and user mute off. Fails when the channel
    /// count is 0 or exceeds the configured maximum.
    pub fn register_sound(
        &self,
        device: Arc<Mutex<dyn SoundDevice>>,
        mode: ChannelMode,
    ) -> Result<DeviceId> {
        let mut inner = self.inner.lock();
        let host_rate = inner.cfg.sample_rate;
        let block = inner.cfg.block_size;

        let (name, num_channels, stereo, input_rate, amplification) = {
            let mut dev = device.lock();
            dev.set_sample_rate(host_rate);
            (
                dev.name(),
                dev.num_channels(),
                dev.is_stereo(),
                dev.input_rate(),
                dev.amplification_factor(),
            )
        };

        if num_channels == 0 || num_channels > inner.cfg.max_channels {
            return Err(SoundError::Registration(format!(
                "{name}: {num_channels} channels (mixer supports 1..={})",
                inner.cfg.max_channels
            )));
        }
        if mode == ChannelMode::Stereo && !stereo {
            return Err(SoundError::Registration(format!(
                "{name}: stereo mode on a mono device"
            )));
        }

        let resampler = (input_rate != host_rate).then(|| Resampler::new(input_rate, host_rate));
        // Resampling devices can need more native frames than one host block.
        let native_frames = match &resampler {
            Some(rs) => rs.input_needed(block) + 2,
            None => block,
        };
        let width = if stereo { 2 } else { 1 };

        let id = DeviceId(inner.next_id);
        inner.next_id += 1;
        inner.devices.push(DeviceEntry {
            id,
            device,
            mode,
            num_channels,
            stereo,
            amplification,
            volume_left: 1.0,
            volume_right: 1.0,
            user_mute: false,
            resampler,
            chan_bufs: vec![vec![0; native_frames * width]; num_channels],
            native_sum: vec![0; native_frames * 2],
            native_frames,
        });
        log::info!("registered sound device {name} ({num_channels} ch @ {input_rate} Hz)");
        Ok(id)
    }

    /// Unregister a device; its buffers are released. Safe to call with an
    /// id that is already gone.
    pub fn unregister_sound(&self, id: DeviceId) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.devices.iter().position(|d| d.id == id) {
            let entry = inner.devices.remove(pos);
            log::info!("unregistered sound device {}", entry.device.lock().name());
        }
    }

    /// Synthesize all samples up to `time`.
    ///
    /// Chips call this just before an audible register write so the write
    /// lands at the correct sample offset. Idempotent: repeated calls with
    /// the same time generate nothing further.
    pub fn update_stream(&self, time: EmuTime) {
        let mut inner = self.inner.lock();
        let target = inner.clock.samples_until(time);
        inner.generate_up_to(target);
    }

    /// Host audio callback. Fills `out` (interleaved stereo i16) and
    /// advances the stream cursor by exactly `out.len() / 2` frames.
    ///
    /// Writes silence when no devices are registered. Never underruns:
    /// devices synthesize on demand.
    pub fn audio_callback(&self, out: &mut [i16]) {
        let frames = out.len() / 2;
        let mut inner = self.inner.lock();
        let target = inner.consumed_frames + frames as u64;
        inner.generate_up_to(target);
        for frame in out.chunks_exact_mut(2) {
            let (l, r) = inner.pending.pop_front().unwrap_or((0, 0));
            frame[0] = l.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            frame[1] = r.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
        inner.consumed_frames = target;
    }

    /// Per-device software volume. Calls `update_stream` first so the
    /// change never alters already-generated samples.
    pub fn set_software_volume(&self, id: DeviceId, left: f32, right: f32, time: EmuTime) {
        self.update_stream(time);
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.devices.iter_mut().find(|d| d.id == id) {
            entry.volume_left = left.clamp(0.0, 1.0);
            entry.volume_right = right.clamp(0.0, 1.0);
        }
    }

    /// Per-device user (UI) mute. Same ordering discipline as volume.
    pub fn set_user_mute(&self, id: DeviceId, mute: bool, time: EmuTime) {
        self.update_stream(time);
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.devices.iter_mut().find(|d| d.id == id) {
            entry.user_mute = mute;
        }
    }

    /// The instant corresponding to the end of everything generated so far.
    pub fn stream_time(&self) -> EmuTime {
        let inner = self.inner.lock();
        inner.clock.time_of_sample(inner.mixed_frames)
    }
}

impl MixerInner {
    fn generate_up_to(&mut self, target_frames: u64) {
        while self.mixed_frames < target_frames {
            let n = ((target_frames - self.mixed_frames) as usize).min(self.cfg.block_size);
            self.mix_chunk(n);
            self.mixed_frames += n as u64;
        }
    }

    /// Mix one chunk of `n <= block_size` frames from all devices into the
    /// pending queue.
    fn mix_chunk(&mut self, n: usize) {
        let start = self.pending.len();
        self.pending.extend(std::iter::repeat((0, 0)).take(n));

        for entry in &mut self.devices {
            let mut dev = entry.device.lock();
            if entry.user_mute || dev.is_muted() {
                continue;
            }

            let native_n = match &entry.resampler {
                Some(rs) => rs.input_needed(n),
                None => n,
            };
            debug_assert!(native_n <= entry.native_frames);
            let width = if entry.stereo { 2 } else { 1 };

            for buf in &mut entry.chan_bufs {
                buf[..native_n * width].fill(0);
            }
            let mut slots: Vec<Option<&mut [i32]>> = entry
                .chan_bufs
                .iter_mut()
                .map(|b| Some(&mut b[..native_n * width]))
                .collect();
            dev.generate_channels(&mut slots, native_n);
            drop(dev);

            // Collapse channels into one interleaved stereo stream.
            let sum = &mut entry.native_sum[..native_n * 2];
            sum.fill(0);
            for slot in slots.iter().flatten() {
                if entry.stereo {
                    for (acc, &s) in sum.iter_mut().zip(slot.iter()) {
                        *acc += s;
                    }
                } else {
                    for (j, &s) in slot.iter().enumerate() {
                        match entry.mode {
                            ChannelMode::Mono => {
                                sum[2 * j] += s;
                                sum[2 * j + 1] += s;
                            }
                            ChannelMode::MonoLeft => sum[2 * j] += s,
                            ChannelMode::MonoRight => sum[2 * j + 1] += s,
                            ChannelMode::Stereo => unreachable!(),
                        }
                    }
                }
            }

            // The final amplification factor multiply is the one float
            // operation in the mix path.
            let gain_l = entry.amplification * entry.volume_left;
            let gain_r = entry.amplification * entry.volume_right;
            match &mut entry.resampler {
                Some(rs) => {
                    let frames = &mut self.host_frames[..n];
                    rs.process(sum, n, frames);
                    for (j, &(l, r)) in frames.iter().enumerate() {
                        let acc = &mut self.pending[start + j];
                        acc.0 += (l as f32 * gain_l) as i32;
                        acc.1 += (r as f32 * gain_r) as i32;
                    }
                }
                None => {
                    for j in 0..n {
                        let acc = &mut self.pending[start + j];
                        acc.0 += (sum[2 * j] as f32 * gain_l) as i32;
                        acc.1 += (sum[2 * j + 1] as f32 * gain_r) as i32;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoundDevice;

    /// Constant-output mono test device.
    struct DcSource {
        level: i32,
        muted: bool,
        rate: u32,
    }

    impl DcSource {
        fn new(level: i32) -> Self {
            DcSource {
                level,
                muted: false,
                rate: 0,
            }
        }
    }

    impl SoundDevice for DcSource {
        fn name(&self) -> &'static str {
            "dc"
        }
        fn num_channels(&self) -> usize {
            1
        }
        fn input_rate(&self) -> u32 {
            self.rate
        }
        fn set_sample_rate(&mut self, host_rate: u32) {
            self.rate = host_rate;
        }
        fn amplification_factor(&self) -> f32 {
            1.0
        }
        fn is_muted(&self) -> bool {
            self.muted
        }
        fn generate_channels(&mut self, bufs: &mut [Option<&mut [i32]>], num: usize) {
            if let Some(buf) = &mut bufs[0] {
                for s in buf.iter_mut().take(num) {
                    *s += self.level;
                }
            }
        }
        fn peek_register(&self, _reg: u16) -> u8 {
            0
        }
        fn reset_core(&mut self) {}
    }

    fn mixer() -> Mixer {
        Mixer::new(MixerConfig::default())
    }

    fn register(m: &Mixer, dev: DcSource, mode: ChannelMode) -> DeviceId {
        m.register_sound(Arc::new(Mutex::new(dev)), mode).unwrap()
    }

    #[test]
    fn silence_with_no_devices() {
        let m = mixer();
        let mut out = [1i16; 64];
        m.audio_callback(&mut out);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn panning_has_no_crosstalk() {
        let m = mixer();
        let left = register(&m, DcSource::new(1000), ChannelMode::MonoLeft);
        let right = register(&m, DcSource::new(2000), ChannelMode::MonoRight);
        let _ = (left, right);
        let mut out = [0i16; 8];
        m.audio_callback(&mut out);
        assert_eq!(&out[..4], &[1000, 2000, 1000, 2000]);
    }

    #[test]
    fn software_volume_scales_output() {
        let m = mixer();
        let id = register(&m, DcSource::new(1000), ChannelMode::Mono);
        m.set_software_volume(id, 0.5, 0.25, EmuTime::zero());
        let mut out = [0i16; 4];
        m.audio_callback(&mut out);
        assert_eq!(out[0], 500);
        assert_eq!(out[1], 250);
    }

    #[test]
    fn saturation_clips_not_wraps() {
        let m = mixer();
        register(&m, DcSource::new(30_000), ChannelMode::Mono);
        register(&m, DcSource::new(30_000), ChannelMode::Mono);
        let mut out = [0i16; 4];
        m.audio_callback(&mut out);
        assert_eq!(out[0], i16::MAX);
    }

    #[test]
    fn user_mute_silences_device() {
        let m = mixer();
        let id = register(&m, DcSource::new(1000), ChannelMode::Mono);
        m.set_user_mute(id, true, EmuTime::zero());
        let mut out = [0i16; 4];
        m.audio_callback(&mut out);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn update_stream_is_idempotent() {
        let m = mixer();
        register(&m, DcSource::new(123), ChannelMode::Mono);
        let t = EmuTime::from_ticks(crate::MAIN_FREQ / 100); // 10ms
        m.update_stream(t);
        let mixed = m.inner.lock().mixed_frames;
        m.update_stream(t);
        assert_eq!(m.inner.lock().mixed_frames, mixed);
        assert_eq!(mixed, 441);
    }

    #[test]
    fn callback_consumes_presynthesized_samples() {
        let m = mixer();
        register(&m, DcSource::new(77), ChannelMode::Mono);
        m.update_stream(EmuTime::from_ticks(crate::MAIN_FREQ / 441)); // 100 frames
        let mut out = [0i16; 2 * 150];
        m.audio_callback(&mut out);
        assert!(out.iter().all(|&s| s == 77));
        assert_eq!(m.inner.lock().pending.len(), 0);
    }
}
