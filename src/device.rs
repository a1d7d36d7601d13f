//! Sound device contract
//!
//! Every emulated chip implements [`SoundDevice`]; the mixer drives the
//! whole list through this one trait. Registration hands the machine a
//! [`SoundUnit`] — the owning handle that pairs the chip core with the
//! mixer so register writes can be serialized against sample generation.

use crate::clock::EmuTime;
use crate::mixer::Mixer;
use parking_lot::Mutex;
use std::sync::Arc;

/// How a registered device's output maps onto the stereo mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Mono output, summed into both left and right.
    Mono,
    /// Mono output, left only.
    MonoLeft,
    /// Mono output, right only.
    MonoRight,
    /// The device emits interleaved L/R pairs per channel.
    Stereo,
}

/// Opaque registration handle assigned by the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) u32);

/// The capability set every emulated sound chip provides.
///
/// `generate_channels` is the only hot call: it appends `num` samples to
/// each per-channel buffer the mixer supplies. Mono devices write `num`
/// samples per channel; stereo devices (`is_stereo`) write `2 * num`
/// interleaved. Taking a slot to `None` marks that channel silent for the
/// whole block. Buffers arrive zeroed, so adding and assigning are
/// equivalent.
///
/// Callers guarantee serialization: no register mutates between two samples
/// of one call. That is what `Mixer::update_stream` is for.
pub trait SoundDevice: Send {
    /// Short device name, used in log events.
    fn name(&self) -> &'static str;

    /// Number of output channels (1..=18, fixed per chip).
    fn num_channels(&self) -> usize;

    /// True when each channel buffer carries interleaved L/R pairs.
    fn is_stereo(&self) -> bool {
        false
    }

    /// The chip's natural sample rate in Hz, valid after
    /// [`set_sample_rate`](SoundDevice::set_sample_rate). Devices whose
    /// cores run directly at the host rate report the host rate.
    fn input_rate(&self) -> u32;

    /// Called once at registration with the host sample rate. Chips
    /// precompute rate-dependent tables here.
    fn set_sample_rate(&mut self, host_rate: u32);

    /// Scales raw chip output into the mixer's 16-bit range.
    fn amplification_factor(&self) -> f32;

    /// Cheap "nothing is playing" test; true means the mixer substitutes
    /// silence without calling `generate_channels`.
    fn is_muted(&self) -> bool;

    /// Synthesize `num` samples into the supplied channel buffers.
    fn generate_channels(&mut self, bufs: &mut [Option<&mut [i32]>], num: usize);

    /// Side-effect-free register read, for introspection.
    fn peek_register(&self, reg: u16) -> u8;

    /// Hardware reset of the DSP state. Time-aware wrappers call
    /// `update_stream` first.
    fn reset_core(&mut self);
}

/// Owning handle for a registered chip.
///
/// The machine keeps the `SoundUnit`; the mixer keeps only a non-owning
/// reference to the core. Chip-specific operations (`write_register`,
/// port and status access) are inherent impls on `SoundUnit<ChipType>` in
/// each chip module — they call [`Mixer::update_stream`] before any write
/// that can be audible, which is what keeps sample output faithful to
/// write timing.
///
/// Dropping the unit unregisters the device.
pub struct SoundUnit<T: SoundDevice> {
    mixer: Mixer,
    id: DeviceId,
    core: Arc<Mutex<T>>,
}

impl<T: SoundDevice + 'static> SoundUnit<T> {
    /// Register `core` with `mixer` under the given channel mode.
    pub fn register(mixer: &Mixer, core: T, mode: ChannelMode) -> crate::Result<Self> {
        let core = Arc::new(Mutex::new(core));
        let id = mixer.register_sound(core.clone(), mode)?;
        Ok(SoundUnit {
            mixer: mixer.clone(),
            id,
            core,
        })
    }
}

impl<T: SoundDevice> SoundUnit<T> {
    /// The mixer-assigned registration handle.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// The mixer this unit is registered with.
    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }

    /// Bring the PCM stream up to `time`. Wrappers call this before any
    /// audible state change.
    pub fn sync(&self, time: EmuTime) {
        self.mixer.update_stream(time);
    }

    /// Run `f` against the locked chip core.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.core.lock())
    }

    /// Side-effect-free register read.
    pub fn peek_register(&self, reg: u16) -> u8 {
        self.core.lock().peek_register(reg)
    }

    /// Per-device software volume (left, right in 0.0..=1.0). Takes effect
    /// from `time` onward; already-generated samples are unaffected.
    pub fn set_software_volume(&self, left: f32, right: f32, time: EmuTime) {
        self.mixer.set_software_volume(self.id, left, right, time);
    }

    /// User (UI) mute flag.
    pub fn set_user_mute(&self, mute: bool, time: EmuTime) {
        self.mixer.set_user_mute(self.id, mute, time);
    }

    /// Hardware reset at `time`.
    pub fn reset(&self, time: EmuTime) {
        self.sync(time);
        self.core.lock().reset_core();
    }
}

impl<T: SoundDevice> Drop for SoundUnit<T> {
    fn drop(&mut self) {
        self.mixer.unregister_sound(self.id);
    }
}
