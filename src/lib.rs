//! MSX sound-subsystem emulation core
//!
//! A cycle-accurate emulation of the MSX family's sound hardware: the
//! AY-3-8910 PSG, the YM2413 (OPLL) and YMF262 (OPL3) FM synthesizers, the
//! YM2151 (OPM), the Y8950 MSX-AUDIO with its ADPCM unit, the Konami SCC
//! wavetable, a simple 8-bit DAC and the SN76489 DCSG — all driven by a
//! process-wide [`Mixer`] that reconciles the emulated CPU clock with a
//! fixed host sample rate.
//!
//! # Features
//! - Register writes tagged with emulated time: each host sample reflects
//!   the chip state as of the exact instant the write happened
//! - Integer fixed-point DSP inner loops for host-independent output
//! - Per-chip idle detection so silent chips cost nothing to mix
//! - Sub-sample accurate resampling for chips with their own native rate
//! - Save-state snapshots per chip (serde)
//!
//! # Crate feature flags
//! - `streaming` (opt-in): real-time audio output through rodio
//! - `export-wav` (opt-in): render mixer output to a WAV file
//!
//! # Quick start
//! ```no_run
//! use msx_sound::{Ay8910, EmuTime, Mixer, MixerConfig};
//!
//! let mixer = Mixer::new(MixerConfig::default());
//! let psg = Ay8910::register(&mixer, Default::default()).unwrap();
//!
//! let t = EmuTime::zero();
//! psg.write_register(0x00, 0x55, t); // tone A fine
//! psg.write_register(0x01, 0x01, t); // tone A coarse
//! psg.write_register(0x08, 0x0F, t); // volume A
//! psg.write_register(0x07, 0x3E, t); // enable tone A only
//!
//! // The host audio callback pulls interleaved 16-bit stereo:
//! let mut block = [0i16; 2 * 512];
//! mixer.audio_callback(&mut block);
//! ```

#![warn(missing_docs)]

pub mod ay8910;
pub mod clock;
pub mod dac;
pub mod device;
pub mod fixed;
pub mod mixer;
pub mod resample;
pub mod scc;
pub mod sn76489;
pub mod y8950;
pub mod ym2151;
pub mod ym2413;
pub mod ymf262;

mod emutimer;
mod irq;

#[cfg(feature = "export-wav")]
pub mod export;
#[cfg(feature = "streaming")]
pub mod streaming;

/// Error types for sound-core operations
#[derive(thiserror::Error, Debug)]
pub enum SoundError {
    /// Invalid mixer or device configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Device registration failure
    #[error("Device registration failed: {0}")]
    Registration(String),

    /// Audio device error (streaming feature)
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    /// IO error from filesystem or device
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sound-core operations
pub type Result<T> = std::result::Result<T, SoundError>;

// Public API exports
pub use ay8910::{Ay8910, Ay8910Config, AyPeriphery};
pub use clock::{EmuDuration, EmuTime, MAIN_FREQ};
pub use dac::DacSound;
pub use device::{ChannelMode, DeviceId, SoundDevice, SoundUnit};
pub use fixed::FixedPoint;
pub use irq::{IrqLine, IrqSink};
pub use mixer::{Mixer, MixerConfig};
pub use scc::{ChipMode, Scc};
pub use sn76489::Sn76489;
pub use y8950::{Y8950, Y8950Status};
pub use ym2151::Ym2151;
pub use ym2413::Ym2413;
pub use ymf262::{Ymf262, Ymf262Mode};

#[cfg(feature = "streaming")]
pub use streaming::AudioDevice;
