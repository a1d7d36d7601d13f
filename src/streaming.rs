//! Real-time audio output through rodio.
//!
//! Optional (`streaming` feature): hands the mixer's pull callback to the
//! host audio device. The rodio source drains one mixer block at a time,
//! so emulated time advances exactly with playback.

use crate::mixer::Mixer;
use crate::{Result, SoundError};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::time::Duration;

struct MixerSource {
    mixer: Mixer,
    sample_rate: u32,
    buffer: Vec<i16>,
    pos: usize,
}

impl MixerSource {
    fn new(mixer: Mixer) -> Self {
        let sample_rate = mixer.sample_rate();
        let block = mixer.block_size();
        MixerSource {
            mixer,
            sample_rate,
            buffer: vec![0; 2 * block],
            pos: usize::MAX, // force refill on first pull
        }
    }
}

impl Iterator for MixerSource {
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        if self.pos >= self.buffer.len() {
            self.mixer.audio_callback(&mut self.buffer);
            self.pos = 0;
        }
        let sample = self.buffer[self.pos];
        self.pos += 1;
        Some(sample)
    }
}

impl Source for MixerSource {
    fn current_frame_len(&self) -> Option<usize> {
        Some(self.buffer.len() - self.pos.min(self.buffer.len()))
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Audio playback device wired to a [`Mixer`].
pub struct AudioDevice {
    _stream: OutputStream,
    _handle: OutputStreamHandle,
    _sink: Sink,
}

impl AudioDevice {
    /// Open the default output device and start pulling from `mixer`.
    pub fn new(mixer: &Mixer) -> Result<AudioDevice> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| SoundError::AudioDevice(e.to_string()))?;
        let sink =
            Sink::try_new(&handle).map_err(|e| SoundError::AudioDevice(e.to_string()))?;
        sink.append(MixerSource::new(mixer.clone()));
        Ok(AudioDevice {
            _stream: stream,
            _handle: handle,
            _sink: sink,
        })
    }
}
