//! WAV rendering of mixer output.
//!
//! Optional (`export-wav` feature): pulls a fixed number of frames through
//! the normal audio-callback path and writes them to a 16-bit stereo WAV
//! file. Handy for listening tests; the emulation core itself has no file
//! format.

use crate::mixer::Mixer;
use crate::Result;
use std::path::Path;

/// Render `frames` stereo frames of mixer output into `path`.
pub fn render_wav(mixer: &Mixer, frames: usize, path: &Path) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: mixer.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| crate::SoundError::Config(e.to_string()))?;

    let block = mixer.block_size();
    let mut buf = vec![0i16; 2 * block];
    let mut remaining = frames;
    while remaining > 0 {
        let n = remaining.min(block);
        let chunk = &mut buf[..2 * n];
        mixer.audio_callback(chunk);
        for &s in chunk.iter() {
            writer
                .write_sample(s)
                .map_err(|e| crate::SoundError::Config(e.to_string()))?;
        }
        remaining -= n;
    }
    writer
        .finalize()
        .map_err(|e| crate::SoundError::Config(e.to_string()))?;
    Ok(())
}
