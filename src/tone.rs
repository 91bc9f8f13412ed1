//! Sine tone source rendering interleaved PCM in any mixable format.
//!
//! Used by the `multictl` developer tool and by tests to stand in for real
//! client applications.

use dasp_signal::{ConstHz, Signal, Sine};

use crate::transport::PcmFormat;

/// Deterministic sine generator producing interleaved PCM bytes.
pub struct ToneGenerator {
    signal: Sine<ConstHz>,
    format: PcmFormat,
    channels: usize,
    amplitude: f64,
}

impl ToneGenerator {
    /// Create a generator. `amplitude` is a fraction of full scale and is
    /// clamped to `0.0..=1.0`.
    pub fn new(
        format: PcmFormat,
        channels: u8,
        sampling_rate: u32,
        frequency_hz: f64,
        amplitude: f64,
    ) -> Self {
        Self {
            signal: dasp_signal::rate(sampling_rate as f64)
                .const_hz(frequency_hz)
                .sine(),
            format,
            channels: channels.max(1) as usize,
            amplitude: amplitude.clamp(0.0, 1.0),
        }
    }

    /// Bytes per rendered frame.
    pub fn frame_bytes(&self) -> usize {
        self.channels * self.format.sample_bytes()
    }

    /// Render whole frames into `out`. Returns the number of frames written.
    pub fn fill(&mut self, out: &mut [u8]) -> usize {
        let frame_bytes = self.frame_bytes();
        let sample_bytes = self.format.sample_bytes();
        let mut frames = 0;
        for frame in out.chunks_exact_mut(frame_bytes) {
            let value = self.signal.next() * self.amplitude;
            for sample in frame.chunks_exact_mut(sample_bytes) {
                encode_sample(self.format, value, sample);
            }
            frames += 1;
        }
        frames
    }

    /// Render `frames` frames into a new buffer.
    pub fn render(&mut self, frames: usize) -> Vec<u8> {
        let mut out = vec![0u8; frames * self.frame_bytes()];
        self.fill(&mut out);
        out
    }
}

fn encode_sample(format: PcmFormat, value: f64, out: &mut [u8]) {
    match format {
        PcmFormat::U8 => out[0] = (value * i8::MAX as f64 + 128.0) as u8,
        PcmFormat::S16Le => out.copy_from_slice(&((value * i16::MAX as f64) as i16).to_le_bytes()),
        PcmFormat::S32Le => out.copy_from_slice(&((value * i32::MAX as f64) as i32).to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_whole_frames_only() {
        let mut tone = ToneGenerator::new(PcmFormat::S16Le, 2, 48_000, 440.0, 0.5);
        let mut out = [0u8; 10];
        assert_eq!(tone.fill(&mut out), 2);
        assert_eq!(&out[8..], &[0, 0]);
    }

    #[test]
    fn stays_within_amplitude() {
        let mut tone = ToneGenerator::new(PcmFormat::S16Le, 1, 8_000, 1_000.0, 0.25);
        let pcm = tone.render(64);
        let peak = pcm
            .chunks_exact(2)
            .map(|raw| i16::from_le_bytes([raw[0], raw[1]]).unsigned_abs())
            .max()
            .unwrap_or(0);
        assert!(peak > 0);
        assert!(peak <= i16::MAX as u16 / 4 + 1);
    }

    #[test]
    fn u8_silence_is_offset_binary() {
        let mut tone = ToneGenerator::new(PcmFormat::U8, 1, 8_000, 1_000.0, 0.0);
        assert!(tone.render(16).iter().all(|&byte| byte == PcmFormat::U8.silence()));
    }
}
