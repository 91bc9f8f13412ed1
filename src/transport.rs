//! The view of a Bluetooth transport PCM that the multi-client layer consumes.
//!
//! The transport I/O thread owns codec work and the Bluetooth socket. All the
//! multi-client layer needs from it is the negotiated stream parameters, the
//! volume table, somewhere to publish the mix delay, and a signal channel to
//! tell the I/O thread when clients come and go.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

/// Sample encodings that can be mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PcmFormat {
    /// Unsigned 8-bit, offset binary.
    U8,
    /// Signed 16-bit little-endian.
    S16Le,
    /// Signed 32-bit little-endian.
    S32Le,
}

impl PcmFormat {
    /// Bytes occupied by one sample.
    pub const fn sample_bytes(self) -> usize {
        match self {
            PcmFormat::U8 => 1,
            PcmFormat::S16Le => 2,
            PcmFormat::S32Le => 4,
        }
    }

    /// Byte pattern of a silent sample.
    pub const fn silence(self) -> u8 {
        match self {
            PcmFormat::U8 => 0x80,
            PcmFormat::S16Le | PcmFormat::S32Le => 0,
        }
    }
}

/// Direction of the transport PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmMode {
    /// Audio flows from local clients to the Bluetooth device (playback).
    Sink,
    /// Audio flows from the Bluetooth device to local clients (capture).
    Source,
}

/// Per-channel volume as configured on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Volume {
    /// Level in 1/100 dB. Zero is unity gain.
    pub level: i32,
    /// Whether the channel is muted.
    pub muted: bool,
}

impl Volume {
    /// Linear scale factor for this volume.
    pub fn scale(&self) -> f64 {
        if self.muted {
            0.0
        } else {
            10f64.powf(0.01 * self.level as f64 / 20.0)
        }
    }
}

/// Notifications sent to the transport I/O thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    /// The first client connected.
    PcmOpen,
    /// No capture client is consuming audio; production may pause.
    PcmPause,
    /// A capture client is consuming audio again.
    PcmResume,
    /// The last client disconnected.
    PcmClose,
}

/// Transport PCM parameters shared between the transport and its multi-client stream.
#[derive(Debug)]
pub struct TransportPcm {
    mode: PcmMode,
    format: PcmFormat,
    channels: u8,
    sampling_rate: u32,
    volume: Mutex<Vec<Volume>>,
    delay: AtomicU32,
    signals: Sender<TransportSignal>,
}

impl TransportPcm {
    /// Describe a transport PCM. Returns the PCM together with the receiving
    /// end of its signal channel, which belongs to the transport I/O thread.
    pub fn new(
        mode: PcmMode,
        format: PcmFormat,
        channels: u8,
        sampling_rate: u32,
    ) -> (Self, Receiver<TransportSignal>) {
        let (signals, receiver) = unbounded();
        let pcm = Self {
            mode,
            format,
            channels,
            sampling_rate,
            volume: Mutex::new(vec![Volume::default(); channels as usize]),
            delay: AtomicU32::new(0),
            signals,
        };
        (pcm, receiver)
    }

    /// Stream direction.
    pub fn mode(&self) -> PcmMode {
        self.mode
    }

    /// Sample encoding.
    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Channels per frame.
    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// Sampling rate in Hz.
    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    /// Bytes per frame.
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.format.sample_bytes()
    }

    /// Update the volume of one channel. Out of range channels are ignored.
    pub fn set_volume(&self, channel: usize, volume: Volume) {
        if let Some(slot) = self.volume.lock().get_mut(channel) {
            *slot = volume;
        }
    }

    /// Current volume of one channel.
    pub fn volume(&self, channel: usize) -> Option<Volume> {
        self.volume.lock().get(channel).copied()
    }

    /// Linear scale factors, one per channel.
    pub fn volume_scale(&self) -> Vec<f64> {
        self.volume.lock().iter().map(Volume::scale).collect()
    }

    /// Delay introduced by client mixing, in 1/10 ms.
    pub fn delay(&self) -> u32 {
        self.delay.load(Ordering::Relaxed)
    }

    pub(crate) fn set_delay(&self, delay: u32) {
        self.delay.store(delay, Ordering::Relaxed);
    }

    pub(crate) fn send_signal(&self, signal: TransportSignal) {
        // The transport may already have gone away during teardown.
        let _ = self.signals.send(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_and_muted_scales() {
        assert_eq!(Volume::default().scale(), 1.0);
        let muted = Volume {
            level: 0,
            muted: true,
        };
        assert_eq!(muted.scale(), 0.0);
        let minus_six = Volume {
            level: -600,
            muted: false,
        };
        assert!((minus_six.scale() - 0.501).abs() < 0.001);
    }

    #[test]
    fn volume_table_tracks_channels() {
        let (pcm, _rx) = TransportPcm::new(PcmMode::Sink, PcmFormat::S16Le, 2, 48_000);
        pcm.set_volume(
            1,
            Volume {
                level: 0,
                muted: true,
            },
        );
        pcm.set_volume(5, Volume::default());
        assert_eq!(pcm.volume_scale(), vec![1.0, 0.0]);
        assert_eq!(pcm.frame_bytes(), 4);
    }
}
