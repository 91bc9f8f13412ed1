//! Accumulating ring buffer that sums playback clients into one stream.
//!
//! Samples are held in an integer type twice the width of the transport
//! format, so contributions from every permitted client can be summed with
//! `+=` and only clipped once, when the mix is read out. One frame of the ring
//! is always left unused so that a full ring and an empty ring never share the
//! same cursor configuration.
use crate::MultiError;
use crate::transport::PcmFormat;

/// Where a client will place its next samples in the mix ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingPosition {
    /// Absolute sample index in the ring, as returned by the previous add.
    Absolute(usize),
    /// This many samples ahead of the current read cursor. Used before a
    /// client has a place in the ring, and after a pause.
    AheadOfCursor(usize),
}

enum Accumulator {
    U8(Vec<i16>),
    S16(Vec<i32>),
    S32(Vec<i64>),
}

impl Accumulator {
    fn zeroed(format: PcmFormat, samples: usize) -> Result<Self, MultiError> {
        Ok(match format {
            PcmFormat::U8 => Accumulator::U8(zeroed_vec(samples)?),
            PcmFormat::S16Le => Accumulator::S16(zeroed_vec(samples)?),
            PcmFormat::S32Le => Accumulator::S32(zeroed_vec(samples)?),
        })
    }

    fn clear(&mut self) {
        match self {
            Accumulator::U8(cells) => cells.fill(0),
            Accumulator::S16(cells) => cells.fill(0),
            Accumulator::S32(cells) => cells.fill(0),
        }
    }
}

fn zeroed_vec<T: Default + Clone>(len: usize) -> Result<Vec<T>, MultiError> {
    let mut cells = Vec::new();
    cells.try_reserve_exact(len)?;
    cells.resize(len, T::default());
    Ok(cells)
}

/// Apply a channel scale factor and clip to the output range.
fn scale_sample(value: i64, scale: f64, min: i64, max: i64) -> i64 {
    if scale == 0.0 {
        return 0;
    }
    let value = if scale == 1.0 {
        value
    } else {
        (value as f64 * scale) as i64
    };
    value.clamp(min, max)
}

/// Ring of wide accumulators shared by all playback clients of a transport.
pub struct MixBuffer {
    format: PcmFormat,
    channels: usize,
    frame_size: usize,
    accumulator: Accumulator,
    capacity: usize,
    period: usize,
    mix_offset: usize,
    end: usize,
}

impl MixBuffer {
    /// Allocate a mix ring holding `buffer_frames` frames, transferring at most
    /// `period_frames` frames per add or read.
    pub fn new(
        format: PcmFormat,
        channels: u8,
        buffer_frames: usize,
        period_frames: usize,
    ) -> Result<Self, MultiError> {
        if channels == 0 {
            return Err(MultiError::InvalidParameters("channel count is zero"));
        }
        if period_frames == 0 || period_frames > buffer_frames {
            return Err(MultiError::InvalidParameters(
                "period must be non-zero and fit in the buffer",
            ));
        }
        let channels = channels as usize;
        // One extra frame keeps full and empty distinguishable.
        let capacity = (buffer_frames + 1) * channels;
        Ok(Self {
            format,
            channels,
            frame_size: channels * format.sample_bytes(),
            accumulator: Accumulator::zeroed(format, capacity)?,
            capacity,
            period: period_frames * channels,
            mix_offset: 0,
            end: 0,
        })
    }

    /// Sample encoding of the mixed stream.
    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Channels per frame.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Bytes per frame in the transport representation.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Total ring size in samples, including the reserved frame.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples transferred per add or read.
    pub fn period(&self) -> usize {
        self.period
    }

    /// Index of the next sample to be read.
    pub fn mix_offset(&self) -> usize {
        self.mix_offset
    }

    /// Index one past the newest sample written.
    pub fn end(&self) -> usize {
        self.end
    }

    fn distance(&self, start: usize, end: usize) -> usize {
        if end >= start {
            end - start
        } else {
            self.capacity + end - start
        }
    }

    /// Free samples between `start` and the read cursor, less the reserved frame.
    fn space(&self, start: usize) -> usize {
        let unused = if self.mix_offset > start {
            self.mix_offset - start
        } else {
            self.capacity + self.mix_offset - start
        };
        unused.saturating_sub(self.channels)
    }

    /// Samples ready to be read.
    pub fn avail(&self) -> usize {
        self.distance(self.mix_offset, self.end)
    }

    /// Whether nothing is ready to be read.
    pub fn is_empty(&self) -> bool {
        self.avail() == 0
    }

    /// Samples between the read cursor and `offset`.
    pub fn delay(&self, offset: usize) -> usize {
        self.distance(self.mix_offset, offset % self.capacity)
    }

    /// Samples between the read cursor and a client position. A position the
    /// reader has already overtaken has no delay left.
    pub fn position_delay(&self, position: RingPosition) -> usize {
        match position {
            RingPosition::Absolute(offset) => {
                let delay = self.delay(offset);
                if delay > self.avail() { 0 } else { delay }
            }
            RingPosition::AheadOfCursor(ahead) => ahead,
        }
    }

    /// Drop all mixed audio and rewind both cursors. The configuration is kept.
    pub fn reset(&mut self) {
        self.accumulator.clear();
        self.mix_offset = 0;
        self.end = 0;
    }

    fn resolve(&self, position: RingPosition) -> usize {
        match position {
            RingPosition::AheadOfCursor(ahead) => {
                let ahead = ahead.min(self.capacity - self.channels);
                let ahead = ahead - ahead % self.channels;
                (self.mix_offset + ahead) % self.capacity
            }
            RingPosition::Absolute(offset) => {
                let offset = offset % self.capacity;
                // The reader has overtaken this client; rejoin at the cursor.
                if self.distance(self.mix_offset, offset) > self.avail() {
                    self.mix_offset
                } else {
                    offset
                }
            }
        }
    }

    /// Add client bytes into the mix at `position`, then advance `position`
    /// past them.
    ///
    /// At most one period of whole frames is taken, and never more than fits
    /// before the read cursor. Returns the number of bytes consumed, which is
    /// always a whole number of frames; zero means the ring has no space for
    /// this client.
    pub fn add(&mut self, position: &mut RingPosition, data: &[u8]) -> usize {
        let start = self.resolve(*position);
        let frames = data.len() / self.frame_size;
        let samples = (frames * self.channels)
            .min(self.period)
            .min(self.space(start));
        if samples == 0 {
            return 0;
        }

        let capacity = self.capacity;
        let data = &data[..samples * self.format.sample_bytes()];
        match &mut self.accumulator {
            Accumulator::U8(cells) => {
                for (n, &byte) in data.iter().enumerate() {
                    let cell = &mut cells[(start + n) % capacity];
                    *cell = cell.saturating_add(byte as i16 - 0x80);
                }
            }
            Accumulator::S16(cells) => {
                for (n, raw) in data.chunks_exact(2).enumerate() {
                    let cell = &mut cells[(start + n) % capacity];
                    *cell = cell.saturating_add(i16::from_le_bytes([raw[0], raw[1]]) as i32);
                }
            }
            Accumulator::S32(cells) => {
                for (n, raw) in data.chunks_exact(4).enumerate() {
                    let cell = &mut cells[(start + n) % capacity];
                    let value = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                    *cell = cell.saturating_add(value as i64);
                }
            }
        }

        let next = (start + samples) % capacity;
        let reach = self.distance(self.mix_offset, start) + samples;
        if self.end == self.mix_offset || reach > self.avail() {
            self.end = next;
        }
        *position = RingPosition::Absolute(next);

        samples / self.channels * self.frame_size
    }

    /// Read up to `samples` mixed samples into `dest`, applying one scale
    /// factor per channel and clipping to the transport format.
    ///
    /// Each cell read is reset to zero so the next round of mixing starts from
    /// silence. Returns the number of samples written, always whole frames and
    /// never more than one period.
    pub fn read(&mut self, dest: &mut [u8], samples: usize, scale: &[f64]) -> usize {
        let sample_bytes = self.format.sample_bytes();
        let mut samples = samples.min(dest.len() / sample_bytes);
        samples -= samples % self.channels;
        let samples = samples.min(self.period).min(self.avail());

        let start = self.mix_offset;
        let capacity = self.capacity;
        let channels = self.channels;
        let channel_scale = |n: usize| scale.get(n % channels).copied().unwrap_or(1.0);

        match &mut self.accumulator {
            Accumulator::U8(cells) => {
                for n in 0..samples {
                    let cell = &mut cells[(start + n) % capacity];
                    let value = scale_sample(*cell as i64, channel_scale(n), -128, 127);
                    dest[n] = (value + 0x80) as u8;
                    *cell = 0;
                }
            }
            Accumulator::S16(cells) => {
                for n in 0..samples {
                    let cell = &mut cells[(start + n) % capacity];
                    let value = scale_sample(
                        *cell as i64,
                        channel_scale(n),
                        i16::MIN as i64,
                        i16::MAX as i64,
                    );
                    dest[n * 2..n * 2 + 2].copy_from_slice(&(value as i16).to_le_bytes());
                    *cell = 0;
                }
            }
            Accumulator::S32(cells) => {
                for n in 0..samples {
                    let cell = &mut cells[(start + n) % capacity];
                    let value = scale_sample(
                        *cell,
                        channel_scale(n),
                        i32::MIN as i64,
                        i32::MAX as i64,
                    );
                    dest[n * 4..n * 4 + 4].copy_from_slice(&(value as i32).to_le_bytes());
                    *cell = 0;
                }
            }
        }

        self.mix_offset = (start + samples) % capacity;
        samples
    }
}
