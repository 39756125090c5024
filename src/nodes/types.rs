//! Frame and sample types shared by the driver and the pipeline nodes

use std::fmt;

/// Status word length at the start of every frame
pub const STATUS_BYTES: usize = 3;
/// Bytes per channel conversion (24-bit two's complement, MSB first)
pub const BYTES_PER_CHANNEL: usize = 3;
/// Largest channel count in the device family
pub const MAX_CHANNELS: usize = 8;
/// Largest frame: status word plus eight channels
pub const MAX_FRAME_BYTES: usize = STATUS_BYTES + BYTES_PER_CHANNEL * MAX_CHANNELS;

/// Channel count of the attached device, fixed at configuration time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameGeometry {
    channels: usize,
}

impl FrameGeometry {
    /// Returns `None` unless `channels` is within `1..=8`
    pub fn new(channels: usize) -> Option<Self> {
        (1..=MAX_CHANNELS)
            .contains(&channels)
            .then_some(Self { channels })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// `3 + 3 * N`
    pub fn frame_len(&self) -> usize {
        STATUS_BYTES + BYTES_PER_CHANNEL * self.channels
    }
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self {
            channels: MAX_CHANNELS,
        }
    }
}

/// Decoded status word: `1100 | LOFF_STATP | LOFF_STATN | GPIO[7:4]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStatus {
    /// Top nibble, `0b1100` on a well-formed frame
    pub header: u8,
    /// Lead-off status, positive inputs (bit n = channel n+1)
    pub loff_statp: u8,
    /// Lead-off status, negative inputs
    pub loff_statn: u8,
    pub gpio: u8,
}

impl FrameStatus {
    pub const HEADER: u8 = 0b1100;

    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        // 24 bits: 4 header, 8 STATP, 8 STATN, 4 GPIO
        let word = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
        Self {
            header: ((word >> 20) & 0x0F) as u8,
            loff_statp: ((word >> 12) & 0xFF) as u8,
            loff_statn: ((word >> 4) & 0xFF) as u8,
            gpio: (word & 0x0F) as u8,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.header == Self::HEADER
    }

    pub fn lead_off(&self) -> bool {
        self.loff_statp != 0 || self.loff_statn != 0
    }
}

/// One frame as clocked out of the device, stored inline
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    bytes: [u8; MAX_FRAME_BYTES],
    len: usize,
}

impl RawFrame {
    /// Zeroed frame sized for `geometry`
    pub fn new(geometry: FrameGeometry) -> Self {
        Self {
            bytes: [0; MAX_FRAME_BYTES],
            len: geometry.frame_len(),
        }
    }

    /// Build from captured bytes; `None` if the length is not `3 + 3 * N`
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let len = bytes.len();
        if len < STATUS_BYTES + BYTES_PER_CHANNEL
            || len > MAX_FRAME_BYTES
            || (len - STATUS_BYTES) % BYTES_PER_CHANNEL != 0
        {
            return None;
        }
        let mut frame = Self {
            bytes: [0; MAX_FRAME_BYTES],
            len,
        };
        frame.bytes[..len].copy_from_slice(bytes);
        Some(frame)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Transfer buffer for the driver to fill
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    pub fn channels(&self) -> usize {
        (self.len - STATUS_BYTES) / BYTES_PER_CHANNEL
    }

    pub fn status(&self) -> FrameStatus {
        FrameStatus::from_bytes([self.bytes[0], self.bytes[1], self.bytes[2]])
    }

    /// Raw bytes of channel `index` (0-based)
    pub fn channel_bytes(&self, index: usize) -> Option<[u8; 3]> {
        if index >= self.channels() {
            return None;
        }
        let offset = STATUS_BYTES + BYTES_PER_CHANNEL * index;
        Some([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
        ])
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("len", &self.len)
            .field("bytes", &self.as_bytes())
            .finish()
    }
}

/// Decoded, signed channel values of one frame
///
/// Values live inline so moving a sample through the hand-off never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedSample {
    pub sequence: u64,
    len: u8,
    values: [i32; MAX_CHANNELS],
}

impl DecodedSample {
    /// Largest value representable on the wire
    pub const WIRE_MAX: i32 = (1 << 23) - 1;
    pub const WIRE_MIN: i32 = -(1 << 23);

    /// `None` if more than eight values are given
    pub fn new(sequence: u64, values: &[i32]) -> Option<Self> {
        if values.len() > MAX_CHANNELS {
            return None;
        }
        let mut inline = [0; MAX_CHANNELS];
        inline[..values.len()].copy_from_slice(values);
        Some(Self {
            sequence,
            len: values.len() as u8,
            values: inline,
        })
    }

    /// First `len` entries of `values` are meaningful
    pub(crate) fn from_parts(sequence: u64, values: [i32; MAX_CHANNELS], len: usize) -> Self {
        Self {
            sequence,
            len: len.min(MAX_CHANNELS) as u8,
            values,
        }
    }

    pub fn values(&self) -> &[i32] {
        &self.values[..self.len as usize]
    }

    pub fn values_mut(&mut self) -> &mut [i32] {
        &mut self.values[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn wire_len(&self) -> usize {
        self.len() * BYTES_PER_CHANNEL
    }

    /// Write each value as a 3-byte big-endian two's-complement word,
    /// clamped to the 24-bit range. Returns the number of bytes written,
    /// or `None` if `out` is too small.
    pub fn encode_wire(&self, out: &mut [u8]) -> Option<usize> {
        let needed = self.wire_len();
        if out.len() < needed {
            return None;
        }
        for (chunk, &value) in out[..needed]
            .chunks_exact_mut(BYTES_PER_CHANNEL)
            .zip(self.values())
        {
            let clamped = value.clamp(Self::WIRE_MIN, Self::WIRE_MAX);
            let be = clamped.to_be_bytes();
            chunk.copy_from_slice(&be[1..]);
        }
        Some(needed)
    }
}
