//! Frame decoding: 24-bit sign extension, channel selection and baseline removal

use super::types::{DecodedSample, FrameGeometry, MAX_CHANNELS, RawFrame};
use tracing::{debug, info};

/// Big-endian 24-bit two's complement to `i32`
#[inline]
pub fn sign_extend_24(bytes: [u8; 3]) -> i32 {
    let raw = ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32;
    if raw & 0x0080_0000 != 0 {
        (raw | 0xFF00_0000) as i32
    } else {
        raw as i32
    }
}

/// Decode every channel of a frame, sequence number 0
pub fn decode_frame(frame: &RawFrame) -> DecodedSample {
    let mut values = [0i32; MAX_CHANNELS];
    let channels = frame.channels();
    for (index, value) in values.iter_mut().take(channels).enumerate() {
        if let Some(bytes) = frame.channel_bytes(index) {
            *value = sign_extend_24(bytes);
        }
    }
    DecodedSample::from_parts(0, values, channels)
}

/// Per-channel DC offset estimated from the first `window` samples
///
/// The first `window` samples pass through unchanged while they are
/// accumulated; every later sample has the truncated average subtracted.
#[derive(Debug, Clone)]
pub struct Baseline {
    window: usize,
    seen: usize,
    sums: [i64; MAX_CHANNELS],
    offsets: Option<[i32; MAX_CHANNELS]>,
}

impl Baseline {
    /// Sample count used by the acquisition firmware
    pub const DEFAULT_WINDOW: usize = 500;

    /// `window` of zero disables correction
    pub fn new(window: usize) -> Self {
        Self {
            window,
            seen: 0,
            sums: [0; MAX_CHANNELS],
            offsets: (window == 0).then_some([0; MAX_CHANNELS]),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn is_established(&self) -> bool {
        self.offsets.is_some()
    }

    pub fn offsets(&self) -> Option<&[i32; MAX_CHANNELS]> {
        self.offsets.as_ref()
    }

    pub fn apply(&mut self, sample: &mut DecodedSample) {
        if let Some(offsets) = &self.offsets {
            for (value, offset) in sample.values_mut().iter_mut().zip(offsets) {
                *value = value.saturating_sub(*offset);
            }
            return;
        }

        for (sum, value) in self.sums.iter_mut().zip(sample.values()) {
            *sum += *value as i64;
        }
        self.seen += 1;

        if self.seen == self.window {
            let mut offsets = [0i32; MAX_CHANNELS];
            for (offset, sum) in offsets.iter_mut().zip(&self.sums) {
                *offset = (sum / self.window as i64) as i32;
            }
            info!(
                "Baseline established after {} samples: {:?}",
                self.window,
                &offsets[..sample.len()]
            );
            self.offsets = Some(offsets);
        }
    }
}

/// Turns raw frames into numbered, selected, baseline-corrected samples
#[derive(Debug, Clone)]
pub struct SampleDecoder {
    geometry: FrameGeometry,
    /// 0-based indices into the frame
    selection: Vec<usize>,
    baseline: Option<Baseline>,
    sequence: u64,
}

impl SampleDecoder {
    /// Decode all channels, no baseline
    pub fn new(geometry: FrameGeometry) -> Self {
        Self {
            geometry,
            selection: (0..geometry.channels()).collect(),
            baseline: None,
            sequence: 0,
        }
    }

    /// Forward only the given 1-based channels, in the given order
    pub fn with_selection(mut self, channels: &[usize]) -> Result<Self, String> {
        if channels.is_empty() {
            return Err("channel selection is empty".to_string());
        }
        if channels.len() > self.geometry.channels() {
            return Err(format!(
                "{} channels selected, the frame carries {}",
                channels.len(),
                self.geometry.channels()
            ));
        }
        let mut selection = Vec::with_capacity(channels.len());
        for &channel in channels {
            if channel == 0 || channel > self.geometry.channels() {
                return Err(format!(
                    "channel {} is outside 1..={}",
                    channel,
                    self.geometry.channels()
                ));
            }
            if selection.contains(&(channel - 1)) {
                return Err(format!("channel {} is selected twice", channel));
            }
            selection.push(channel - 1);
        }
        self.selection = selection;
        Ok(self)
    }

    pub fn with_baseline(mut self, window: usize) -> Self {
        self.baseline = Some(Baseline::new(window));
        self
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn selected_channels(&self) -> usize {
        self.selection.len()
    }

    pub fn baseline(&self) -> Option<&Baseline> {
        self.baseline.as_ref()
    }

    pub fn decode(&mut self, frame: &RawFrame) -> DecodedSample {
        let all = decode_frame(frame);
        let mut values = [0i32; MAX_CHANNELS];
        let mut len = 0;
        for &index in self.selection.iter().take(MAX_CHANNELS) {
            if let Some(&value) = all.values().get(index) {
                values[len] = value;
                len += 1;
            }
        }
        if len < self.selection.len() {
            debug!(
                "Frame carries {} channels, {} selected",
                all.len(),
                self.selection.len()
            );
        }

        let mut sample = DecodedSample::from_parts(self.sequence, values, len);
        self.sequence += 1;

        if let Some(baseline) = &mut self.baseline {
            baseline.apply(&mut sample);
        }
        sample
    }
}
