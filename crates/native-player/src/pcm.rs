//! PCM normalization: native decoder frames → interleaved signed 16-bit little-endian.
//!
//! The decode engine hands out frames as raw little-endian bytes in one of two sample
//! representations (`i16` or `f32`) and one of two layouts. Planar data is one contiguous
//! block per channel; it is interleaved while converting.

use crate::error::{PlayerError, Result};

/// Native sample representation of a decoded frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    S16,
    F32,
}

impl SampleFormat {
    /// Bytes per sample.
    pub fn width(self) -> usize {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

/// Channel layout of a decoded frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleLayout {
    /// `L R L R ...`
    Interleaved,
    /// `L L L ... R R R ...`
    Planar,
}

/// One decoded native frame as produced by a decode engine.
#[derive(Clone, Debug, PartialEq)]
pub struct NativeFrame {
    pub format: SampleFormat,
    pub layout: SampleLayout,
    pub channels: usize,
    /// Samples per channel.
    pub samples: usize,
    /// Little-endian sample bytes, `channels * samples * format.width()` long.
    pub data: Vec<u8>,
}

impl NativeFrame {
    /// Bytes the normalized output of this frame occupies.
    pub fn normalized_len(&self) -> usize {
        self.channels * self.samples * 2
    }
}

/// Convert one float sample: hard-clip to [-1.0, 1.0], scale by 32767, truncate.
#[inline]
pub fn f32_to_s16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Normalize `frame` into `out`, replacing its contents.
pub fn normalize(frame: &NativeFrame, out: &mut Vec<u8>) -> Result<()> {
    let expected = frame.channels * frame.samples * frame.format.width();
    if frame.data.len() != expected {
        return Err(PlayerError::Decode(format!(
            "native frame holds {} bytes, expected {expected} ({} ch x {} samples of {:?})",
            frame.data.len(),
            frame.channels,
            frame.samples,
            frame.format
        )));
    }

    out.clear();
    out.reserve(frame.normalized_len());
    let channels = frame.channels;
    let samples = frame.samples;

    match (frame.format, frame.layout) {
        (SampleFormat::S16, SampleLayout::Interleaved) => out.extend_from_slice(&frame.data),
        (SampleFormat::S16, SampleLayout::Planar) => {
            for s in 0..samples {
                for c in 0..channels {
                    let at = (c * samples + s) * 2;
                    out.extend_from_slice(&frame.data[at..at + 2]);
                }
            }
        }
        (SampleFormat::F32, SampleLayout::Interleaved) => {
            for raw in frame.data.chunks_exact(4) {
                let value = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                out.extend_from_slice(&f32_to_s16(value).to_le_bytes());
            }
        }
        (SampleFormat::F32, SampleLayout::Planar) => {
            out.resize(channels * samples * 2, 0);
            for s in 0..samples {
                for c in 0..channels {
                    let at = c * samples * 4 + s * 4;
                    let raw = &frame.data[at..at + 4];
                    let value = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                    let dst = (s * channels + c) * 2;
                    out[dst..dst + 2].copy_from_slice(&f32_to_s16(value).to_le_bytes());
                }
            }
        }
    }
    Ok(())
}
