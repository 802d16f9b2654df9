//! Device callback (CPAL output stream).
//!
//! The callback refills a small local buffer from the [`SampleQueue`] without blocking,
//! maps channels, applies volume and converts to the device sample format. It renders
//! silence while paused or suspended and never drains the queue in that case.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::queue::SampleQueue;

/// Shared controls read by the callback on every buffer.
#[derive(Clone, Debug)]
pub struct CallbackControls {
    /// Max frames pulled from the queue per refill.
    pub refill_max_frames: usize,
    pub paused: Arc<AtomicBool>,
    /// Set when the owning output context is suspended.
    pub suspended: Arc<AtomicBool>,
    /// 0..=100, applied linearly.
    pub volume: Arc<AtomicU8>,
    pub underruns: Arc<AtomicU64>,
    /// Frames popped from the queue but not rendered yet.
    pub unrendered: Arc<AtomicUsize>,
}

/// Build a CPAL output stream fed from `queue`.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SampleQueue>,
    controls: CallbackControls,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, controls),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, controls),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, controls),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, controls),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
    controls: CallbackControls,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let state = Mutex::new(CallbackState::new(queue.channels(), queue.epoch()));
    let queue = queue.clone();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
            render(&mut st, &queue, &controls, channels_out, data);
        },
        |err| tracing::warn!("output stream error: {err}"),
        None,
    )?;
    Ok(stream)
}

/// Local buffer owned by the callback.
struct CallbackState {
    src_channels: usize,
    src: Vec<f32>,
    pos: usize,
    /// Queue epoch the local buffer was filled under.
    epoch: u64,
}

impl CallbackState {
    fn new(src_channels: usize, epoch: u64) -> Self {
        Self {
            src_channels: src_channels.max(1),
            src: Vec::new(),
            pos: 0,
            epoch,
        }
    }
}

/// Fill one device buffer. Returns the number of frames rendered from the source.
fn render<T>(
    st: &mut CallbackState,
    queue: &SampleQueue,
    controls: &CallbackControls,
    channels_out: usize,
    data: &mut [T],
) -> usize
where
    T: cpal::Sample + cpal::FromSample<f32>,
{
    let played = fill(st, queue, controls, channels_out, data);
    let left = st.src.len().saturating_sub(st.pos) / st.src_channels;
    controls.unrendered.store(left, Ordering::Relaxed);
    played
}

fn fill<T>(
    st: &mut CallbackState,
    queue: &SampleQueue,
    controls: &CallbackControls,
    channels_out: usize,
    data: &mut [T],
) -> usize
where
    T: cpal::Sample + cpal::FromSample<f32>,
{
    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
    if controls.paused.load(Ordering::Relaxed) || controls.suspended.load(Ordering::Relaxed) {
        data.fill(silence);
        return 0;
    }

    // A seek cleared the queue; whatever we still hold is stale.
    let epoch = queue.epoch();
    if epoch != st.epoch {
        st.epoch = epoch;
        st.src.clear();
        st.pos = 0;
    }

    let gain = f32::from(controls.volume.load(Ordering::Relaxed).min(100)) / 100.0;
    let channels_out = channels_out.max(1);
    let frames = data.len() / channels_out;
    let mut played = 0;

    for frame in 0..frames {
        if st.pos >= st.src.len() {
            st.pos = 0;
            match queue.pop_up_to(controls.refill_max_frames.max(1)) {
                Some(v) => st.src = v,
                None => {
                    st.src.clear();
                    if !queue.is_drained() {
                        controls.underruns.fetch_add(1, Ordering::Relaxed);
                    }
                    data[frame * channels_out..].fill(silence);
                    return played;
                }
            }
        }
        for ch in 0..channels_out {
            let sample = map_channel(&st.src[st.pos..], st.src_channels, channels_out, ch);
            data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample * gain);
        }
        st.pos += st.src_channels;
        played += 1;
    }
    played
}

/// Sample for output channel `dst_ch` from the source frame at the start of `frame`.
///
/// Mono is duplicated, stereo to mono is averaged, anything else clamps to the last
/// available source channel.
fn map_channel(frame: &[f32], src_channels: usize, dst_channels: usize, dst_ch: usize) -> f32 {
    let get = |ch: usize| frame.get(ch).copied().unwrap_or(0.0);
    match (src_channels, dst_channels) {
        (2, 1) => 0.5 * (get(0) + get(1)),
        (1, _) => get(0),
        _ => get(dst_ch.min(src_channels.saturating_sub(1))),
    }
}
