//! Streaming sample-rate conversion for the output feeder.
//!
//! Wraps Rubato's async sinc resampler with a pending-input buffer so callers can push
//! arbitrarily sized slices of interleaved `f32`.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

/// Incremental resampler from `src_rate` to `dst_rate`.
pub struct StreamResampler {
    channels: usize,
    chunk_frames: usize,
    resampler: Async<f32>,
    indexing: Indexing,
    /// Input not yet processed, always shorter than one chunk between calls.
    pending: Vec<f32>,
    scratch: Vec<f32>,
}

impl StreamResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        let channels = channels.max(1);
        let chunk_frames = chunk_frames.max(1);
        let ratio = dst_rate as f64 / src_rate.max(1) as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let resampler = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| anyhow!("resampler init: {e}"))?;

        let out_frames = (chunk_frames * 3).max((chunk_frames as f64 * ratio * 1.1).ceil() as usize + 16);
        tracing::debug!(src_rate, dst_rate, channels, chunk_frames, "resampler ready");

        Ok(Self {
            channels,
            chunk_frames,
            resampler,
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
            pending: Vec::with_capacity(chunk_frames * channels),
            scratch: vec![0.0; out_frames * channels],
        })
    }

    /// Feed interleaved input; every completed chunk is resampled and appended to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        self.pending.extend_from_slice(input);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_samples {
            let chunk = &self.pending[consumed..consumed + chunk_samples];
            let produced = run_chunk(
                &mut self.resampler,
                &mut self.indexing,
                &mut self.scratch,
                self.channels,
                chunk,
                None,
            )?;
            out.extend_from_slice(&self.scratch[..produced]);
            consumed += chunk_samples;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    /// Resample whatever partial chunk is still pending.
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let frames = self.pending.len() / self.channels;
        if frames > 0 {
            let tail = &self.pending[..frames * self.channels];
            let produced = run_chunk(
                &mut self.resampler,
                &mut self.indexing,
                &mut self.scratch,
                self.channels,
                tail,
                Some(frames),
            )?;
            out.extend_from_slice(&self.scratch[..produced]);
        }
        self.pending.clear();
        Ok(())
    }

    /// Forget pending input and filter state.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }
}

/// Returns the number of output samples written to `scratch`.
fn run_chunk(
    resampler: &mut Async<f32>,
    indexing: &mut Indexing,
    scratch: &mut [f32],
    channels: usize,
    input: &[f32],
    partial_len: Option<usize>,
) -> Result<usize> {
    let in_frames = input.len() / channels;
    let input_adapter = InterleavedSlice::new(input, channels, in_frames)
        .map_err(|e| anyhow!("interleaved slice (input): {e}"))?;
    let out_frames = scratch.len() / channels;
    let mut output_adapter = InterleavedSlice::new_mut(scratch, channels, out_frames)
        .map_err(|e| anyhow!("interleaved slice (output): {e}"))?;

    indexing.input_offset = 0;
    indexing.output_offset = 0;
    indexing.partial_len = partial_len;

    let (_nbr_in, nbr_out) = resampler
        .process_into_buffer(&input_adapter, &mut output_adapter, Some(indexing))
        .map_err(|e| anyhow!("resampler process: {e}"))?;
    Ok(nbr_out * channels)
}
