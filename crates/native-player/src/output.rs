//! Audio output sink boundary and its CPAL binding.
//!
//! The player owns one [`OutputContext`] sized to a `(rate, channels)` pair and creates one
//! [`AudioSink`] per track. A sink pulls s16le PCM from its decoder through the `Read`
//! contract on a feeder thread and hands `f32` samples to the device callback through a
//! bounded [`SampleQueue`].

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use cpal::traits::StreamTrait;
use crossbeam_channel::{Sender, bounded};

use crate::config::OutputConfig;
use crate::decode::Decoder;
use crate::device;
use crate::error::{PlayerError, Result};
use crate::playback::{self, CallbackControls};
use crate::queue::{SampleQueue, calc_max_buffered_samples};
use crate::resample::StreamResampler;

/// Decoder shared between the player (seek/close) and a sink's feeder (read).
pub type PcmSource = Arc<Mutex<Box<dyn Decoder>>>;

/// PCM layout a context is created for. Samples are always signed 16-bit little-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// A playing PCM stream.
pub trait AudioSink: Send {
    fn play(&mut self);
    fn pause(&mut self);
    /// Stop rendering and release the device stream. Idempotent.
    fn close(&mut self);
    /// `false` once the source is exhausted and everything buffered has been rendered.
    fn is_playing(&self) -> bool;
    /// Drop audio that was read from the source but not rendered yet.
    fn discard_buffered(&mut self) {}
}

/// A device session for one [`SinkFormat`].
pub trait OutputContext: Send {
    fn format(&self) -> SinkFormat;
    fn new_sink(&mut self, source: PcmSource, volume: Arc<AtomicU8>) -> Result<Box<dyn AudioSink>>;
    fn suspend(&mut self);
}

/// Factory for output contexts.
pub trait OutputBackend: Send + Sync {
    fn open_context(&self, format: SinkFormat) -> Result<Box<dyn OutputContext>>;
}

fn sink_error(e: anyhow::Error) -> PlayerError {
    PlayerError::SinkCreation(format!("{e:#}"))
}

/// CPAL-backed output.
#[derive(Clone, Debug, Default)]
pub struct CpalBackend {
    output: OutputConfig,
}

impl CpalBackend {
    pub fn new(output: OutputConfig) -> Self {
        Self { output }
    }
}

impl OutputBackend for CpalBackend {
    fn open_context(&self, format: SinkFormat) -> Result<Box<dyn OutputContext>> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, self.output.device.as_deref()).map_err(sink_error)?;
        let supported = device::pick_output_config(&device, format.sample_rate).map_err(sink_error)?;
        let mut config = supported.config();
        if let Some(buffer_size) = device::pick_buffer_size(&supported) {
            config.buffer_size = buffer_size;
        }
        tracing::info!(
            stream_rate = format.sample_rate,
            stream_channels = format.channels,
            device_rate = config.sample_rate,
            device_channels = config.channels,
            sample_format = ?supported.sample_format(),
            "output context opened"
        );
        Ok(Box::new(CpalContext {
            format,
            output: self.output.clone(),
            config,
            sample_format: supported.sample_format(),
            suspended: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct CpalContext {
    format: SinkFormat,
    output: OutputConfig,
    config: cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    suspended: Arc<AtomicBool>,
}

impl OutputContext for CpalContext {
    fn format(&self) -> SinkFormat {
        self.format
    }

    fn new_sink(&mut self, source: PcmSource, volume: Arc<AtomicU8>) -> Result<Box<dyn AudioSink>> {
        let channels = usize::from(self.format.channels.max(1));
        let dst_rate = self.config.sample_rate;
        let queue = Arc::new(SampleQueue::new(
            channels,
            calc_max_buffered_samples(dst_rate, channels, self.output.buffer_seconds),
        ));
        let paused = Arc::new(AtomicBool::new(true));
        let underruns = Arc::new(AtomicU64::new(0));
        let unrendered = Arc::new(AtomicUsize::new(0));
        let controls = CallbackControls {
            refill_max_frames: self.output.refill_max_frames,
            paused: paused.clone(),
            suspended: self.suspended.clone(),
            volume,
            underruns: underruns.clone(),
            unrendered: unrendered.clone(),
        };

        // cpal streams are not Send; the stream lives and dies on its own thread.
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);
        let (close_tx, close_rx) = bounded::<()>(0);
        let needle = self.output.device.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let callback_queue = queue.clone();
        let output_thread = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let host = cpal::default_host();
                let stream = device::pick_device(&host, needle.as_deref()).and_then(|device| {
                    playback::build_output_stream(&device, &config, sample_format, &callback_queue, controls)
                });
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("{e:#}")));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("start stream: {e}")));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Returns once the sink drops its sender.
                let _ = close_rx.recv();
                drop(stream);
            })
            .map_err(|e| PlayerError::SinkCreation(format!("spawn output thread: {e}")))?;

        let started = match ready_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(PlayerError::SinkCreation(msg)),
            Err(_) => Err(PlayerError::SinkCreation("output thread exited".to_string())),
        };
        if let Err(e) = started {
            let _ = output_thread.join();
            return Err(e);
        }

        let mut sink = CpalSink {
            queue: queue.clone(),
            paused,
            underruns,
            unrendered,
            playing: false,
            close_tx: Some(close_tx),
            output_thread: Some(output_thread),
        };
        let feeder = Feeder {
            source,
            queue,
            src_rate: self.format.sample_rate,
            dst_rate,
            channels,
            chunk_frames: self.output.chunk_frames.max(1),
        };
        if let Err(e) = thread::Builder::new()
            .name("audio-feeder".to_string())
            .spawn(move || feeder.run())
        {
            sink.close();
            return Err(PlayerError::SinkCreation(format!("spawn feeder thread: {e}")));
        }
        Ok(Box::new(sink))
    }

    fn suspend(&mut self) {
        if !self.suspended.swap(true, Ordering::Relaxed) {
            tracing::debug!("output context suspended");
        }
    }
}

struct CpalSink {
    queue: Arc<SampleQueue>,
    paused: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    /// Frames the callback popped but has not written to the device yet.
    unrendered: Arc<AtomicUsize>,
    playing: bool,
    close_tx: Option<Sender<()>>,
    output_thread: Option<JoinHandle<()>>,
}

impl AudioSink for CpalSink {
    fn play(&mut self) {
        self.paused.store(false, Ordering::Relaxed);
        self.playing = true;
    }

    fn pause(&mut self) {
        self.paused.store(true, Ordering::Relaxed);
        self.playing = false;
    }

    fn close(&mut self) {
        self.queue.close();
        self.playing = false;
        self.close_tx.take();
        if let Some(handle) = self.output_thread.take() {
            let _ = handle.join();
            let underruns = self.underruns.load(Ordering::Relaxed);
            if underruns > 0 {
                tracing::info!(underruns, "output stream closed");
            } else {
                tracing::debug!("output stream closed");
            }
        }
    }

    fn is_playing(&self) -> bool {
        self.playing
            && !(self.queue.is_drained() && self.unrendered.load(Ordering::Relaxed) == 0)
    }

    fn discard_buffered(&mut self) {
        self.queue.clear();
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pulls PCM from the decoder and keeps the queue topped up.
struct Feeder {
    source: PcmSource,
    queue: Arc<SampleQueue>,
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    chunk_frames: usize,
}

impl Feeder {
    fn run(self) {
        let mut resampler = if self.src_rate == self.dst_rate {
            None
        } else {
            match StreamResampler::new(self.src_rate, self.dst_rate, self.channels, self.chunk_frames) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::error!("resampler init failed: {e:#}");
                    self.queue.finish(self.queue.epoch());
                    return;
                }
            }
        };

        let mut bytes = vec![0u8; self.chunk_frames * self.channels * 2];
        let mut carry = Vec::new();
        let mut samples = Vec::new();
        let mut resampled = Vec::new();
        let mut epoch = self.queue.epoch();

        while !self.queue.is_closed() {
            // The epoch is read under the decoder lock so a concurrent seek is observed
            // together with the data it produced.
            let (read, read_epoch) = {
                let mut decoder = self.source.lock().unwrap_or_else(PoisonError::into_inner);
                let read_epoch = self.queue.epoch();
                (decoder.read(&mut bytes), read_epoch)
            };
            if read_epoch != epoch {
                epoch = read_epoch;
                carry.clear();
                if let Some(r) = resampler.as_mut() {
                    r.reset();
                }
            }

            let n = match read {
                Ok(0) => 0,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %PlayerError::from_io(e), "pcm source failed; ending track");
                    0
                }
            };

            if n > 0 {
                samples.clear();
                s16le_to_f32(&mut carry, &bytes[..n], &mut samples);
                // A rejected push means the queue closed or a seek moved the epoch on; the
                // loop head notices both.
                match resampler.as_mut() {
                    Some(r) => {
                        resampled.clear();
                        match r.process(&samples, &mut resampled) {
                            Ok(()) => {
                                self.queue.push_interleaved_blocking(&resampled, epoch);
                            }
                            Err(e) => tracing::warn!("resample failed: {e:#}"),
                        }
                    }
                    None => {
                        self.queue.push_interleaved_blocking(&samples, epoch);
                    }
                }
                continue;
            }

            if let Some(r) = resampler.as_mut() {
                resampled.clear();
                if let Err(e) = r.flush(&mut resampled) {
                    tracing::warn!("resampler flush failed: {e:#}");
                }
                self.queue.push_interleaved_blocking(&resampled, epoch);
            }
            self.queue.finish(epoch);
            tracing::debug!(epoch, "pcm source exhausted");
            if !self.queue.wait_for_epoch_change(epoch) {
                break;
            }
        }
        tracing::debug!("feeder exiting");
    }
}

/// Decode s16le bytes into `f32` in [-1.0, 1.0), carrying a split sample across calls.
fn s16le_to_f32(carry: &mut Vec<u8>, bytes: &[u8], out: &mut Vec<f32>) {
    carry.extend_from_slice(bytes);
    let whole = carry.len() / 2 * 2;
    out.extend(
        carry[..whole]
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0),
    );
    carry.drain(..whole);
}
