//! Bounded sample queue between the PCM feeder and the device callback.
//!
//! Samples are interleaved `f32` at the device rate. Every producer write is tagged with the
//! queue *epoch*; [`SampleQueue::clear`] bumps the epoch so that samples decoded before a seek
//! can never land after it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Compute queue capacity in **samples** for a `(rate, channels, seconds)` target.
///
/// Non-finite or non-positive `buffer_seconds` fall back to two seconds.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

struct QueueInner {
    samples: VecDeque<f32>,
    epoch: u64,
    /// Producer reached the end of its source for `epoch`.
    finished: bool,
    /// Sink torn down; everybody stops.
    closed: bool,
}

/// Thread-safe bounded queue of interleaved `f32` samples.
pub struct SampleQueue {
    channels: usize,
    max_buffered_samples: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
    /// Mirror of `inner.epoch` for the realtime callback; written under the lock.
    epoch: AtomicU64,
    low_watermark_ms: AtomicU64,
}

impl SampleQueue {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            max_buffered_samples: max_buffered_samples.max(channels),
            inner: Mutex::new(QueueInner {
                samples: VecDeque::new(),
                epoch: 0,
                finished: false,
                closed: false,
            }),
            cv: Condvar::new(),
            epoch: AtomicU64::new(0),
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Buffered frames (snapshot).
    pub fn len_frames(&self) -> usize {
        self.lock().samples.len() / self.channels
    }

    /// Current epoch without taking the lock.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Push samples produced for `epoch`, blocking while the queue is full.
    ///
    /// Returns `false` (dropping whatever was not pushed yet) once the queue is closed or its
    /// epoch has moved past `epoch`.
    pub fn push_interleaved_blocking(&self, samples: &[f32], epoch: u64) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.lock();
            while g.samples.len() >= self.max_buffered_samples && !g.closed && g.epoch == epoch {
                g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
            }
            if g.closed || g.epoch != epoch {
                return false;
            }

            let room = self.max_buffered_samples - g.samples.len();
            let take = room.min(samples.len() - offset);
            g.samples.extend(&samples[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Pop up to `max_frames` whole frames without blocking.
    pub fn pop_up_to(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.lock();
        let take_frames = (g.samples.len() / self.channels).min(max_frames);
        if take_frames == 0 {
            return None;
        }
        let out: Vec<f32> = g.samples.drain(..take_frames * self.channels).collect();
        let queued = g.samples.len();
        let finished = g.finished;
        drop(g);
        self.cv.notify_all();
        if !finished {
            self.log_low_watermark(queued);
        }
        Some(out)
    }

    fn log_low_watermark(&self, queued: usize) {
        let threshold = (self.max_buffered_samples / 8).max(self.channels * 16);
        if queued == 0 || queued >= threshold {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        let last = self.low_watermark_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) > 1000 {
            self.low_watermark_ms.store(now, Ordering::Relaxed);
            tracing::info!(
                queued_samples = queued,
                threshold_samples = threshold,
                "audio queue low watermark"
            );
        }
    }

    /// Mark the producer for `epoch` as done. Ignored for stale epochs.
    pub fn finish(&self, epoch: u64) {
        let mut g = self.lock();
        if g.epoch == epoch {
            g.finished = true;
            drop(g);
            self.cv.notify_all();
        }
    }

    /// Drop every buffered sample and start a new epoch.
    pub fn clear(&self) -> u64 {
        let mut g = self.lock();
        g.samples.clear();
        g.finished = false;
        g.epoch += 1;
        let epoch = g.epoch;
        self.epoch.store(epoch, Ordering::Release);
        drop(g);
        self.cv.notify_all();
        epoch
    }

    /// Wake and release every waiter for good. Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// The producer finished and the callback consumed everything (or the queue was closed).
    pub fn is_drained(&self) -> bool {
        let g = self.lock();
        g.closed || (g.finished && g.samples.is_empty())
    }

    /// Block until the epoch moves past `epoch`; `false` if the queue closed instead.
    pub fn wait_for_epoch_change(&self, epoch: u64) -> bool {
        let mut g = self.lock();
        while g.epoch == epoch && !g.closed {
            g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
        !g.closed
    }
}
