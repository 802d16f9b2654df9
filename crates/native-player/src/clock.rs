//! Wall-clock playback position.
//!
//! Elapsed time is derived from a monotonic anchor minus accumulated pause time, never from
//! the output device.

use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug)]
pub struct PlaybackClock {
    started: Instant,
    /// Stream position at `started`.
    offset: Duration,
    paused_total: Duration,
    paused_since: Option<Instant>,
}

impl PlaybackClock {
    pub fn start(now: Instant, offset: Duration) -> Self {
        Self {
            started: now,
            offset,
            paused_total: Duration::ZERO,
            paused_since: None,
        }
    }

    /// Freeze the clock. Returns `false` if it was already frozen.
    pub fn pause(&mut self, now: Instant) -> bool {
        if self.paused_since.is_some() {
            return false;
        }
        self.paused_since = Some(now);
        true
    }

    /// Unfreeze the clock. Returns `false` if it was running.
    pub fn resume(&mut self, now: Instant) -> bool {
        match self.paused_since.take() {
            Some(since) => {
                self.paused_total += now.saturating_duration_since(since);
                true
            }
            None => false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }

    pub fn paused_total(&self) -> Duration {
        self.paused_total
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        let until = self.paused_since.unwrap_or(now);
        let running = until
            .saturating_duration_since(self.started)
            .saturating_sub(self.paused_total);
        self.offset + running
    }

    /// Restart from `offset` (after a seek), keeping the paused/running mode.
    pub fn reanchor(&mut self, now: Instant, offset: Duration) {
        let paused = self.is_paused();
        *self = Self::start(now, offset);
        if paused {
            self.paused_since = Some(now);
        }
    }
}
