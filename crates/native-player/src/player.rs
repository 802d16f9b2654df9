//! Playback state machine.
//!
//! [`Player`] owns the current/next track, the live decoder/sink pair and the output context.
//! Transport calls return quickly; natural completion and gapless advance run on the monitor
//! thread, the actual decoder seek on its companion seek thread.
//!
//! Locking: `playback` (decoder/sink pair, held across I/O) is always taken before `state`
//! (cheap fields, never held across I/O). A decoder's own lock is only taken while `playback`
//! is held and `state` is not. Notifications fire after both are released.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use player_types::{PlaybackState, PlayerStatus, TrackMetadata};

use crate::clock::PlaybackClock;
use crate::config::PlayerConfig;
use crate::decode::{Decoder, MediaOpener, SymphoniaOpener};
use crate::error::{PlayerError, Result};
use crate::monitor::{self, MonitorHandle, MonitorMsg};
use crate::output::{AudioSink, CpalBackend, OutputBackend, OutputContext, PcmSource, SinkFormat};

/// A playable track: where to find it plus caller-supplied metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Track {
    pub locator: String,
    pub metadata: TrackMetadata,
}

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
struct Callbacks {
    playing: Vec<Callback>,
    paused: Vec<Callback>,
    stopped: Vec<Callback>,
    track_change: Vec<Callback>,
    seek: Vec<Callback>,
}

impl Callbacks {
    fn for_event(&self, event: Event) -> &[Callback] {
        match event {
            Event::Playing => &self.playing,
            Event::Paused => &self.paused,
            Event::Stopped => &self.stopped,
            Event::TrackChange => &self.track_change,
            Event::Seek => &self.seek,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Event {
    Playing,
    Paused,
    Stopped,
    TrackChange,
    Seek,
}

struct SharedState {
    initialized: bool,
    state: PlaybackState,
    /// State to return to on resume.
    pre_pause: PlaybackState,
    seeking: bool,
    seek_generation: u64,
    pending_seek: Option<Duration>,
    current: Option<Track>,
    next: Option<Track>,
    playlist_pos: u32,
    playlist_len: u32,
    stop_requested: bool,
    clock: Option<PlaybackClock>,
    /// Decoder-reported length of the current track, zero when unknown.
    length: Duration,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            initialized: false,
            state: PlaybackState::Stopped,
            pre_pause: PlaybackState::Stopped,
            seeking: false,
            seek_generation: 0,
            pending_seek: None,
            current: None,
            next: None,
            playlist_pos: 0,
            playlist_len: 0,
            stop_requested: false,
            clock: None,
            length: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct Playback {
    context: Option<Box<dyn OutputContext>>,
    sink: Option<Box<dyn AudioSink>>,
    decoder: Option<PcmSource>,
}

pub(crate) struct Inner {
    config: PlayerConfig,
    opener: Arc<dyn MediaOpener>,
    backend: Arc<dyn OutputBackend>,
    state: Mutex<SharedState>,
    playback: Mutex<Playback>,
    volume: Arc<AtomicU8>,
    callbacks: Mutex<Callbacks>,
    monitor: Mutex<Option<MonitorHandle>>,
}

/// Handle to a player. Clones share the same player.
#[derive(Clone)]
pub struct Player {
    inner: Arc<Inner>,
}

impl Player {
    /// Player with the Symphonia decoder and the CPAL output device.
    pub fn new(config: PlayerConfig) -> Self {
        let opener = Arc::new(SymphoniaOpener::new(config.http.clone()));
        let backend = Arc::new(CpalBackend::new(config.output.clone()));
        Self::with_backends(config, opener, backend)
    }

    /// Player with custom decoding and output implementations.
    pub fn with_backends(
        config: PlayerConfig,
        opener: Arc<dyn MediaOpener>,
        backend: Arc<dyn OutputBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                opener,
                backend,
                state: Mutex::new(SharedState::default()),
                playback: Mutex::new(Playback::default()),
                volume: Arc::new(AtomicU8::new(100)),
                callbacks: Mutex::new(Callbacks::default()),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Start the monitor loop. Calling it on an initialized player does nothing.
    pub fn init(&self) -> Result<()> {
        let mut monitor = lock(&self.inner.monitor);
        if self.inner.lock_state().initialized {
            return Ok(());
        }
        let handle = monitor::spawn(
            Arc::downgrade(&self.inner),
            self.inner.config.poll_interval,
            self.inner.config.seek_debounce,
        )?;
        *monitor = Some(handle);
        let mut st = self.inner.lock_state();
        st.initialized = true;
        st.stop_requested = false;
        tracing::debug!("player initialized");
        Ok(())
    }

    /// Replace whatever is playing with `locator`, starting at `start`.
    ///
    /// The new decoder is opened before the current pair is torn down, so a track that fails
    /// to open leaves the current one playing. A failure to create the output sink leaves
    /// the player stopped.
    pub fn play(&self, locator: &str, metadata: TrackMetadata, start: Duration) -> Result<()> {
        let track = Track {
            locator: locator.to_string(),
            metadata,
        };
        let mut events = Vec::new();
        let result = {
            let mut pb = self.inner.lock_playback();
            let result = self.inner.load_locked(&mut pb, track, start, &mut events);
            if result.is_ok() {
                let mut st = self.inner.lock_state();
                st.next = None;
                st.playlist_pos = 0;
                st.playlist_len = 1;
            }
            result
        };
        self.inner.emit(events);
        result
    }

    /// Queue `locator` to follow the current track; an empty locator clears the queue.
    pub fn set_next(&self, locator: &str, metadata: TrackMetadata) -> Result<()> {
        let mut st = self.inner.lock_state();
        ensure_init(&st)?;
        if st.playlist_len > st.playlist_pos + 1 {
            st.playlist_len -= 1;
        }
        if locator.is_empty() {
            st.next = None;
            tracing::debug!("next track cleared");
        } else {
            st.next = Some(Track {
                locator: locator.to_string(),
                metadata,
            });
            st.playlist_len += 1;
            tracing::debug!(locator, "next track queued");
        }
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut pb = self.inner.lock_playback();
            let mut st = self.inner.lock_state();
            ensure_init(&st)?;
            if st.state != PlaybackState::Playing {
                return Ok(());
            }
            if let Some(clock) = st.clock.as_mut() {
                clock.pause(Instant::now());
            }
            if let Some(sink) = pb.sink.as_mut() {
                sink.pause();
            }
            st.pre_pause = st.state;
            set_state(&mut st, PlaybackState::Paused, &mut events);
        }
        self.inner.emit(events);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut pb = self.inner.lock_playback();
            let mut st = self.inner.lock_state();
            ensure_init(&st)?;
            if st.state != PlaybackState::Paused {
                return Ok(());
            }
            if let Some(clock) = st.clock.as_mut() {
                clock.resume(Instant::now());
            }
            if let Some(sink) = pb.sink.as_mut() {
                sink.play();
            }
            let back_to = st.pre_pause;
            set_state(&mut st, back_to, &mut events);
        }
        self.inner.emit(events);
        Ok(())
    }

    /// Request a seek; the decoder is repositioned off the caller's thread. Fails with
    /// [`PlayerError::Seek`] when nothing is loaded.
    ///
    /// The seeking flag rises immediately and falls after the debounce window, at which
    /// point the seek notification fires.
    pub fn seek(&self, position: Duration) -> Result<()> {
        let generation = {
            let mut st = self.inner.lock_state();
            ensure_init(&st)?;
            if st.state == PlaybackState::Stopped {
                return Err(PlayerError::Seek("nothing is playing".to_string()));
            }
            st.pending_seek = Some(position);
            st.seeking = true;
            st.seek_generation += 1;
            st.seek_generation
        };
        tracing::debug!(target_ms = position.as_millis() as u64, generation, "seek requested");
        if let Some(monitor) = lock(&self.inner.monitor).as_ref() {
            monitor.send(MonitorMsg::Seek { generation });
        }
        Ok(())
    }

    pub fn seek_seconds(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(PlayerError::Seek(format!("invalid target {seconds}s")));
        }
        let position = Duration::try_from_secs_f64(seconds)
            .map_err(|e| PlayerError::Seek(format!("invalid target {seconds}s: {e}")))?;
        self.seek(position)
    }

    pub fn is_seeking(&self) -> bool {
        let st = self.inner.lock_state();
        st.seeking && st.state == PlaybackState::Playing
    }

    /// Clamp to 0..=100 and store; the sink applies it from its next buffer on.
    pub fn set_volume(&self, volume: i32) {
        let clamped = volume.clamp(0, 100) as u8;
        self.inner.volume.store(clamped, Ordering::Relaxed);
    }

    pub fn volume(&self) -> u8 {
        self.inner.volume.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot.
    pub fn status(&self) -> PlayerStatus {
        let st = self.inner.lock_state();
        let track = st.current.as_ref();
        let duration_ms = track
            .and_then(|t| t.metadata.duration_ms)
            .or_else(|| (!st.length.is_zero()).then(|| st.length.as_millis() as u64));
        let elapsed = match st.state {
            PlaybackState::Stopped => Duration::ZERO,
            _ => st
                .pending_seek
                .or_else(|| st.clock.map(|c| c.elapsed(Instant::now())))
                .unwrap_or_default(),
        };
        let mut elapsed_ms = elapsed.as_millis() as u64;
        if let Some(total) = duration_ms {
            elapsed_ms = elapsed_ms.min(total);
        }
        PlayerStatus {
            state: st.state,
            elapsed_ms,
            duration_ms,
            volume: self.volume(),
            seeking: st.seeking && st.state == PlaybackState::Playing,
            playlist_pos: st.playlist_pos,
            playlist_len: st.playlist_len,
            now_playing: track.map(|t| t.locator.clone()),
            track: track.map(|t| t.metadata.clone()),
        }
    }

    pub fn current_track(&self) -> Option<Track> {
        self.inner.lock_state().current.clone()
    }

    pub fn next_track(&self) -> Option<Track> {
        self.inner.lock_state().next.clone()
    }

    pub fn stop(&self) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut pb = self.inner.lock_playback();
            ensure_init(&self.inner.lock_state())?;
            self.inner.halt_locked(&mut pb, &mut events);
        }
        self.inner.emit(events);
        Ok(())
    }

    /// Stop, cancel the monitor, suspend the output context and mark the player
    /// uninitialized. Does nothing on an uninitialized player.
    pub fn destroy(&self) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut pb = self.inner.lock_playback();
            if !self.inner.lock_state().initialized {
                return Ok(());
            }
            self.inner.halt_locked(&mut pb, &mut events);
            if let Some(mut context) = pb.context.take() {
                context.suspend();
            }
            self.inner.lock_state().initialized = false;
        }
        let monitor = lock(&self.inner.monitor).take();
        if let Some(monitor) = monitor {
            monitor.shutdown();
        }
        tracing::debug!("player destroyed");
        self.inner.emit(events);
        Ok(())
    }

    pub fn on_playing(&self, f: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.callbacks).playing.push(Arc::new(f));
    }

    pub fn on_paused(&self, f: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.callbacks).paused.push(Arc::new(f));
    }

    pub fn on_stopped(&self, f: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.callbacks).stopped.push(Arc::new(f));
    }

    pub fn on_track_change(&self, f: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.callbacks).track_change.push(Arc::new(f));
    }

    pub fn on_seek(&self, f: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.callbacks).seek.push(Arc::new(f));
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ensure_init(st: &SharedState) -> Result<()> {
    if st.initialized {
        Ok(())
    } else {
        Err(PlayerError::Uninitialized)
    }
}

fn set_state(st: &mut SharedState, state: PlaybackState, events: &mut Vec<Event>) {
    if st.state == state {
        return;
    }
    tracing::debug!(from = ?st.state, to = ?state, "state change");
    st.state = state;
    events.push(match state {
        PlaybackState::Playing => Event::Playing,
        PlaybackState::Paused => Event::Paused,
        PlaybackState::Stopped => Event::Stopped,
    });
}

fn reset_to_stopped(st: &mut SharedState, events: &mut Vec<Event>) {
    st.current = None;
    st.next = None;
    st.clock = None;
    st.length = Duration::ZERO;
    st.pending_seek = None;
    st.seeking = false;
    // Invalidate any debounce timer still in flight.
    st.seek_generation += 1;
    st.playlist_pos = 0;
    st.playlist_len = 0;
    st.pre_pause = PlaybackState::Stopped;
    set_state(st, PlaybackState::Stopped, events);
}

fn lock_decoder(decoder: &PcmSource) -> MutexGuard<'_, Box<dyn Decoder>> {
    lock(decoder)
}

fn teardown(pb: &mut Playback) {
    if let Some(mut sink) = pb.sink.take() {
        sink.close();
    }
    if let Some(decoder) = pb.decoder.take() {
        lock_decoder(&decoder).close();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SharedState> {
        lock(&self.state)
    }

    fn lock_playback(&self) -> MutexGuard<'_, Playback> {
        lock(&self.playback)
    }

    fn emit(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let callbacks = lock(&self.callbacks).clone();
        for event in events {
            for callback in callbacks.for_event(event) {
                callback();
            }
        }
    }

    /// Open `track` and make it the playing pair. Caller holds the playback lock.
    fn load_locked(
        &self,
        pb: &mut Playback,
        track: Track,
        start: Duration,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        ensure_init(&self.lock_state())?;

        let decoder = self.opener.open(&track.locator)?;
        let format = SinkFormat {
            sample_rate: decoder.sample_rate(),
            channels: decoder.channel_count(),
        };
        let length = decoder.length();
        tracing::info!(
            locator = %track.locator,
            rate_hz = format.sample_rate,
            channels = format.channels,
            length_ms = length.as_millis() as u64,
            "track opened"
        );

        teardown(pb);
        let decoder: PcmSource = Arc::new(Mutex::new(decoder));

        let mut offset = Duration::ZERO;
        if !start.is_zero() {
            match lock_decoder(&decoder).seek(start) {
                Ok(()) => offset = start,
                Err(e) => tracing::warn!(
                    start_ms = start.as_millis() as u64,
                    error = %e,
                    "start offset not applied"
                ),
            }
        }

        let sink = self
            .ensure_context(pb, format)
            .and_then(|context| context.new_sink(decoder.clone(), self.volume.clone()));
        let mut sink = match sink {
            Ok(sink) => sink,
            Err(e) => {
                lock_decoder(&decoder).close();
                reset_to_stopped(&mut self.lock_state(), events);
                return Err(e);
            }
        };
        sink.play();
        pb.sink = Some(sink);
        pb.decoder = Some(decoder);

        let mut st = self.lock_state();
        st.current = Some(track);
        st.clock = Some(PlaybackClock::start(Instant::now(), offset));
        st.length = length;
        st.pending_seek = None;
        st.stop_requested = false;
        st.pre_pause = PlaybackState::Playing;
        set_state(&mut st, PlaybackState::Playing, events);
        events.push(Event::TrackChange);
        Ok(())
    }

    /// Output context for `format`, reusing the current one when it matches.
    fn ensure_context<'a>(
        &self,
        pb: &'a mut Playback,
        format: SinkFormat,
    ) -> Result<&'a mut Box<dyn OutputContext>> {
        let context = match pb.context.take() {
            Some(context) if context.format() == format => context,
            stale => {
                if let Some(mut old) = stale {
                    old.suspend();
                }
                self.backend.open_context(format)?
            }
        };
        Ok(pb.context.insert(context))
    }

    /// Tear down the pair and reset to Stopped. Caller holds the playback lock.
    fn halt_locked(&self, pb: &mut Playback, events: &mut Vec<Event>) {
        self.lock_state().stop_requested = true;
        teardown(pb);
        reset_to_stopped(&mut self.lock_state(), events);
    }

    /// One monitor tick.
    ///
    /// Completion is not judged while a seek is outstanding.
    pub(crate) fn tick(&self) {
        {
            let st = self.lock_state();
            if !st.initialized
                || st.stop_requested
                || st.state != PlaybackState::Playing
                || st.pending_seek.is_some()
            {
                return;
            }
        }
        self.advance_if_finished();
    }

    /// Reposition the decoder to the pending seek target and re-anchor the clock.
    ///
    /// The target stays pending (and reported by `status`) until the decoder is done, unless
    /// a newer request replaced it meanwhile.
    pub(crate) fn apply_pending_seek(&self) {
        let mut pb = self.lock_playback();
        let target = {
            let st = self.lock_state();
            if st.stop_requested {
                return;
            }
            st.pending_seek
        };
        let Some(target) = target else { return };
        let Some(decoder) = pb.decoder.clone() else {
            self.lock_state().pending_seek = None;
            return;
        };

        let result = {
            let mut decoder = lock_decoder(&decoder);
            let result = decoder.seek(target);
            if result.is_ok() {
                if let Some(sink) = pb.sink.as_mut() {
                    sink.discard_buffered();
                }
            }
            result
        };
        let mut st = self.lock_state();
        if st.pending_seek == Some(target) {
            st.pending_seek = None;
        }
        match result {
            Ok(()) => {
                if let Some(clock) = st.clock.as_mut() {
                    clock.reanchor(Instant::now(), target);
                }
                tracing::debug!(target_ms = target.as_millis() as u64, "seek applied");
            }
            Err(e) => tracing::warn!(target_ms = target.as_millis() as u64, error = %e, "seek failed"),
        }
    }

    /// Lower the seeking flag if no newer seek arrived meanwhile.
    pub(crate) fn finish_seek(&self, generation: u64) {
        let settled = {
            let mut st = self.lock_state();
            if st.seek_generation == generation && st.seeking {
                st.seeking = false;
                true
            } else {
                false
            }
        };
        if settled {
            self.emit(vec![Event::Seek]);
        }
    }

    /// Natural completion: promote the queued track or stop.
    fn advance_if_finished(&self) {
        let mut events = Vec::new();
        {
            let mut pb = match self.playback.try_lock() {
                Ok(pb) => pb,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                // A transport call or seek is busy with the pair; look again next tick.
                Err(TryLockError::WouldBlock) => return,
            };
            // Polled before the state lock: a sink may consult its decoder.
            let exhausted = pb.sink.as_ref().is_some_and(|sink| !sink.is_playing());
            if !exhausted {
                return;
            }
            let next = {
                let mut st = self.lock_state();
                if st.stop_requested || st.state != PlaybackState::Playing {
                    return;
                }
                st.next.take()
            };
            match next {
                Some(track) => {
                    tracing::info!(locator = %track.locator, "advancing to next track");
                    match self.load_locked(&mut pb, track, Duration::ZERO, &mut events) {
                        Ok(()) => self.lock_state().playlist_pos += 1,
                        Err(e) => {
                            tracing::error!(error = %e, "next track failed; stopping");
                            self.halt_locked(&mut pb, &mut events);
                        }
                    }
                }
                None => {
                    tracing::info!("playlist finished");
                    self.halt_locked(&mut pb, &mut events);
                }
            }
        }
        self.emit(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    const CHUNK: usize = 4096;

    #[derive(Clone, Copy)]
    struct Shape {
        rate: u32,
        channels: u16,
        length: Duration,
        bytes: u64,
        seek_delay: Duration,
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn log_has(log: &Log, entry: &str) -> bool {
        log.lock().unwrap().iter().any(|e| e == entry)
    }

    struct MockDecoder {
        name: String,
        shape: Shape,
        remaining: u64,
        closed: bool,
        log: Log,
    }

    impl Read for MockDecoder {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.closed {
                return Ok(0);
            }
            let n = (buf.len() as u64).min(self.remaining) as usize;
            buf[..n].fill(0);
            self.remaining -= n as u64;
            Ok(n)
        }
    }

    impl Decoder for MockDecoder {
        fn sample_rate(&self) -> u32 {
            self.shape.rate
        }
        fn channel_count(&self) -> u16 {
            self.shape.channels
        }
        fn seek(&mut self, position: Duration) -> Result<()> {
            thread::sleep(self.shape.seek_delay);
            if position > self.shape.length && !self.shape.length.is_zero() {
                return Err(PlayerError::Seek("past end".to_string()));
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("seek {} {}ms", self.name, position.as_millis()));
            Ok(())
        }
        fn length(&self) -> Duration {
            self.shape.length
        }
        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.log.lock().unwrap().push(format!("close {}", self.name));
            }
        }
    }

    struct MockOpener {
        tracks: HashMap<String, Shape>,
        log: Log,
    }

    impl MediaOpener for MockOpener {
        fn open(&self, locator: &str) -> Result<Box<dyn Decoder>> {
            let shape = self
                .tracks
                .get(locator)
                .copied()
                .ok_or_else(|| PlayerError::Open(format!("no such track {locator}")))?;
            self.log.lock().unwrap().push(format!("open {locator}"));
            Ok(Box::new(MockDecoder {
                name: locator.to_string(),
                shape,
                remaining: shape.bytes,
                closed: false,
                log: self.log.clone(),
            }))
        }
    }

    struct MockBackend {
        log: Log,
        fail_sinks: Arc<AtomicBool>,
    }

    impl OutputBackend for MockBackend {
        fn open_context(&self, format: SinkFormat) -> Result<Box<dyn OutputContext>> {
            self.log
                .lock()
                .unwrap()
                .push(format!("context {}/{}", format.sample_rate, format.channels));
            Ok(Box::new(MockContext {
                format,
                log: self.log.clone(),
                fail_sinks: self.fail_sinks.clone(),
            }))
        }
    }

    struct MockContext {
        format: SinkFormat,
        log: Log,
        fail_sinks: Arc<AtomicBool>,
    }

    impl OutputContext for MockContext {
        fn format(&self) -> SinkFormat {
            self.format
        }

        fn new_sink(&mut self, source: PcmSource, _volume: Arc<AtomicU8>) -> Result<Box<dyn AudioSink>> {
            if self.fail_sinks.load(Ordering::Relaxed) {
                return Err(PlayerError::SinkCreation("device unplugged".to_string()));
            }
            Ok(Box::new(MockSink {
                source,
                playing: false,
                drained: AtomicBool::new(false),
                log: self.log.clone(),
            }))
        }

        fn suspend(&mut self) {
            self.log.lock().unwrap().push(format!(
                "suspend {}/{}",
                self.format.sample_rate, self.format.channels
            ));
        }
    }

    /// Renders one chunk of its source every time it is polled.
    struct MockSink {
        source: PcmSource,
        playing: bool,
        drained: AtomicBool,
        log: Log,
    }

    impl AudioSink for MockSink {
        fn play(&mut self) {
            self.playing = true;
        }
        fn pause(&mut self) {
            self.playing = false;
        }
        fn close(&mut self) {
            self.playing = false;
            self.log.lock().unwrap().push("close sink".to_string());
        }
        fn is_playing(&self) -> bool {
            if !self.playing {
                return false;
            }
            if !self.drained.load(Ordering::Relaxed) {
                let mut buf = [0u8; CHUNK];
                let n = self.source.lock().unwrap().read(&mut buf).unwrap_or(0);
                if n == 0 {
                    self.drained.store(true, Ordering::Relaxed);
                }
            }
            !self.drained.load(Ordering::Relaxed)
        }
        fn discard_buffered(&mut self) {
            self.log.lock().unwrap().push("discard".to_string());
        }
    }

    #[derive(Default, Clone)]
    struct Counters {
        playing: Arc<AtomicUsize>,
        paused: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
        track_change: Arc<AtomicUsize>,
        seek: Arc<AtomicUsize>,
    }

    impl Counters {
        fn attach(player: &Player) -> Self {
            let c = Counters::default();
            let bump = |counter: &Arc<AtomicUsize>| {
                let counter = counter.clone();
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            };
            player.on_playing(bump(&c.playing));
            player.on_paused(bump(&c.paused));
            player.on_stopped(bump(&c.stopped));
            player.on_track_change(bump(&c.track_change));
            player.on_seek(bump(&c.seek));
            c
        }

        fn get(counter: &Arc<AtomicUsize>) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        player: Player,
        log: Log,
        fail_sinks: Arc<AtomicBool>,
        counters: Counters,
    }

    fn shape(rate: u32, length_secs: u64, chunks: u64) -> Shape {
        Shape {
            rate,
            channels: 2,
            length: Duration::from_secs(length_secs),
            bytes: chunks * CHUNK as u64,
            seek_delay: Duration::ZERO,
        }
    }

    fn harness() -> Harness {
        let log: Log = Arc::default();
        let mut tracks = HashMap::new();
        tracks.insert("short-a".to_string(), shape(44_100, 1, 8));
        tracks.insert("short-b".to_string(), shape(44_100, 1, 8));
        tracks.insert("long-a".to_string(), shape(44_100, 180, u64::MAX / CHUNK as u64));
        tracks.insert("long-b".to_string(), shape(44_100, 180, u64::MAX / CHUNK as u64));
        tracks.insert("long-48k".to_string(), shape(48_000, 180, u64::MAX / CHUNK as u64));
        tracks.insert(
            "slow-seek".to_string(),
            Shape {
                seek_delay: Duration::from_millis(600),
                ..shape(44_100, 180, u64::MAX / CHUNK as u64)
            },
        );
        let opener = Arc::new(MockOpener {
            tracks,
            log: log.clone(),
        });
        let fail_sinks = Arc::new(AtomicBool::new(false));
        let backend = Arc::new(MockBackend {
            log: log.clone(),
            fail_sinks: fail_sinks.clone(),
        });
        let config = PlayerConfig {
            poll_interval: Duration::from_millis(10),
            seek_debounce: Duration::from_millis(30),
            ..PlayerConfig::default()
        };
        let player = Player::with_backends(config, opener, backend);
        let counters = Counters::attach(&player);
        Harness {
            player,
            log,
            fail_sinks,
            counters,
        }
    }

    fn meta(title: &str) -> TrackMetadata {
        TrackMetadata {
            title: Some(title.to_string()),
            ..TrackMetadata::default()
        }
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn transport_requires_init() {
        let h = harness();
        let p = &h.player;
        assert!(matches!(
            p.play("long-a", meta("a"), Duration::ZERO),
            Err(PlayerError::Uninitialized)
        ));
        assert!(matches!(p.pause(), Err(PlayerError::Uninitialized)));
        assert!(matches!(p.resume(), Err(PlayerError::Uninitialized)));
        assert!(matches!(p.stop(), Err(PlayerError::Uninitialized)));
        assert!(matches!(p.seek_seconds(1.0), Err(PlayerError::Uninitialized)));
        assert!(matches!(
            p.set_next("long-b", meta("b")),
            Err(PlayerError::Uninitialized)
        ));
        assert_eq!(p.status().state, PlaybackState::Stopped);
        assert_eq!(p.volume(), 100);
        assert!(!log_has(&h.log, "open long-a"));
    }

    #[test]
    fn play_starts_track_and_notifies_once() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("long-a", meta("a"), Duration::ZERO).unwrap();

        let status = h.player.status();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(status.now_playing.as_deref(), Some("long-a"));
        assert_eq!(status.duration_ms, Some(180_000));
        assert_eq!((status.playlist_pos, status.playlist_len), (0, 1));
        assert_eq!(Counters::get(&h.counters.playing), 1);
        assert_eq!(Counters::get(&h.counters.track_change), 1);
        h.player.destroy().unwrap();
    }

    #[test]
    fn gapless_advance_fires_exactly_one_track_change() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("short-a", meta("a"), Duration::ZERO).unwrap();
        h.player.set_next("long-b", meta("b")).unwrap();
        assert_eq!(h.player.status().playlist_len, 2);

        wait_until("advance to long-b", || {
            h.player
                .current_track()
                .is_some_and(|t| t.locator == "long-b")
        });
        let status = h.player.status();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!((status.playlist_pos, status.playlist_len), (1, 2));
        assert_eq!(status.track, Some(meta("b")));
        assert!(h.player.next_track().is_none());
        assert_eq!(Counters::get(&h.counters.track_change), 2);
        assert_eq!(Counters::get(&h.counters.playing), 1);
        assert_eq!(Counters::get(&h.counters.stopped), 0);
        assert!(log_has(&h.log, "close short-a"));
        h.player.destroy().unwrap();
    }

    #[test]
    fn completion_without_next_stops() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("short-a", meta("a"), Duration::ZERO).unwrap();
        wait_until("stop", || h.player.status().state == PlaybackState::Stopped);

        let status = h.player.status();
        assert_eq!((status.playlist_pos, status.playlist_len), (0, 0));
        assert!(status.now_playing.is_none());
        assert_eq!(status.elapsed_ms, 0);
        assert_eq!(Counters::get(&h.counters.stopped), 1);
        assert!(log_has(&h.log, "close sink"));
        h.player.destroy().unwrap();
    }

    #[test]
    fn failed_advance_stops_instead_of_skipping() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("short-a", meta("a"), Duration::ZERO).unwrap();
        h.player.set_next("missing", meta("gone")).unwrap();
        wait_until("stop", || h.player.status().state == PlaybackState::Stopped);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(Counters::get(&h.counters.stopped), 1);
        assert_eq!(Counters::get(&h.counters.track_change), 1);
        assert!(h.player.current_track().is_none());
        h.player.destroy().unwrap();
    }

    #[test]
    fn seek_raises_flag_then_settles_at_target() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("long-a", meta("a"), Duration::ZERO).unwrap();

        h.player.seek_seconds(30.0).unwrap();
        assert!(h.player.is_seeking());
        assert!(h.player.status().seeking);
        assert!(h.player.status().elapsed_ms >= 30_000);

        wait_until("seek to settle", || !h.player.is_seeking());
        wait_until("decoder seek", || log_has(&h.log, "seek long-a 30000ms"));
        wait_until("buffer discard", || log_has(&h.log, "discard"));
        assert!(h.player.status().elapsed_ms >= 30_000);
        assert_eq!(Counters::get(&h.counters.seek), 1);
        h.player.destroy().unwrap();
    }

    #[test]
    fn seeking_flag_clears_on_schedule_while_decoder_is_slow() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("slow-seek", meta("s"), Duration::ZERO).unwrap();

        let requested = Instant::now();
        h.player.seek_seconds(30.0).unwrap();
        wait_until("seeking flag to drop", || !h.player.is_seeking());
        assert!(requested.elapsed() < Duration::from_millis(300));
        assert_eq!(Counters::get(&h.counters.seek), 1);
        // Still repositioning: status reports the target meanwhile.
        assert!(!log_has(&h.log, "seek slow-seek 30000ms"));
        assert!(h.player.status().elapsed_ms >= 30_000);

        wait_until("slow seek to land", || log_has(&h.log, "seek slow-seek 30000ms"));
        assert!(h.player.status().elapsed_ms >= 30_000);
        assert_eq!(h.player.status().state, PlaybackState::Playing);
        h.player.destroy().unwrap();
    }

    #[test]
    fn invalid_seeks_are_rejected() {
        let h = harness();
        h.player.init().unwrap();
        assert!(matches!(h.player.seek_seconds(5.0), Err(PlayerError::Seek(_))));
        h.player.play("long-a", meta("a"), Duration::ZERO).unwrap();
        assert!(matches!(h.player.seek_seconds(-1.0), Err(PlayerError::Seek(_))));
        assert!(matches!(h.player.seek_seconds(f64::NAN), Err(PlayerError::Seek(_))));
        assert!(!h.player.is_seeking());
        h.player.destroy().unwrap();
    }

    #[test]
    fn seek_after_stop_is_rejected_without_recording_a_target() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("long-a", meta("a"), Duration::ZERO).unwrap();
        h.player.stop().unwrap();
        match h.player.seek_seconds(5.0) {
            Err(PlayerError::Seek(msg)) => assert_eq!(msg, "nothing is playing"),
            other => panic!("unexpected seek result: {other:?}"),
        }
        assert!(!h.player.is_seeking());
        let status = h.player.status();
        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!(status.elapsed_ms, 0);
        h.player.destroy().unwrap();
    }

    #[test]
    fn failed_deferred_seek_keeps_playing() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("long-a", meta("a"), Duration::ZERO).unwrap();
        h.player.seek(Duration::from_secs(500)).unwrap();
        wait_until("seek to settle", || !h.player.is_seeking());
        wait_until("rejected target to clear", || h.player.status().elapsed_ms < 10_000);
        let status = h.player.status();
        assert_eq!(status.state, PlaybackState::Playing);
        assert!(status.elapsed_ms < 10_000);
        assert!(!log_has(&h.log, "discard"));
        h.player.destroy().unwrap();
    }

    #[test]
    fn pause_and_resume_are_idempotent() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("long-a", meta("a"), Duration::ZERO).unwrap();

        h.player.resume().unwrap();
        assert_eq!(Counters::get(&h.counters.playing), 1);

        h.player.pause().unwrap();
        h.player.pause().unwrap();
        assert_eq!(Counters::get(&h.counters.paused), 1);
        assert_eq!(h.player.status().state, PlaybackState::Paused);

        let frozen = h.player.status().elapsed_ms;
        thread::sleep(Duration::from_millis(40));
        assert_eq!(h.player.status().elapsed_ms, frozen);

        h.player.resume().unwrap();
        h.player.resume().unwrap();
        assert_eq!(Counters::get(&h.counters.playing), 2);
        assert_eq!(h.player.status().state, PlaybackState::Playing);
        assert!(h.player.status().elapsed_ms >= frozen);
        h.player.destroy().unwrap();
    }

    #[test]
    fn paused_player_does_not_advance() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("short-a", meta("a"), Duration::ZERO).unwrap();
        h.player.pause().unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(h.player.status().state, PlaybackState::Paused);
        assert_eq!(Counters::get(&h.counters.stopped), 0);
        h.player.destroy().unwrap();
    }

    #[test]
    fn failed_open_keeps_current_track() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("long-a", meta("a"), Duration::ZERO).unwrap();
        let err = h.player.play("missing", meta("x"), Duration::ZERO).unwrap_err();
        assert!(matches!(err, PlayerError::Open(_)));
        let status = h.player.status();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(status.now_playing.as_deref(), Some("long-a"));
        assert!(!log_has(&h.log, "close long-a"));
        h.player.destroy().unwrap();
    }

    #[test]
    fn sink_failure_releases_decoder_and_stops() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("long-a", meta("a"), Duration::ZERO).unwrap();
        h.fail_sinks.store(true, Ordering::Relaxed);
        let err = h.player.play("long-b", meta("b"), Duration::ZERO).unwrap_err();
        assert!(matches!(err, PlayerError::SinkCreation(_)));
        assert!(log_has(&h.log, "close long-a"));
        assert!(log_has(&h.log, "close long-b"));
        assert_eq!(h.player.status().state, PlaybackState::Stopped);
        assert_eq!(Counters::get(&h.counters.stopped), 1);
        h.player.destroy().unwrap();
    }

    #[test]
    fn output_context_is_reused_per_format() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("long-a", meta("a"), Duration::ZERO).unwrap();
        h.player.play("long-b", meta("b"), Duration::ZERO).unwrap();
        h.player.play("long-48k", meta("c"), Duration::ZERO).unwrap();
        let log = h.log.lock().unwrap().clone();
        let contexts: Vec<_> = log.iter().filter(|e| e.starts_with("context")).collect();
        assert_eq!(contexts, vec!["context 44100/2", "context 48000/2"]);
        assert!(log.iter().any(|e| e == "suspend 44100/2"));
        assert_eq!(Counters::get(&h.counters.track_change), 3);
        h.player.destroy().unwrap();
        assert!(log_has(&h.log, "suspend 48000/2"));
    }

    #[test]
    fn start_offset_seeks_before_playing() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("long-a", meta("a"), Duration::from_secs(10)).unwrap();
        assert!(log_has(&h.log, "seek long-a 10000ms"));
        assert!(h.player.status().elapsed_ms >= 10_000);
        h.player.destroy().unwrap();
    }

    #[test]
    fn set_next_adjusts_playlist_length() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("long-a", meta("a"), Duration::ZERO).unwrap();
        h.player.set_next("long-b", meta("b")).unwrap();
        assert_eq!(h.player.status().playlist_len, 2);
        h.player.set_next("short-b", meta("c")).unwrap();
        assert_eq!(h.player.status().playlist_len, 2);
        assert_eq!(h.player.next_track().unwrap().locator, "short-b");
        h.player.set_next("", TrackMetadata::default()).unwrap();
        assert_eq!(h.player.status().playlist_len, 1);
        assert!(h.player.next_track().is_none());
        h.player.destroy().unwrap();
    }

    #[test]
    fn volume_is_clamped() {
        let h = harness();
        h.player.set_volume(150);
        assert_eq!(h.player.volume(), 100);
        h.player.set_volume(-5);
        assert_eq!(h.player.volume(), 0);
        h.player.set_volume(42);
        assert_eq!(h.player.status().volume, 42);
    }

    #[test]
    fn stop_resets_and_destroy_uninitializes() {
        let h = harness();
        h.player.init().unwrap();
        h.player.play("long-a", meta("a"), Duration::ZERO).unwrap();
        h.player.set_next("long-b", meta("b")).unwrap();
        h.player.stop().unwrap();
        let status = h.player.status();
        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!((status.playlist_pos, status.playlist_len), (0, 0));
        assert!(h.player.next_track().is_none());
        assert_eq!(Counters::get(&h.counters.stopped), 1);

        h.player.destroy().unwrap();
        h.player.destroy().unwrap();
        assert!(matches!(
            h.player.play("long-a", meta("a"), Duration::ZERO),
            Err(PlayerError::Uninitialized)
        ));
        h.player.init().unwrap();
        h.player.play("long-a", meta("a"), Duration::ZERO).unwrap();
        assert_eq!(h.player.status().state, PlaybackState::Playing);
        h.player.destroy().unwrap();
    }
}
