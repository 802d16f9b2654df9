//! Decoding adapter.
//!
//! [`EngineDecoder`] wraps any [`DecodeEngine`] behind the [`Decoder`] contract: a `Read`
//! that yields interleaved signed 16-bit little-endian PCM plus stream parameters and
//! timestamp seeking. It holds at most one normalized native frame at a time.

use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use symphonia::core::io::MediaSource;
use symphonia::core::probe::Hint;

use crate::config::HttpConfig;
use crate::engine::{DecodeEngine, DecodeOutcome, StreamInfo, SymphoniaEngine};
use crate::error::{PlayerError, Result};
use crate::pcm;
use crate::source;

/// Container extensions the bundled decode engine is expected to handle.
pub const SUPPORTED_FORMATS: &[&str] = &["mp3", "flac", "ogg", "vorbis", "wav", "wave"];

/// Whether `ext` (with or without a leading dot, any case) is a supported container.
pub fn is_format_supported(ext: &str) -> bool {
    let ext = ext.trim_start_matches('.');
    SUPPORTED_FORMATS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(ext))
}

/// PCM source consumed by an audio sink.
///
/// `read` yields interleaved signed 16-bit little-endian samples and returns `Ok(0)` once the
/// stream and the codec flush are both exhausted. Mid-stream decode failures surface as
/// `io::Error`s carrying a [`PlayerError`].
pub trait Decoder: Read + Send {
    fn sample_rate(&self) -> u32;
    fn channel_count(&self) -> u16;
    /// Reposition to `position`; see [`EngineDecoder::seek`].
    fn seek(&mut self, position: Duration) -> Result<()>;
    /// Container-level duration, [`Duration::ZERO`] when unknown.
    fn length(&self) -> Duration;
    /// Release the engine and its byte source. Further reads report end of data.
    fn close(&mut self);
}

/// Opens a ready-to-read [`Decoder`] for a locator.
pub trait MediaOpener: Send + Sync {
    fn open(&self, locator: &str) -> Result<Box<dyn Decoder>>;
}

/// Default opener: picks a byte source for the locator and decodes it with Symphonia.
#[derive(Clone, Debug, Default)]
pub struct SymphoniaOpener {
    pub http: HttpConfig,
}

impl SymphoniaOpener {
    pub fn new(http: HttpConfig) -> Self {
        Self { http }
    }
}

impl MediaOpener for SymphoniaOpener {
    fn open(&self, locator: &str) -> Result<Box<dyn Decoder>> {
        let opened = source::open_source(locator, &self.http)?;
        let hint = hint_for(locator, opened.content_type.as_deref());
        // On failure the byte source is dropped here, releasing its connection.
        open_decoder(opened.source, &hint)
    }
}

/// Probe `source` and wrap the resulting engine in an [`EngineDecoder`].
///
/// The byte source moves into the engine; the caller keeps no handle to it.
pub fn open_decoder(source: Box<dyn MediaSource>, hint: &Hint) -> Result<Box<dyn Decoder>> {
    let engine = SymphoniaEngine::open(source, hint)?;
    Ok(Box::new(EngineDecoder::new(engine)))
}

/// Build a probe hint from the locator's extension and a reported content type.
pub fn hint_for(locator: &str, content_type: Option<&str>) -> Hint {
    let mut hint = Hint::new();
    if let Some(ext) = hint_extension(locator) {
        hint.with_extension(&ext);
    }
    if let Some(mime) = content_type.and_then(mime_essence) {
        hint.mime_type(mime);
    }
    hint
}

fn hint_extension(locator: &str) -> Option<String> {
    if source::is_remote(locator) {
        infer_ext_from_url(locator)
    } else {
        Path::new(locator)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
    }
}

/// Infer a file extension from the URL path if present.
fn infer_ext_from_url(url: &str) -> Option<String> {
    let tail = url.split(['?', '#']).next().unwrap_or(url);
    let file = tail.rsplit('/').next().unwrap_or(tail);
    let mut parts = file.rsplit('.');
    let ext = parts.next()?;
    if parts.next().is_some() && !ext.is_empty() {
        Some(ext.to_ascii_lowercase())
    } else {
        None
    }
}

/// `audio/flac; charset=x` -> `audio/flac`
fn mime_essence(content_type: &str) -> Option<&str> {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    (!essence.is_empty()).then_some(essence)
}

/// [`Decoder`] over a [`DecodeEngine`].
pub struct EngineDecoder<E: DecodeEngine> {
    engine: Option<E>,
    info: StreamInfo,
    /// Normalized PCM of the current native frame.
    pcm: Vec<u8>,
    cursor: usize,
    /// No more units to read; the codec is being flushed.
    draining: bool,
    /// Source exhausted and flush fully drained.
    eof: bool,
    /// Error hit after some bytes were already returned; reported on the next read.
    pending_error: Option<PlayerError>,
}

impl<E: DecodeEngine> EngineDecoder<E> {
    pub fn new(engine: E) -> Self {
        let info = engine.info().clone();
        Self {
            engine: Some(engine),
            info,
            pcm: Vec::new(),
            cursor: 0,
            draining: false,
            eof: false,
            pending_error: None,
        }
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Decode until one non-empty native frame is normalized into `pcm`.
    ///
    /// Returns `false` at end of data.
    fn refill(&mut self) -> Result<bool> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(false);
        };
        while !self.eof {
            let outcome = if self.draining {
                engine.decode(None)?
            } else {
                match engine.read_unit()? {
                    Some(unit) => engine.decode(Some(&unit))?,
                    None => {
                        self.draining = true;
                        continue;
                    }
                }
            };
            match outcome {
                DecodeOutcome::Frame(frame) => {
                    if frame.samples == 0 || frame.channels == 0 {
                        continue;
                    }
                    pcm::normalize(&frame, &mut self.pcm)?;
                    self.cursor = 0;
                    return Ok(true);
                }
                DecodeOutcome::NeedMoreInput if !self.draining => {}
                DecodeOutcome::NeedMoreInput | DecodeOutcome::EndOfStream => self.eof = true,
            }
        }
        Ok(false)
    }

    /// Seek the engine, then drop every bit of pre-seek state.
    ///
    /// The engine seek is backward biased. After it succeeds the codec is flushed (frames it
    /// still yields are discarded), the PCM buffer is cleared and end-of-stream is reset. When
    /// the engine rejects the seek, the adapter state is left untouched and the engine's read
    /// position is unspecified.
    pub fn seek_to(&mut self, position: Duration) -> Result<()> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(PlayerError::Seek("decoder closed".to_string()));
        };
        let ts = self.info.time_base.ts_for(position);
        engine.seek(ts)?;

        let mut stale = 0usize;
        loop {
            match engine.decode(None) {
                Ok(DecodeOutcome::Frame(_)) => stale += 1,
                Ok(_) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "flush after seek failed");
                    break;
                }
            }
        }
        engine.flush();
        if stale > 0 {
            tracing::trace!(frames = stale, "discarded stale frames after seek");
        }

        self.pcm.clear();
        self.cursor = 0;
        self.draining = false;
        self.eof = false;
        self.pending_error = None;
        Ok(())
    }
}

impl<E: DecodeEngine> Read for EngineDecoder<E> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.cursor == self.pcm.len() {
                if let Some(err) = self.pending_error.take() {
                    if written > 0 {
                        self.pending_error = Some(err);
                        break;
                    }
                    return Err(err.into_io());
                }
                match self.refill() {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) if written > 0 => {
                        self.pending_error = Some(err);
                        break;
                    }
                    Err(err) => return Err(err.into_io()),
                }
            }
            let n = (self.pcm.len() - self.cursor).min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&self.pcm[self.cursor..self.cursor + n]);
            self.cursor += n;
            written += n;
        }
        Ok(written)
    }
}

impl<E: DecodeEngine> Decoder for EngineDecoder<E> {
    fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    fn channel_count(&self) -> u16 {
        self.info.channels
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        self.seek_to(position)
    }

    fn length(&self) -> Duration {
        self.info.duration()
    }

    fn close(&mut self) {
        if self.engine.take().is_some() {
            tracing::debug!("decoder closed");
        }
        self.pcm.clear();
        self.cursor = 0;
        self.eof = true;
    }
}
