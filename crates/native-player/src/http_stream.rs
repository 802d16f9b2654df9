//! HTTP range-request byte source.
//!
//! Presents a remote resource as a random-access stream: a `HEAD` probe learns the total
//! length and content type, a streaming `GET` feeds reads, and every seek that actually moves
//! the position reconnects with `Range: bytes=<offset>-`.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use symphonia::core::io::MediaSource;
use ureq::http::{HeaderMap, StatusCode};

use crate::config::HttpConfig;
use crate::error::{PlayerError, Result};

/// Reads slower than this to produce response headers are logged.
const SLOW_OPEN: Duration = Duration::from_millis(250);

type BodyReader = Box<dyn Read + Send>;

/// Random-access view of a remote resource backed by HTTP range requests.
pub struct HttpRangeSource {
    url: String,
    agent: ureq::Agent,
    pos: u64,
    len: Option<u64>,
    content_type: Option<String>,
    /// `None` once closed or after a failed reopen. The mutex only exists to make the
    /// source `Sync`; access goes through `get_mut`.
    reader: Option<Mutex<BodyReader>>,
    /// Why the last reopen failed. Reads fail with it until a seek reconnects.
    broken: Option<String>,
}

impl HttpRangeSource {
    /// Probe `url` and open a streaming read at offset 0.
    ///
    /// Fails with [`PlayerError::Open`] if the probe fails or returns a non-success status.
    /// A missing or unparsable `Content-Length` leaves the length unknown.
    pub fn open(url: &str, config: &HttpConfig) -> Result<Self> {
        let agent = build_agent(config);
        let head = agent
            .head(url)
            .call()
            .map_err(|e| PlayerError::Open(format!("probe {url}: {e}")))?;
        if !head.status().is_success() {
            return Err(PlayerError::Open(format!(
                "probe {url}: HTTP {}",
                head.status()
            )));
        }
        let len = header_str(head.headers(), "Content-Length").and_then(|v| v.parse::<u64>().ok());
        let content_type = header_str(head.headers(), "Content-Type").map(str::to_string);
        tracing::debug!(url = %url, len = ?len, content_type = ?content_type, "http probe");

        let mut source = Self {
            url: url.to_string(),
            agent,
            pos: 0,
            len,
            content_type,
            reader: None,
            broken: None,
        };
        let reader = source.open_reader(0)?;
        source.reader = Some(Mutex::new(reader));
        Ok(source)
    }

    /// Content type reported by the probe.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Total length when the origin reported one.
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    /// Current absolute read position.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Release the underlying connection. Idempotent.
    pub fn close(&mut self) {
        self.broken = None;
        if self.reader.take().is_some() {
            tracing::debug!(url = %self.url, pos = self.pos, "http source closed");
        }
    }

    /// Issue a streaming `GET` starting at `pos`.
    fn open_reader(&mut self, pos: u64) -> Result<BodyReader> {
        if self.len.is_some_and(|len| pos >= len) {
            return Ok(Box::new(io::empty()));
        }

        let mut request = self.agent.get(&self.url);
        if pos > 0 {
            request = request.header("Range", format!("bytes={pos}-"));
        }
        let started = Instant::now();
        let resp = request
            .call()
            .map_err(|e| PlayerError::Open(format!("GET {} @{pos}: {e}", self.url)))?;
        let took = started.elapsed();
        if took > SLOW_OPEN {
            tracing::warn!(
                took_ms = took.as_millis() as u64,
                offset = pos,
                url = %self.url,
                "http range open slow"
            );
        }

        let status = resp.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(PlayerError::Open(format!(
                "GET {} @{pos}: HTTP {status}",
                self.url
            )));
        }
        if self.len.is_none() && status == StatusCode::PARTIAL_CONTENT {
            self.len = header_str(resp.headers(), "Content-Range").and_then(parse_content_range_total);
        }

        let (_, body) = resp.into_parts();
        let mut reader: BodyReader = Box::new(body.into_reader());
        if status == StatusCode::OK && pos > 0 {
            // Origin ignored the range; skip forward on the full body.
            let skipped = io::copy(&mut reader.by_ref().take(pos), &mut io::sink())
                .map_err(|e| PlayerError::Open(format!("skip to {pos}: {e}")))?;
            tracing::debug!(url = %self.url, skipped, "range ignored by origin");
        }
        Ok(reader)
    }
}

impl Read for HttpRangeSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(reader) = self.reader.as_mut() else {
            return match &self.broken {
                Some(reason) => Err(PlayerError::Open(format!(
                    "no active reader at {}: {reason}",
                    self.pos
                ))
                .into_io()),
                None => Ok(0),
            };
        };
        let reader = reader.get_mut().unwrap_or_else(PoisonError::into_inner);
        let n = reader.read(buf)?;
        self.pos = self.pos.saturating_add(n as u64);
        Ok(n)
    }
}

impl Seek for HttpRangeSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target: i128 = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => match self.len {
                Some(len) => i128::from(len) + i128::from(delta),
                None => {
                    return Err(
                        PlayerError::Seek("length unknown; cannot seek from end".into()).into_io(),
                    );
                }
            },
        };
        if target < 0 {
            return Err(PlayerError::Seek(format!("negative position {target}")).into_io());
        }
        let mut target = u64::try_from(target).unwrap_or(u64::MAX);
        if let Some(len) = self.len {
            target = target.min(len);
        }

        if target != self.pos || self.broken.is_some() {
            // Drop the old connection before dialing the new one.
            self.reader = None;
            match self.open_reader(target) {
                Ok(reader) => {
                    self.reader = Some(Mutex::new(reader));
                    self.broken = None;
                    self.pos = target;
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, offset = target, error = %e, "range reopen failed");
                    self.broken = Some(e.to_string());
                    return Err(PlayerError::Seek(e.to_string()).into_io());
                }
            }
        }
        Ok(self.pos)
    }
}

impl MediaSource for HttpRangeSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        self.len
    }
}

/// Build an agent that returns non-2xx responses instead of erroring, so status handling
/// stays in one place.
pub(crate) fn build_agent(config: &HttpConfig) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_connect(Some(config.connect_timeout))
        .timeout_recv_response(Some(config.response_timeout))
        .http_status_as_error(false)
        .build()
        .into()
}

/// Open a single forward-only `GET` body (used by the progressive strategy).
///
/// Returns the body reader and the reported content type.
pub(crate) fn open_body(url: &str, config: &HttpConfig) -> Result<(BodyReader, Option<String>)> {
    let resp = build_agent(config)
        .get(url)
        .call()
        .map_err(|e| PlayerError::Open(format!("GET {url}: {e}")))?;
    if !resp.status().is_success() {
        return Err(PlayerError::Open(format!("GET {url}: HTTP {}", resp.status())));
    }
    let content_type = header_str(resp.headers(), "Content-Type").map(str::to_string);
    let (_, body) = resp.into_parts();
    Ok((Box::new(body.into_reader()), content_type))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extract the total length from a Content-Range header (`bytes start-end/total`).
fn parse_content_range_total(header: &str) -> Option<u64> {
    let (_, total) = header.split_once('/')?;
    total.trim().parse::<u64>().ok()
}
