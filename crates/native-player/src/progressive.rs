//! Progressive-buffering byte source.
//!
//! Wraps a forward-only origin: a background thread appends fixed-size chunks to an in-memory
//! buffer while readers consume (and seek within) the prefix that has already arrived. Readers
//! block on a condition variable until the writer appends or reaches a terminal state.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use symphonia::core::io::MediaSource;

use crate::error::PlayerError;

/// Buffer state shared between the background writer and readers.
#[derive(Debug, Default)]
struct BufferState {
    data: Vec<u8>,
    /// Writer finished, cleanly or not.
    done: bool,
    /// Terminal origin error. Sticky once set.
    error: Option<(io::ErrorKind, String)>,
    /// Reader side went away; the writer stops at its next chunk boundary.
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BufferState>,
    cv: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Seekable view over a forward-only origin that is still being read.
pub struct ProgressiveSource {
    shared: Arc<Shared>,
    pos: u64,
}

impl ProgressiveSource {
    /// Start buffering `origin` on a background thread, `chunk_size` bytes at a time.
    pub fn open<R>(origin: R, chunk_size: usize) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let writer = shared.clone();
        let chunk_size = chunk_size.max(1);
        thread::Builder::new()
            .name("progressive-buffer".to_string())
            .spawn(move || buffer_origin(origin, chunk_size, &writer))?;
        Ok(Self { shared, pos: 0 })
    }

    /// Highest buffered offset (bytes received so far).
    pub fn buffered_len(&self) -> u64 {
        self.shared.lock().data.len() as u64
    }

    /// Block until the background writer finishes; returns the total buffered length.
    pub fn wait_until_done(&self) -> u64 {
        let mut g = self.shared.lock();
        while !g.done && !g.closed {
            g = self.shared.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
        g.data.len() as u64
    }

    /// Stop the background writer at its next chunk boundary. Idempotent.
    pub fn close(&mut self) {
        let mut g = self.shared.lock();
        if !g.closed {
            g.closed = true;
            drop(g);
            self.shared.cv.notify_all();
        }
    }
}

impl Drop for ProgressiveSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn buffer_origin<R: Read>(mut origin: R, chunk_size: usize, shared: &Shared) {
    let mut chunk = vec![0u8; chunk_size];
    loop {
        if shared.lock().closed {
            break;
        }
        match origin.read(&mut chunk) {
            Ok(0) => {
                let mut g = shared.lock();
                g.done = true;
                tracing::debug!(bytes = g.data.len(), "progressive buffer complete");
                break;
            }
            Ok(n) => {
                shared.lock().data.extend_from_slice(&chunk[..n]);
                shared.cv.notify_all();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let mut g = shared.lock();
                tracing::warn!(bytes = g.data.len(), error = %e, "progressive origin read failed");
                g.error = Some((e.kind(), e.to_string()));
                g.done = true;
                break;
            }
        }
    }
    shared.cv.notify_all();
}

impl Read for ProgressiveSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut g = self.shared.lock();
        loop {
            let available = (g.data.len() as u64).saturating_sub(self.pos) as usize;
            if available > 0 {
                let start = self.pos as usize;
                let n = available.min(buf.len());
                buf[..n].copy_from_slice(&g.data[start..start + n]);
                self.pos += n as u64;
                return Ok(n);
            }
            if g.done {
                return match &g.error {
                    Some((kind, msg)) => Err(io::Error::new(*kind, msg.clone())),
                    None => Ok(0),
                };
            }
            if g.closed {
                return Ok(0);
            }
            g = self.shared.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Seek for ProgressiveSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let g = self.shared.lock();
        let frontier = g.data.len() as u64;
        let target: i128 = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => {
                if !g.done {
                    return Err(PlayerError::Seek(
                        "end of stream unknown while buffering".to_string(),
                    )
                    .into_io());
                }
                i128::from(frontier) + i128::from(delta)
            }
        };
        if target < 0 {
            return Err(PlayerError::Seek(format!("negative position {target}")).into_io());
        }
        let target = u64::try_from(target).unwrap_or(u64::MAX);
        self.pos = if target <= frontier {
            target
        } else if g.done {
            frontier
        } else {
            return Err(PlayerError::Seek(format!(
                "offset {target} beyond buffered data ({frontier} bytes)"
            ))
            .into_io());
        };
        Ok(self.pos)
    }
}

impl MediaSource for ProgressiveSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        let g = self.shared.lock();
        g.done.then_some(g.data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, Sender, unbounded};
    use std::time::Duration;

    /// Origin fed chunk by chunk from the test thread.
    struct ChannelOrigin {
        rx: Receiver<io::Result<Vec<u8>>>,
        pending: Vec<u8>,
    }

    impl Read for ChannelOrigin {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(Ok(chunk)) => self.pending = chunk,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Ok(0),
                }
            }
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    fn channel_source() -> (Sender<io::Result<Vec<u8>>>, ProgressiveSource) {
        let (tx, rx) = unbounded();
        let origin = ChannelOrigin {
            rx,
            pending: Vec::new(),
        };
        (tx, ProgressiveSource::open(origin, 4).unwrap())
    }

    fn wait_for_len(source: &ProgressiveSource, len: u64) {
        for _ in 0..500 {
            if source.buffered_len() >= len {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("buffer never reached {len} bytes");
    }

    #[test]
    fn read_blocks_until_writer_appends() {
        let (tx, mut source) = channel_source();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 3];
            let n = source.read(&mut buf).unwrap();
            (n, buf)
        });
        thread::sleep(Duration::from_millis(20));
        tx.send(Ok(vec![7, 8, 9])).unwrap();
        let (n, buf) = reader.join().unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf, [7, 8, 9]);
    }

    #[test]
    fn seek_within_buffered_prefix_succeeds() {
        let (tx, mut source) = channel_source();
        tx.send(Ok((0u8..10).collect())).unwrap();
        wait_for_len(&source, 10);

        assert_eq!(source.seek(SeekFrom::Start(10)).unwrap(), 10);
        assert_eq!(source.seek(SeekFrom::Start(4)).unwrap(), 4);
        let mut buf = [0u8; 2];
        source.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [4, 5]);
        assert_eq!(source.seek(SeekFrom::Current(-6)).unwrap(), 0);
        drop(tx);
    }

    #[test]
    fn seek_beyond_frontier_while_buffering_fails() {
        let (tx, mut source) = channel_source();
        tx.send(Ok(vec![1; 8])).unwrap();
        wait_for_len(&source, 8);

        let err = source.seek(SeekFrom::Start(9)).unwrap_err();
        assert!(matches!(PlayerError::from_io(err), PlayerError::Seek(_)));
        let err = source.seek(SeekFrom::End(0)).unwrap_err();
        assert!(matches!(PlayerError::from_io(err), PlayerError::Seek(_)));
        drop(tx);
    }

    #[test]
    fn seek_from_end_after_completion_yields_total_length() {
        let (tx, mut source) = channel_source();
        tx.send(Ok(vec![1; 6])).unwrap();
        tx.send(Ok(vec![2; 5])).unwrap();
        drop(tx);
        assert_eq!(source.wait_until_done(), 11);

        assert_eq!(source.seek(SeekFrom::End(0)).unwrap(), 11);
        assert_eq!(source.byte_len(), Some(11));
        assert_eq!(source.seek(SeekFrom::Start(100)).unwrap(), 11);
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn negative_seek_fails() {
        let (_tx, mut source) = channel_source();
        let err = source.seek(SeekFrom::Current(-1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn terminal_error_is_sticky_after_buffered_bytes() {
        let (tx, mut source) = channel_source();
        tx.send(Ok(vec![5, 6])).unwrap();
        tx.send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();
        source.wait_until_done();

        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[5, 6]);
        for _ in 0..2 {
            let err = source.read(&mut buf).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        }

        // Already-buffered bytes stay reachable.
        source.seek(SeekFrom::Start(1)).unwrap();
        assert_eq!(source.read(&mut buf).unwrap(), 1);
    }

    #[test]
    fn reads_whole_stream_across_chunks() {
        let (tx, mut source) = channel_source();
        let writer = thread::spawn(move || {
            for i in 0..20u8 {
                tx.send(Ok(vec![i; 3])).unwrap();
                thread::sleep(Duration::from_millis(1));
            }
        });
        let mut out = Vec::new();
        source.read_to_end(&mut out).unwrap();
        writer.join().unwrap();
        assert_eq!(out.len(), 60);
        assert_eq!(&out[57..], &[19, 19, 19]);
    }
}
