//! Background monitor: drives natural track completion, deferred seeks and the seek
//! debounce timer for one initialized player.
//!
//! Decoder seeks run on a companion `player-seek` thread so a slow reopen never holds up
//! the debounce deadline or the completion poll.

use std::io;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};

use crate::player::Inner;

/// Work handed to the monitor by transport calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonitorMsg {
    /// A seek was requested; `generation` identifies it for the debounce timer.
    Seek { generation: u64 },
}

pub(crate) struct MonitorHandle {
    cancel: Option<Sender<()>>,
    messages: Sender<MonitorMsg>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub(crate) fn send(&self, msg: MonitorMsg) {
        if self.messages.send(msg).is_err() {
            tracing::debug!(?msg, "monitor already gone");
        }
    }

    /// Cancel the loop and wait for it, unless called from the monitor thread itself.
    pub(crate) fn shutdown(mut self) {
        self.cancel.take();
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

pub(crate) fn spawn(
    inner: Weak<Inner>,
    poll_interval: Duration,
    seek_debounce: Duration,
) -> io::Result<MonitorHandle> {
    let (cancel_tx, cancel_rx) = bounded::<()>(0);
    let (msg_tx, msg_rx) = unbounded();
    let (seek_tx, seek_rx) = unbounded::<()>();
    let seeker = {
        let inner = inner.clone();
        thread::Builder::new()
            .name("player-seek".to_string())
            .spawn(move || run_seeks(inner, seek_rx))?
    };
    let monitor = Monitor {
        inner,
        cancel: cancel_rx,
        messages: msg_rx,
        seeks: seek_tx,
        poll_interval,
        seek_debounce,
    };
    let thread = thread::Builder::new()
        .name("player-monitor".to_string())
        .spawn(move || {
            monitor.run();
            // The seek channel closed with `monitor`; wait out any seek in flight.
            let _ = seeker.join();
        })?;
    Ok(MonitorHandle {
        cancel: Some(cancel_tx),
        messages: msg_tx,
        thread: Some(thread),
    })
}

struct Monitor {
    inner: Weak<Inner>,
    cancel: Receiver<()>,
    messages: Receiver<MonitorMsg>,
    seeks: Sender<()>,
    poll_interval: Duration,
    seek_debounce: Duration,
}

impl Monitor {
    fn run(self) {
        let ticker = crossbeam_channel::tick(self.poll_interval);
        let mut debounce: Option<(Instant, u64)> = None;
        tracing::debug!(poll_ms = self.poll_interval.as_millis() as u64, "monitor started");

        loop {
            let deadline = match debounce {
                Some((at, _)) => crossbeam_channel::at(at),
                None => crossbeam_channel::never(),
            };
            select! {
                recv(self.cancel) -> _ => break,
                recv(ticker) -> _ => {
                    let Some(inner) = self.inner.upgrade() else { break };
                    inner.tick();
                }
                recv(self.messages) -> msg => {
                    let Ok(MonitorMsg::Seek { generation }) = msg else { break };
                    // The window starts at the request, not when the decoder is done.
                    debounce = Some((Instant::now() + self.seek_debounce, generation));
                    if self.seeks.send(()).is_err() {
                        break;
                    }
                }
                recv(deadline) -> _ => {
                    if let Some((_, generation)) = debounce.take() {
                        let Some(inner) = self.inner.upgrade() else { break };
                        inner.finish_seek(generation);
                    }
                }
            }
        }
        tracing::debug!("monitor stopped");
    }
}

/// Apply pending seeks one at a time; bursts collapse into the latest target.
fn run_seeks(inner: Weak<Inner>, requests: Receiver<()>) {
    while requests.recv().is_ok() {
        while requests.try_recv().is_ok() {}
        let Some(inner) = inner.upgrade() else { break };
        inner.apply_pending_seek();
    }
}
