//! Device hotplug notifications
//!
//! A session subscribes to one hotplug source at creation. Events are
//! device node paths plus an action; the session uses removals to
//! invalidate open devices and republishes everything to the compositor.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use log::trace;

#[cfg(all(target_os = "linux", feature = "udev"))]
mod udev_monitor;
#[cfg(all(target_os = "linux", feature = "udev"))]
pub use udev_monitor::UdevMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    Add,
    Remove,
    /// Device still present but its state changed (e.g. DRM connector plug)
    Change,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub action: HotplugAction,
    /// Device node, e.g. /dev/input/event3
    pub path: PathBuf,
}

impl HotplugEvent {
    pub fn added(path: impl Into<PathBuf>) -> Self {
        Self {
            action: HotplugAction::Add,
            path: path.into(),
        }
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self {
            action: HotplugAction::Remove,
            path: path.into(),
        }
    }

    pub fn changed(path: impl Into<PathBuf>) -> Self {
        Self {
            action: HotplugAction::Change,
            path: path.into(),
        }
    }
}

/// Something that reports device add/remove events
pub trait HotplugSource {
    /// Descriptor to poll alongside the seat, if the source has one
    ///
    /// A source without one is only drained when the seat wakes the loop.
    fn as_raw_fd(&self) -> Option<RawFd>;

    /// Collect pending events (non-blocking)
    fn poll(&mut self, out: &mut Vec<HotplugEvent>);
}

/// Hotplug source fed by hand
///
/// Used for headless sessions and tests; events pushed through a
/// [`HotplugSender`] are delivered on the next session dispatch. Every
/// send also writes a wake-up byte so a blocking dispatch returns.
pub struct ChannelHotplug {
    rx: mpsc::Receiver<HotplugEvent>,
    /// Polled end of the wake-up channel
    wake_rx: UnixStream,
}

#[derive(Debug, Clone)]
pub struct HotplugSender {
    tx: mpsc::Sender<HotplugEvent>,
    wake_tx: Arc<UnixStream>,
}

impl HotplugSender {
    /// Queue an event; false if the source was dropped
    pub fn send(&self, event: HotplugEvent) -> bool {
        if self.tx.send(event).is_err() {
            return false;
        }
        // A full socket buffer is already readable, so WouldBlock is fine
        if let Err(e) = (&*self.wake_tx).write(&[1]) {
            if e.kind() != ErrorKind::WouldBlock {
                trace!("hotplug: wake-up write failed: {}", e);
            }
        }
        true
    }
}

impl ChannelHotplug {
    pub fn new() -> std::io::Result<(Self, HotplugSender)> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;

        let (tx, rx) = mpsc::channel();
        Ok((
            Self { rx, wake_rx },
            HotplugSender {
                tx,
                wake_tx: Arc::new(wake_tx),
            },
        ))
    }

    fn drain_wakeups(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake_rx).read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }
}

impl HotplugSource for ChannelHotplug {
    fn as_raw_fd(&self) -> Option<RawFd> {
        Some(self.wake_rx.as_raw_fd())
    }

    fn poll(&mut self, out: &mut Vec<HotplugEvent>) {
        // Wake-ups first: an event sent after this still leaves its byte
        self.drain_wakeups();
        while let Ok(event) = self.rx.try_recv() {
            trace!("hotplug: {:?} {}", event.action, event.path.display());
            out.push(event);
        }
    }
}
