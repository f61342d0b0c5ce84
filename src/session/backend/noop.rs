//! No-op seat backend
//!
//! There is no daemon and no VT: devices are opened directly and seat
//! state changes travel over a local socketpair so that the event loop
//! still has a descriptor to poll. The seat is usable from the start; an
//! Enable queued at open time announces it on the first dispatch.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, trace};

use super::{BackendDevice, BackendKind, DeviceClass, SeatBackend, SeatNotification};
use crate::config::SessionConfig;
use crate::session::error::SessionError;

const MSG_ENABLE: u8 = b'+';
const MSG_DISABLE: u8 = b'-';

/// Injects seat state changes into a [`NoopBackend`]
///
/// Stands in for the VT switches a real seat daemon would report.
#[derive(Debug)]
pub struct NoopController {
    tx: UnixStream,
}

impl NoopController {
    pub fn enable(&self) -> std::io::Result<()> {
        (&self.tx).write_all(&[MSG_ENABLE])
    }

    pub fn disable(&self) -> std::io::Result<()> {
        (&self.tx).write_all(&[MSG_DISABLE])
    }
}

pub struct NoopBackend {
    seat: String,
    /// Directory absolute device paths are resolved against
    device_root: Option<PathBuf>,
    /// Polled end of the notification channel
    rx: UnixStream,
    tx: UnixStream,
    devices: HashMap<i32, OwnedFd>,
    next_device_id: i32,
}

impl NoopBackend {
    pub fn open(config: &SessionConfig) -> Result<Self> {
        let (rx, tx) = UnixStream::pair().context("Failed to create noop seat channel")?;
        rx.set_nonblocking(true)
            .context("Failed to make noop seat channel non-blocking")?;
        tx.set_nonblocking(true)
            .context("Failed to make noop seat channel non-blocking")?;

        // Nobody else will ever enable this seat
        (&tx)
            .write_all(&[MSG_ENABLE])
            .context("Failed to queue initial enable")?;

        info!("noop: opened seat '{}'", config.seat);

        Ok(Self {
            seat: config.seat.clone(),
            device_root: config.device_root.clone(),
            rx,
            tx,
            devices: HashMap::new(),
            next_device_id: 1,
        })
    }

    /// Handle for simulating VT switches
    pub fn controller(&self) -> Result<NoopController> {
        let tx = self
            .tx
            .try_clone()
            .context("Failed to clone noop seat channel")?;
        Ok(NoopController { tx })
    }

    /// Map a device path into `device_root`, refusing symlinks that lead out
    fn resolve(&self, path: &Path) -> Result<PathBuf, SessionError> {
        let Some(root) = &self.device_root else {
            return Ok(path.to_path_buf());
        };

        let joined = root.join(path.strip_prefix("/").unwrap_or(path));
        let resolved = joined.canonicalize().map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => SessionError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => SessionError::backend("open_device", e),
        })?;
        let root = root
            .canonicalize()
            .map_err(|e| SessionError::backend("open_device", e))?;

        if !resolved.starts_with(&root) {
            return Err(SessionError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        Ok(resolved)
    }
}

impl SeatBackend for NoopBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Noop
    }

    fn seat_name(&self) -> &str {
        &self.seat
    }

    fn vt(&self) -> Option<u16> {
        None
    }

    fn supports_vt(&self) -> bool {
        false
    }

    /// Nothing can take the seat away, so devices open right after create
    fn initially_active(&self) -> bool {
        true
    }

    fn open_device(&mut self, path: &Path) -> Result<BackendDevice, SessionError> {
        DeviceClass::require(path)?;

        let real_path = self.resolve(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&real_path)
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => SessionError::PermissionDenied {
                    path: path.to_path_buf(),
                },
                _ => SessionError::backend("open_device", e),
            })?;

        let dev = file
            .metadata()
            .map_err(|e| SessionError::backend("fstat", e))?
            .rdev() as libc::dev_t;

        let id = self.next_device_id;
        self.next_device_id += 1;

        let fd = OwnedFd::from(file);
        let raw_fd = fd.as_raw_fd();
        self.devices.insert(id, fd);

        debug!(
            "noop: opened device {} (id={}, fd={})",
            real_path.display(),
            id,
            raw_fd
        );

        Ok(BackendDevice {
            id,
            fd: raw_fd,
            dev,
        })
    }

    fn close_device(&mut self, id: i32) -> Result<(), SessionError> {
        match self.devices.remove(&id) {
            Some(fd) => {
                drop(fd);
                trace!("noop: closed device id={}", id);
                Ok(())
            }
            None => Err(SessionError::backend(
                "close_device",
                std::io::Error::from_raw_os_error(libc::EBADF),
            )),
        }
    }

    fn switch_session(&mut self, _vt: u16) -> Result<(), SessionError> {
        Err(SessionError::Unsupported("VT switching"))
    }

    fn get_fd(&mut self) -> Result<RawFd, SessionError> {
        Ok(self.rx.as_raw_fd())
    }

    fn dispatch(&mut self, out: &mut Vec<SeatNotification>) -> Result<(), SessionError> {
        let mut buf = [0u8; 64];
        loop {
            match (&self.rx).read(&mut buf) {
                // The controller side never closes while we hold `tx`
                Ok(0) => return Ok(()),
                Ok(n) => {
                    for &msg in &buf[..n] {
                        match msg {
                            MSG_ENABLE => out.push(SeatNotification::Enable),
                            MSG_DISABLE => out.push(SeatNotification::Disable),
                            other => trace!("noop: ignoring message {:#x}", other),
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(SessionError::backend("dispatch", e)),
            }
        }
    }

    fn disable_seat(&mut self) -> Result<(), SessionError> {
        debug!("noop: seat disabled");
        Ok(())
    }

    fn close_seat(self: Box<Self>) {
        info!("noop: closing seat '{}'", self.seat);
    }
}
