//! libseat seat backend
//!
//! Provides rootless DRM/input access via seatd or logind.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, Result};
use libseat::{Seat, SeatEvent, SeatRef};
use log::{debug, info, trace};

use super::{BackendDevice, BackendKind, DeviceClass, SeatBackend, SeatNotification};
use crate::constants::DEFAULT_SEAT;
use crate::session::error::SessionError;
use crate::session::vt;

/// libseat seat backend
pub struct SeatdBackend {
    /// libseat handle
    seat: Seat,
    /// Notifications recorded by the libseat callback, drained by dispatch
    pending: Rc<RefCell<Vec<SeatNotification>>>,
    seat_name: String,
    vt: Option<u16>,
    /// Opened devices (backend id -> libseat device)
    devices: HashMap<i32, libseat::Device>,
    next_device_id: i32,
}

impl SeatdBackend {
    /// Open a new libseat seat
    pub fn open() -> Result<Self> {
        let pending = Rc::new(RefCell::new(Vec::new()));
        let callback_pending = pending.clone();

        let mut seat = Seat::open(move |_seat: &mut SeatRef, event: SeatEvent| {
            let notification = match event {
                SeatEvent::Enable => {
                    info!("libseat: session enabled");
                    SeatNotification::Enable
                }
                SeatEvent::Disable => {
                    info!("libseat: session disabled");
                    SeatNotification::Disable
                }
            };
            callback_pending.borrow_mut().push(notification);
        })
        .context("Failed to open libseat session")?;

        let seat_name = seat.name().to_string();
        info!("libseat: opened seat '{}'", seat_name);

        // Only seat0 owns VTs
        let vt = if seat_name == DEFAULT_SEAT {
            vt::target_vt()
        } else {
            None
        };

        Ok(Self {
            seat,
            pending,
            seat_name,
            vt,
            devices: HashMap::new(),
            next_device_id: 1,
        })
    }
}

/// Wrap the errno libseat returned
fn seat_error(op: &'static str, err: impl Into<std::io::Error>) -> SessionError {
    SessionError::backend(op, err.into())
}

impl SeatBackend for SeatdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Seatd
    }

    fn seat_name(&self) -> &str {
        &self.seat_name
    }

    fn vt(&self) -> Option<u16> {
        self.vt
    }

    fn supports_vt(&self) -> bool {
        self.seat_name == DEFAULT_SEAT
    }

    fn open_device(&mut self, path: &Path) -> Result<BackendDevice, SessionError> {
        DeviceClass::require(path)?;

        let device = self.seat.open_device(&path).map_err(|e| {
            let err = seat_error("open_device", e);
            match err.os_code() {
                Some(libc::EACCES) | Some(libc::EPERM) => SessionError::PermissionDenied {
                    path: path.to_path_buf(),
                },
                _ => err,
            }
        })?;

        let raw_fd = device.as_fd().as_raw_fd();
        let dev = std::fs::metadata(path)
            .map(|meta| meta.rdev() as libc::dev_t)
            .unwrap_or(0);

        let id = self.next_device_id;
        self.next_device_id += 1;
        self.devices.insert(id, device);

        debug!(
            "libseat: opened device {} (id={}, fd={})",
            path.display(),
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
        let device = self.devices.remove(&id).ok_or_else(|| {
            SessionError::backend(
                "close_device",
                std::io::Error::from_raw_os_error(libc::EBADF),
            )
        })?;

        self.seat
            .close_device(device)
            .map_err(|e| seat_error("close_device", e))?;

        trace!("libseat: closed device id={}", id);
        Ok(())
    }

    fn switch_session(&mut self, vt: u16) -> Result<(), SessionError> {
        if !self.supports_vt() {
            return Err(SessionError::Unsupported("VT switching outside seat0"));
        }
        self.seat
            .switch_session(vt as i32)
            .map_err(|e| seat_error("switch_session", e))?;
        Ok(())
    }

    fn get_fd(&mut self) -> Result<RawFd, SessionError> {
        let fd = self.seat.get_fd().map_err(|e| seat_error("get_fd", e))?;
        Ok(fd.as_raw_fd())
    }

    fn dispatch(&mut self, out: &mut Vec<SeatNotification>) -> Result<(), SessionError> {
        self.seat.dispatch(0).map_err(|e| seat_error("dispatch", e))?;
        out.extend(self.pending.borrow_mut().drain(..));
        Ok(())
    }

    fn disable_seat(&mut self) -> Result<(), SessionError> {
        self.seat.disable().map_err(|e| seat_error("disable_seat", e))?;
        Ok(())
    }

    fn close_seat(self: Box<Self>) {
        info!("libseat: closing seat '{}'", self.seat_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require seatd or logind to be running
    // and the user to have appropriate permissions.
    // Skip in CI environment.

    #[test]
    fn test_seat_error_keeps_returned_errno() {
        let err = seat_error("dispatch", std::io::Error::from_raw_os_error(libc::ECONNRESET));
        assert_eq!(err.os_code(), Some(libc::ECONNRESET));
        assert!(!err.is_transient());
    }

    #[test]
    #[ignore]
    fn test_open_session() {
        let session = SeatdBackend::open();
        assert!(session.is_ok(), "Failed to open seat session");
    }
}
