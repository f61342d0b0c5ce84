//! Seat backends
//!
//! A seat backend is the privileged operation provider behind a
//! [`Session`](super::Session). Three backends are provided:
//! - seatd: libseat (seatd/logind), no root needed (feature `seatd`)
//! - direct: VT_PROCESS control of the VT the process runs on (root)
//! - noop: opens device files directly, no VT concept (headless/tests)
//!
//! Backends are probed in a configurable order and the first that opens
//! a seat wins.

use std::fmt;
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::io::RawFd;
use std::path::{Component, Path};
use std::str::FromStr;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::error::SessionError;
use crate::config::SessionConfig;
use crate::constants::{DRM_MAJOR, INPUT_MAJOR};

pub mod direct;
pub mod noop;
#[cfg(all(target_os = "linux", feature = "seatd"))]
pub mod seatd;

pub use direct::DirectBackend;
pub use noop::{NoopBackend, NoopController};
#[cfg(all(target_os = "linux", feature = "seatd"))]
pub use seatd::SeatdBackend;

/// Identifies a backend variant in the probe order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// libseat: seatd or logind
    Seatd,
    /// Direct VT control
    Direct,
    /// No privilege channel at all
    Noop,
}

impl BackendKind {
    /// Default probe order: privileged daemon, direct, no-op
    pub const DEFAULT_ORDER: [BackendKind; 3] =
        [BackendKind::Seatd, BackendKind::Direct, BackendKind::Noop];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Seatd => "seatd",
            BackendKind::Direct => "direct",
            BackendKind::Noop => "noop",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "seatd" | "libseat" | "logind" => Ok(BackendKind::Seatd),
            "direct" | "vt" => Ok(BackendKind::Direct),
            "noop" | "none" | "headless" => Ok(BackendKind::Noop),
            other => Err(format!("unknown seat backend '{}'", other)),
        }
    }
}

/// Device classes a seat hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// DRM node (/dev/dri/*); revoked while the session is inactive
    Gpu,
    /// evdev node (/dev/input/*); stays open across VT switches
    Input,
}

impl DeviceClass {
    /// Classify a device path, None if no seat would hand it out
    ///
    /// Only absolute paths made of plain components qualify; `..` and `.`
    /// would let a prefix match escape /dev.
    pub fn from_path(path: &Path) -> Option<Self> {
        let mut components = path.components();
        if components.next() != Some(Component::RootDir) {
            return None;
        }
        if !components.all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }

        if path.starts_with("/dev/dri") {
            Some(DeviceClass::Gpu)
        } else if path.starts_with("/dev/input") {
            Some(DeviceClass::Input)
        } else {
            None
        }
    }

    /// Classify an opened node by its device number
    pub fn from_rdev(rdev: libc::dev_t) -> Option<Self> {
        match libc::major(rdev) {
            DRM_MAJOR => Some(DeviceClass::Gpu),
            INPUT_MAJOR => Some(DeviceClass::Input),
            _ => None,
        }
    }

    /// Same as [`DeviceClass::from_path`] but fails with `PermissionDenied`
    pub fn require(path: &Path) -> Result<Self, SessionError> {
        Self::from_path(path).ok_or_else(|| SessionError::PermissionDenied {
            path: path.to_path_buf(),
        })
    }

    /// Check that an opened node really is a character device of this class
    pub fn verify_node(self, path: &Path, meta: &Metadata) -> Result<(), SessionError> {
        let class = Self::from_rdev(meta.rdev() as libc::dev_t);
        if meta.file_type().is_char_device() && class == Some(self) {
            Ok(())
        } else {
            Err(SessionError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }
    }
}

/// A device as returned by a backend
///
/// The backend keeps owning the descriptor until `close_device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendDevice {
    /// Backend-assigned id, passed back to `close_device`
    pub id: i32,
    pub fd: RawFd,
    /// Device number (st_rdev)
    pub dev: libc::dev_t,
}

/// Seat state change reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatNotification {
    /// Seat acquired (VT switched to us)
    Enable,
    /// Seat released (VT switched away); the backend waits for `disable_seat`
    Disable,
}

/// The privileged operation set of a seat
///
/// Only [`Session`](super::Session) calls into a backend.
pub trait SeatBackend {
    fn kind(&self) -> BackendKind;

    fn seat_name(&self) -> &str;

    /// VT this seat runs on, if known
    fn vt(&self) -> Option<u16>;

    /// Whether `switch_session` can do anything on this seat
    fn supports_vt(&self) -> bool;

    /// Whether the seat is usable before the first Enable arrives
    fn initially_active(&self) -> bool {
        false
    }

    fn open_device(&mut self, path: &Path) -> Result<BackendDevice, SessionError>;

    fn close_device(&mut self, id: i32) -> Result<(), SessionError>;

    /// Request a switch to another VT/session
    fn switch_session(&mut self, vt: u16) -> Result<(), SessionError>;

    /// Descriptor the event loop polls to know when `dispatch` has work
    fn get_fd(&mut self) -> Result<RawFd, SessionError>;

    /// Process pending notifications without blocking
    fn dispatch(&mut self, out: &mut Vec<SeatNotification>) -> Result<(), SessionError>;

    /// Acknowledge an `Enable` once every earlier notification is handled
    fn enable_seat(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    /// Acknowledge a `Disable` after the compositor stopped using the hardware
    fn disable_seat(&mut self) -> Result<(), SessionError>;

    /// Tear down the privilege channel
    fn close_seat(self: Box<Self>);
}

/// Open the first backend in `order` that initialises
pub fn probe(
    order: &[BackendKind],
    config: &SessionConfig,
) -> Result<Box<dyn SeatBackend>, SessionError> {
    let mut failures = Vec::new();

    for &kind in order {
        match open_backend(kind, config) {
            Ok(backend) => {
                info!(
                    "Seat backend '{}' opened seat '{}'",
                    kind,
                    backend.seat_name()
                );
                return Ok(backend);
            }
            Err(e) => {
                warn!("Seat backend '{}' unavailable: {:#}", kind, e);
                failures.push((kind, format!("{:#}", e)));
            }
        }
    }

    Err(SessionError::NoBackendAvailable(failures))
}

fn open_backend(kind: BackendKind, config: &SessionConfig) -> anyhow::Result<Box<dyn SeatBackend>> {
    match kind {
        BackendKind::Seatd => open_seatd(),
        BackendKind::Direct => Ok(Box::new(DirectBackend::open(config)?)),
        BackendKind::Noop => Ok(Box::new(NoopBackend::open(config)?)),
    }
}

#[cfg(all(target_os = "linux", feature = "seatd"))]
fn open_seatd() -> anyhow::Result<Box<dyn SeatBackend>> {
    Ok(Box::new(SeatdBackend::open()?))
}

#[cfg(not(all(target_os = "linux", feature = "seatd")))]
fn open_seatd() -> anyhow::Result<Box<dyn SeatBackend>> {
    Err(anyhow::anyhow!("libseat support not compiled in"))
}
