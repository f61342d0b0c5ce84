//! Direct VT seat backend
//!
//! Takes over the VT the process runs on with VT_SETMODE(VT_PROCESS).
//! The kernel then sends SIGUSR2 when someone wants to switch away and
//! SIGUSR1 when the VT comes back; both arrive through a signalfd that
//! doubles as the backend's poll descriptor.
//!
//! Needs root (or CAP_SYS_TTY_CONFIG plus device permissions). DRM master
//! is dropped on every GPU device before the VT is released and taken
//! again on acquire.
//!
//! Reference: kmscon's src/uterm_vt.c

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, trace, warn};
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use super::{BackendDevice, BackendKind, DeviceClass, SeatBackend, SeatNotification};
use crate::config::SessionConfig;
use crate::constants::{
    DEFAULT_SEAT, KDGETMODE, KDSETMODE, KD_GRAPHICS, KD_TEXT, VT_ACKACQ, VT_ACTIVATE, VT_AUTO,
    VT_PROCESS, VT_RELDISP, VT_SETMODE,
};
use crate::session::error::SessionError;
use crate::session::vt;

// DRM ioctl constants
mod drm_ioctl {
    // Linux: include/uapi/drm/drm.h
    // _IO('d', 0x1e) = SET_MASTER, _IO('d', 0x1f) = DROP_MASTER
    const DRM_IOCTL_BASE: u64 = 0x64;
    pub const DRM_IOCTL_SET_MASTER: libc::c_ulong =
        nix::request_code_none!(DRM_IOCTL_BASE, 0x1e) as libc::c_ulong;
    pub const DRM_IOCTL_DROP_MASTER: libc::c_ulong =
        nix::request_code_none!(DRM_IOCTL_BASE, 0x1f) as libc::c_ulong;
}

/// vt_mode structure for VT_SETMODE ioctl
#[repr(C)]
struct VtMode {
    mode: libc::c_char,    // VT_AUTO or VT_PROCESS
    waitv: libc::c_char,   // unused
    relsig: libc::c_short, // signal to send on release
    acqsig: libc::c_short, // signal to send on acquire
    frsig: libc::c_short,  // unused
}

struct DirectDevice {
    fd: OwnedFd,
    class: DeviceClass,
}

pub struct DirectBackend {
    /// The TTY we're running on
    tty: File,
    vt: u16,
    /// signalfd for receiving SIGUSR1/SIGUSR2
    signal_fd: SignalFd,
    /// Whether we currently hold the VT
    active: bool,
    /// Enable owed to the session because the VT was already shown at open
    initial_enable: bool,
    /// SIGUSR1s seen whose VT_ACKACQ is not sent yet
    pending_acquires: u32,
    /// Original signal mask to restore on close
    old_sigmask: SigSet,
    /// Original keyboard mode (KD_TEXT/KD_GRAPHICS)
    original_kd_mode: libc::c_long,
    devices: HashMap<i32, DirectDevice>,
    next_device_id: i32,
}

impl DirectBackend {
    /// Set up process-controlled VT mode on the target VT
    ///
    /// Blocks SIGUSR1/SIGUSR2 for the calling thread and routes them into a
    /// signalfd. Does not wait for the VT to become active.
    pub fn open(config: &SessionConfig) -> Result<Self> {
        let vt = config
            .vt
            .or_else(vt::target_vt)
            .ok_or_else(|| anyhow!("Cannot determine VT - not running on a VT?"))?;

        info!("direct: target VT {}", vt);

        let tty_path = format!("/dev/tty{}", vt);
        let tty = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY)
            .open(&tty_path)
            .with_context(|| format!("Cannot open {}", tty_path))?;
        let tty_fd = tty.as_raw_fd();

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGUSR1);
        mask.add(Signal::SIGUSR2);

        let old_sigmask = mask
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .context("Failed to block VT signals")?;

        let signal_fd = match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        {
            Ok(fd) => fd,
            Err(e) => {
                let _ = old_sigmask.thread_set_mask();
                return Err(anyhow!("Failed to create signalfd: {}", e));
            }
        };

        let mode = VtMode {
            mode: VT_PROCESS,
            waitv: 0,
            relsig: Signal::SIGUSR2 as libc::c_short,
            acqsig: Signal::SIGUSR1 as libc::c_short,
            frsig: 0,
        };
        let ret = unsafe { libc::ioctl(tty_fd, VT_SETMODE, &mode) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            let _ = old_sigmask.thread_set_mask();
            return Err(anyhow!("VT_SETMODE failed: {}", err));
        }

        let mut original_kd_mode: libc::c_long = KD_TEXT;
        unsafe { libc::ioctl(tty_fd, KDGETMODE, &mut original_kd_mode) };

        let active = vt::query_active(tty_fd) == Some(vt);
        if active {
            // Keep the kernel console from drawing over us
            unsafe { libc::ioctl(tty_fd, KDSETMODE, KD_GRAPHICS) };
        } else {
            info!("direct: VT{} is not active, waiting for acquire", vt);
        }

        Ok(Self {
            tty,
            vt,
            signal_fd,
            active,
            initial_enable: active,
            pending_acquires: 0,
            old_sigmask,
            original_kd_mode,
            devices: HashMap::new(),
            next_device_id: 1,
        })
    }

    fn set_master(fd: RawFd) -> Result<(), SessionError> {
        let ret = unsafe { libc::ioctl(fd, drm_ioctl::DRM_IOCTL_SET_MASTER) };
        if ret < 0 {
            return Err(SessionError::last_os_error("DRM_IOCTL_SET_MASTER"));
        }
        Ok(())
    }

    fn drop_master(fd: RawFd) -> Result<(), SessionError> {
        let ret = unsafe { libc::ioctl(fd, drm_ioctl::DRM_IOCTL_DROP_MASTER) };
        if ret < 0 {
            return Err(SessionError::last_os_error("DRM_IOCTL_DROP_MASTER"));
        }
        Ok(())
    }

    fn gpu_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.devices
            .values()
            .filter(|d| d.class == DeviceClass::Gpu)
            .map(|d| d.fd.as_raw_fd())
    }

    /// Take the VT back after SIGUSR1
    fn ack_acquire(&mut self) -> Result<(), SessionError> {
        let tty_fd = self.tty.as_raw_fd();

        unsafe { libc::ioctl(tty_fd, KDSETMODE, KD_GRAPHICS) };
        // Flush any stale input
        unsafe { libc::tcflush(tty_fd, libc::TCIFLUSH) };

        let ret = unsafe { libc::ioctl(tty_fd, VT_RELDISP, VT_ACKACQ) };
        if ret < 0 {
            return Err(SessionError::last_os_error("VT_RELDISP(VT_ACKACQ)"));
        }

        for fd in self.gpu_fds() {
            if let Err(e) = Self::set_master(fd) {
                warn!("direct: failed to acquire DRM master on fd {}: {}", fd, e);
            }
        }

        self.active = true;
        info!("direct: VT{} acquired", self.vt);
        Ok(())
    }
}

impl SeatBackend for DirectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    fn seat_name(&self) -> &str {
        DEFAULT_SEAT
    }

    fn vt(&self) -> Option<u16> {
        Some(self.vt)
    }

    fn supports_vt(&self) -> bool {
        true
    }

    fn open_device(&mut self, path: &Path) -> Result<BackendDevice, SessionError> {
        let class = DeviceClass::require(path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC | libc::O_NOCTTY)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => SessionError::PermissionDenied {
                    path: path.to_path_buf(),
                },
                _ => SessionError::backend("open_device", e),
            })?;

        let meta = file
            .metadata()
            .map_err(|e| SessionError::backend("fstat", e))?;
        // The path only says where the node claims to be
        class.verify_node(path, &meta)?;
        let dev = meta.rdev() as libc::dev_t;

        let fd = OwnedFd::from(file);
        let raw_fd = fd.as_raw_fd();

        if class == DeviceClass::Gpu && self.active {
            if let Err(e) = Self::set_master(raw_fd) {
                warn!("direct: DRM master unavailable for {}: {}", path.display(), e);
            }
        }

        let id = self.next_device_id;
        self.next_device_id += 1;
        self.devices.insert(id, DirectDevice { fd, class });

        debug!(
            "direct: opened device {} (id={}, fd={})",
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

        if device.class == DeviceClass::Gpu && self.active {
            let _ = Self::drop_master(device.fd.as_raw_fd());
        }

        trace!("direct: closed device id={}", id);
        Ok(())
    }

    fn switch_session(&mut self, vt: u16) -> Result<(), SessionError> {
        info!("direct: requesting switch to VT{}", vt);
        let ret = unsafe { libc::ioctl(self.tty.as_raw_fd(), VT_ACTIVATE, vt as libc::c_int) };
        if ret < 0 {
            return Err(SessionError::last_os_error("VT_ACTIVATE"));
        }
        Ok(())
    }

    fn get_fd(&mut self) -> Result<RawFd, SessionError> {
        Ok(self.signal_fd.as_raw_fd())
    }

    fn dispatch(&mut self, out: &mut Vec<SeatNotification>) -> Result<(), SessionError> {
        if self.initial_enable {
            self.initial_enable = false;
            out.push(SeatNotification::Enable);
        }

        loop {
            match self.signal_fd.read_signal() {
                Ok(Some(siginfo)) => {
                    let signo = siginfo.ssi_signo as i32;
                    if signo == Signal::SIGUSR2 as i32 {
                        debug!("direct: SIGUSR2, VT release requested");
                        out.push(SeatNotification::Disable);
                    } else if signo == Signal::SIGUSR1 as i32 {
                        // Acked from enable_seat, after any release queued
                        // ahead of it in this batch
                        debug!("direct: SIGUSR1, VT acquire");
                        self.pending_acquires += 1;
                        out.push(SeatNotification::Enable);
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn enable_seat(&mut self) -> Result<(), SessionError> {
        if self.pending_acquires > 0 {
            self.pending_acquires -= 1;
            self.ack_acquire()?;
        }
        Ok(())
    }

    fn disable_seat(&mut self) -> Result<(), SessionError> {
        for fd in self.gpu_fds() {
            if let Err(e) = Self::drop_master(fd) {
                warn!("direct: failed to drop DRM master on fd {}: {}", fd, e);
            }
        }

        let tty_fd = self.tty.as_raw_fd();
        unsafe { libc::tcflush(tty_fd, libc::TCIFLUSH) };
        // Let the kernel console draw while we're away
        unsafe { libc::ioctl(tty_fd, KDSETMODE, KD_TEXT) };

        let ret = unsafe { libc::ioctl(tty_fd, VT_RELDISP, 1 as libc::c_int) };
        if ret < 0 {
            return Err(SessionError::last_os_error("VT_RELDISP(1)"));
        }

        self.active = false;
        info!("direct: VT{} released", self.vt);
        Ok(())
    }

    fn close_seat(self: Box<Self>) {
        info!("direct: closing seat on VT{}", self.vt);
    }
}

impl Drop for DirectBackend {
    fn drop(&mut self) {
        let tty_fd = self.tty.as_raw_fd();

        let ret = unsafe { libc::ioctl(tty_fd, KDSETMODE, self.original_kd_mode) };
        if ret < 0 {
            warn!(
                "direct: failed to restore KD mode: {}",
                std::io::Error::last_os_error()
            );
        }

        let mode = VtMode {
            mode: VT_AUTO,
            waitv: 0,
            relsig: 0,
            acqsig: 0,
            frsig: 0,
        };
        let ret = unsafe { libc::ioctl(tty_fd, VT_SETMODE, &mode) };
        if ret < 0 {
            warn!(
                "direct: failed to reset VT to VT_AUTO: {}",
                std::io::Error::last_os_error()
            );
        }

        if let Err(e) = self.old_sigmask.thread_set_mask() {
            warn!("direct: failed to restore signal mask: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Needs root and a real VT
    #[test]
    #[ignore]
    fn test_open_direct_seat() {
        let seat = DirectBackend::open(&SessionConfig::default());
        assert!(seat.is_ok(), "Failed to take over VT");
    }

    #[test]
    fn test_drm_ioctl_numbers() {
        // _IO('d', 0x1e) and _IO('d', 0x1f)
        assert_eq!(drm_ioctl::DRM_IOCTL_SET_MASTER, 0x641e);
        assert_eq!(drm_ioctl::DRM_IOCTL_DROP_MASTER, 0x641f);
    }
}
