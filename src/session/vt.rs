//! Virtual terminal discovery
//!
//! Works out which VT the compositor was started on and which VT the
//! kernel currently shows. Used by the direct backend and to report
//! the session's VT number for the libseat backend.

use std::fs::OpenOptions;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;

use log::debug;

use crate::constants::{MAX_VT, TTY_MAJOR, VT_GETSTATE};

/// vt_stat structure for VT_GETSTATE ioctl
#[repr(C)]
#[derive(Default)]
pub(crate) struct VtStat {
    pub v_active: libc::c_ushort,
    pub v_signal: libc::c_ushort,
    pub v_state: libc::c_ushort,
}

/// Query the active VT through an open tty descriptor
pub(crate) fn query_active(fd: libc::c_int) -> Option<u16> {
    let mut stat = VtStat::default();
    let ret = unsafe { libc::ioctl(fd, VT_GETSTATE, &mut stat) };
    if ret < 0 {
        None
    } else {
        Some(stat.v_active)
    }
}

/// Parse "ttyN" into N, rejecting numbers outside the VT range
pub fn parse_tty_name(name: &str) -> Option<u16> {
    let vt = name.strip_prefix("tty")?.parse::<u16>().ok()?;
    (1..=MAX_VT).contains(&vt).then_some(vt)
}

/// Parse a templated unit such as "compositor@tty2.service"
pub fn parse_systemd_unit(unit: &str) -> Option<u16> {
    let (_, rest) = unit.split_once('@')?;
    let instance = rest.split('.').next()?;
    parse_tty_name(instance)
}

/// Get the VT this process is meant to run on
///
/// Checks the systemd instance name, then the unit name, then the tty
/// attached to stdin (TTYPath= in a service file).
pub fn target_vt() -> Option<u16> {
    if let Some(vt) = std::env::var("SYSTEMD_INSTANCE")
        .ok()
        .and_then(|instance| parse_tty_name(&instance))
    {
        return Some(vt);
    }

    if let Some(vt) = std::env::var("SYSTEMD_UNIT")
        .ok()
        .and_then(|unit| parse_systemd_unit(&unit))
    {
        return Some(vt);
    }

    let tty_path = unsafe {
        let ptr = libc::ttyname(0);
        if ptr.is_null() {
            None
        } else {
            Some(std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    };

    if let Some(path) = &tty_path {
        debug!("stdin TTY: {}", path);
        if let Some(vt) = path.strip_prefix("/dev/").and_then(parse_tty_name) {
            return Some(vt);
        }
    }

    // Fallback: device number of stdin (tty1-tty63 is major=4, minor=1-63)
    let meta = std::fs::metadata("/proc/self/fd/0").ok()?;
    let rdev = meta.rdev() as libc::dev_t;
    let (major, minor) = (libc::major(rdev), libc::minor(rdev));
    debug!("stdin device: major={}, minor={}", major, minor);
    if major == TTY_MAJOR && minor >= 1 && minor <= MAX_VT as u32 {
        Some(minor as u16)
    } else {
        None
    }
}

/// Get currently active VT number
pub fn active_vt() -> Option<u16> {
    // sysfs needs no special permissions
    if let Ok(content) = std::fs::read_to_string("/sys/class/tty/tty0/active") {
        if let Some(vt) = parse_tty_name(content.trim()) {
            return Some(vt);
        }
    }

    let tty0 = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CLOEXEC)
        .open("/dev/tty0")
        .ok()?;
    query_active(tty0.as_raw_fd())
}

/// Check if the given VT is currently shown
pub fn is_vt_active(vt: u16) -> bool {
    active_vt() == Some(vt)
}
