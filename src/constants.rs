//! Global constants for bseat
//!
//! Consolidates ioctl numbers, VT ranges and frame bookkeeping sizes
//! to eliminate magic numbers throughout the codebase.

// ============================================================================
// VT ioctls (from linux/vt.h and linux/kd.h)
// ============================================================================

pub const VT_GETSTATE: libc::c_ulong = 0x5603;
pub const VT_SETMODE: libc::c_ulong = 0x5602;
pub const VT_RELDISP: libc::c_ulong = 0x5605;
pub const VT_ACTIVATE: libc::c_ulong = 0x5606;

/// VT_SETMODE modes
pub const VT_AUTO: libc::c_char = 0;
pub const VT_PROCESS: libc::c_char = 1;
pub const VT_ACKACQ: libc::c_int = 2;

pub const KDGETMODE: libc::c_ulong = 0x4B3B;
pub const KDSETMODE: libc::c_ulong = 0x4B3A;
pub const KD_TEXT: libc::c_long = 0x00;
pub const KD_GRAPHICS: libc::c_long = 0x01;

/// Character device major number of /dev/ttyN
pub const TTY_MAJOR: u32 = 4;

/// Character device major number of /dev/dri/*
pub const DRM_MAJOR: u32 = 226;

/// Character device major number of /dev/input/*
pub const INPUT_MAJOR: u32 = 13;

/// Highest VT number the kernel hands out
pub const MAX_VT: u16 = 63;

// ============================================================================
// Seat defaults
// ============================================================================

/// Seat that owns the VTs on a multi-seat system
pub const DEFAULT_SEAT: &str = "seat0";

/// Environment variable overriding the backend probe order
pub const BACKEND_ENV: &str = "BSEAT_BACKEND";

// ============================================================================
// Damage tracking
// ============================================================================

/// Number of flushed frames kept for buffer-age damage (double/triple buffering)
pub const DAMAGE_HISTORY_LEN: usize = 2;
