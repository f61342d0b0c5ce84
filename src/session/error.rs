//! Session error taxonomy

use std::path::PathBuf;

use thiserror::Error;

use super::backend::BackendKind;

/// Errors returned by [`Session`](super::Session) and the seat backends
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation needs hardware access but the session is inactive
    #[error("session is not active")]
    NotActive,

    /// The backend refused the device (wrong device class or missing rights)
    #[error("permission denied for device {}", path.display())]
    PermissionDenied { path: PathBuf },

    /// Wrapped OS or seat daemon error
    #[error("{op} failed: {message}")]
    Backend {
        op: &'static str,
        code: Option<i32>,
        message: String,
    },

    /// The operation is not meaningful for the active backend
    #[error("unsupported by this seat backend: {0}")]
    Unsupported(&'static str),

    /// Every backend in the probe order failed to open a seat
    #[error("no seat backend available ({})", describe_probe_failures(.0))]
    NoBackendAvailable(Vec<(BackendKind, String)>),

    /// The seat notification channel failed; the session cannot continue
    #[error("seat channel lost: {message}")]
    SeatLost { code: Option<i32>, message: String },

    /// The session was already destroyed
    #[error("session destroyed")]
    Destroyed,
}

fn describe_probe_failures(failures: &[(BackendKind, String)]) -> String {
    failures
        .iter()
        .map(|(kind, reason)| format!("{}: {}", kind, reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl SessionError {
    /// Build a [`SessionError::Backend`] from an `io::Error`
    pub fn backend(op: &'static str, err: std::io::Error) -> Self {
        Self::Backend {
            op,
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    /// Build a [`SessionError::Backend`] from the calling thread's errno
    pub fn last_os_error(op: &'static str) -> Self {
        Self::backend(op, std::io::Error::last_os_error())
    }

    /// Underlying OS error code, if any
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Backend { code, .. } | Self::SeatLost { code, .. } => *code,
            _ => None,
        }
    }

    /// EINTR/EAGAIN: retried on the next dispatch instead of surfaced
    pub fn is_transient(&self) -> bool {
        matches!(
            self.os_code(),
            Some(code) if code == libc::EINTR || code == libc::EAGAIN || code == libc::EWOULDBLOCK
        )
    }
}

impl From<nix::Error> for SessionError {
    fn from(err: nix::Error) -> Self {
        Self::Backend {
            op: "syscall",
            code: Some(err as i32),
            message: err.desc().to_string(),
        }
    }
}
