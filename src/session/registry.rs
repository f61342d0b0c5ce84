//! Open device bookkeeping
//!
//! Insertion-ordered so shutdown closes devices in the order they were
//! opened. Only [`Session`](super::Session) mutates the registry, always
//! together with the matching backend call.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use super::backend::DeviceClass;

/// Session-assigned device id, never reused within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) u64);

impl DeviceId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// A device opened through a session
///
/// The descriptor stays valid until the device is closed through the
/// session, removed by hot-plug, or the session is destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub(crate) id: DeviceId,
    pub(crate) fd: RawFd,
    pub(crate) dev: libc::dev_t,
    pub(crate) path: PathBuf,
    pub(crate) class: DeviceClass,
}

impl Device {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Device number (major/minor)
    pub fn dev(&self) -> libc::dev_t {
        self.dev
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }
}

/// Registry entry: the handle plus backend-side state
#[derive(Debug, Clone)]
pub(crate) struct DeviceEntry {
    pub device: Device,
    /// Id the backend knows this device by
    pub backend_id: i32,
    /// GPU access revoked while the session is inactive
    pub revoked: bool,
    /// Node disappeared; the descriptor stays open until the caller closes it
    pub removed: bool,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: Vec<DeviceEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&mut self, entry: DeviceEntry) {
        debug_assert!(self.find(entry.device.id).is_none());
        self.entries.push(entry);
    }

    pub(crate) fn remove(&mut self, id: DeviceId) -> Option<DeviceEntry> {
        let index = self.entries.iter().position(|e| e.device.id == id)?;
        Some(self.entries.remove(index))
    }

    pub(crate) fn find(&self, id: DeviceId) -> Option<&DeviceEntry> {
        self.entries.iter().find(|e| e.device.id == id)
    }

    pub(crate) fn find_mut(&mut self, id: DeviceId) -> Option<&mut DeviceEntry> {
        self.entries.iter_mut().find(|e| e.device.id == id)
    }

    /// Ids of all live entries opened from `path`
    pub(crate) fn ids_for_path(&self, path: &Path) -> Vec<DeviceId> {
        self.entries
            .iter()
            .filter(|e| e.device.path == path && !e.removed)
            .map(|e| e.device.id)
            .collect()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceEntry> {
        self.entries.iter_mut()
    }

    /// Handles in insertion order
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.entries.iter().map(|e| &e.device)
    }

    /// Take every entry out, oldest first
    pub(crate) fn drain(&mut self) -> Vec<DeviceEntry> {
        std::mem::take(&mut self.entries)
    }
}
