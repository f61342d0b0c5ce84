//! Seat session management
//!
//! A [`Session`] is the only way the compositor gets at privileged
//! devices. It owns one seat backend (probed at creation), the registry
//! of open devices and the hotplug subscription, and republishes seat and
//! hotplug changes to subscribers in the order they happened.
//!
//! ```text
//!   compositor event loop
//!        │  poll(get_fd, hotplug_fd)
//!        ▼
//!   Session::dispatch ──► SeatBackend::dispatch ──► Enable/Disable
//!        │                                              │
//!        ├──► HotplugSource::poll ──► Add/Remove        │
//!        ▼                                              ▼
//!   subscribers (mpsc, in order) ◄──────────── SessionEvent
//! ```
//!
//! Nothing here spawns threads; all work happens inside the caller's
//! `dispatch` and device calls.

pub mod backend;
pub mod error;
pub mod registry;
pub mod vt;

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::config::{Config, HotplugConfig};
use crate::damage::{DamageTracker, FrameDamage};
use crate::hotplug::{HotplugAction, HotplugEvent, HotplugSource};

pub use backend::{BackendKind, DeviceClass, SeatBackend, SeatNotification};
pub use error::SessionError;
pub use registry::{Device, DeviceId, DeviceRegistry};

use backend::BackendDevice;
use registry::DeviceEntry;

/// Change delivered to session subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Seat acquired; GPU devices are usable again
    Activated,
    /// Seat released; stop touching GPU devices until `Activated`
    Deactivated,
    DeviceAdded { path: PathBuf },
    DeviceChanged { path: PathBuf },
    /// A device node went away; `device` is set if it was open. The handle
    /// stays revoked until the compositor closes it
    DeviceRemoved {
        path: PathBuf,
        device: Option<DeviceId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of a session subscription
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::Receiver<SessionEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Active,
    Destroyed,
}

/// Result of [`Session::close_device`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    /// Already closed by the caller or by destroy
    AlreadyClosed,
}

pub struct Session {
    /// None once destroyed
    backend: Option<Box<dyn SeatBackend>>,
    hotplug: Option<Box<dyn HotplugSource>>,
    registry: DeviceRegistry,
    active: bool,
    seat_name: String,
    vt: Option<u16>,
    subscribers: Vec<(SubscriptionId, mpsc::Sender<SessionEvent>)>,
    next_subscription: u64,
    next_device_id: u64,
    /// Scratch buffers reused across dispatches
    notifications: Vec<SeatNotification>,
    hotplug_events: Vec<HotplugEvent>,
}

impl Session {
    /// Probe backends in the configured order and open a session
    ///
    /// Fails only if every backend fails.
    pub fn create(config: &Config) -> Result<Self, SessionError> {
        let order = config.session.probe_order();
        let backend = backend::probe(&order, &config.session)?;
        let hotplug = open_hotplug(&config.hotplug);
        Ok(Self::with_backend(backend, hotplug))
    }

    /// Build a session around an already opened backend
    pub fn with_backend(
        backend: Box<dyn SeatBackend>,
        hotplug: Option<Box<dyn HotplugSource>>,
    ) -> Self {
        let seat_name = backend.seat_name().to_string();
        let vt = backend.vt();
        let active = backend.initially_active();

        info!(
            "Session on seat '{}' via {} (vt={:?}, active={})",
            seat_name,
            backend.kind(),
            vt,
            active
        );

        Self {
            backend: Some(backend),
            hotplug,
            registry: DeviceRegistry::new(),
            active,
            seat_name,
            vt,
            subscribers: Vec::new(),
            next_subscription: 1,
            next_device_id: 1,
            notifications: Vec::new(),
            hotplug_events: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        match (&self.backend, self.active) {
            (None, _) => SessionState::Destroyed,
            (Some(_), true) => SessionState::Active,
            (Some(_), false) => SessionState::Inactive,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn seat_name(&self) -> &str {
        &self.seat_name
    }

    /// VT number, None if the seat has no VTs
    pub fn vt(&self) -> Option<u16> {
        self.vt
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    /// Open a device node through the seat
    ///
    /// Requires an active session. On failure nothing is registered.
    pub fn open_device<P: AsRef<Path>>(&mut self, path: P) -> Result<Device, SessionError> {
        let path = path.as_ref();
        let backend = self.backend.as_mut().ok_or(SessionError::Destroyed)?;
        if !self.active {
            return Err(SessionError::NotActive);
        }

        let class = DeviceClass::require(path)?;
        let BackendDevice { id: backend_id, fd, dev } = backend.open_device(path)?;

        let device = Device {
            id: DeviceId(self.next_device_id),
            fd,
            dev,
            path: path.to_path_buf(),
            class,
        };
        self.next_device_id += 1;

        self.registry.insert(DeviceEntry {
            device: device.clone(),
            backend_id,
            revoked: false,
            removed: false,
        });

        debug!(
            "Opened {} as {} (fd={}, {:?})",
            path.display(),
            device.id,
            fd,
            class
        );
        Ok(device)
    }

    /// Close a device; closing twice is not an error
    ///
    /// A device invalidated by hotplug removal still holds its descriptor
    /// and is released here like any other.
    pub fn close_device(&mut self, device: &Device) -> Result<CloseOutcome, SessionError> {
        let Some(backend) = self.backend.as_mut() else {
            // destroy() closed everything
            return Ok(CloseOutcome::AlreadyClosed);
        };
        let Some(entry) = self.registry.remove(device.id) else {
            trace!("{} already closed", device.id);
            return Ok(CloseOutcome::AlreadyClosed);
        };

        backend.close_device(entry.backend_id)?;
        debug!("Closed {} ({})", device.id, device.path.display());
        Ok(CloseOutcome::Closed)
    }

    /// Look up an open device (works while inactive)
    pub fn find_device(&self, id: DeviceId) -> Option<&Device> {
        self.registry.find(id).map(|e| &e.device)
    }

    /// Open devices in the order they were opened
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.registry.devices()
    }

    pub fn device_count(&self) -> usize {
        self.registry.len()
    }

    /// GPU devices are revoked while the session is inactive, removed
    /// devices until they are closed
    pub fn is_revoked(&self, device: &Device) -> bool {
        self.registry
            .find(device.id)
            .map(|e| e.revoked || e.removed)
            .unwrap_or(true)
    }

    /// Ask the seat to switch to another VT
    ///
    /// Returns false if the seat has no VTs. The resulting
    /// Deactivated/Activated arrive later through `dispatch`.
    pub fn change_vt(&mut self, target: u16) -> Result<bool, SessionError> {
        let backend = self.backend.as_mut().ok_or(SessionError::Destroyed)?;
        if !backend.supports_vt() {
            debug!("Seat '{}' has no VTs, ignoring switch to {}", self.seat_name, target);
            return Ok(false);
        }
        match backend.switch_session(target) {
            Ok(()) => Ok(true),
            Err(SessionError::Unsupported(what)) => {
                debug!("VT switch unsupported: {}", what);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Descriptor the event loop should poll for seat notifications
    pub fn get_fd(&mut self) -> Result<RawFd, SessionError> {
        self.backend
            .as_mut()
            .ok_or(SessionError::Destroyed)?
            .get_fd()
    }

    /// Descriptor of the hotplug source, if it has one
    pub fn hotplug_fd(&self) -> Option<RawFd> {
        self.hotplug.as_ref().and_then(|h| h.as_raw_fd())
    }

    /// Wait up to `timeout` for seat or hotplug activity and process it
    ///
    /// `None` waits until something is readable. Returns the number of
    /// events published. EINTR/EAGAIN are swallowed; any other backend
    /// failure is fatal for the session. Notifications received in the
    /// same batch as a failure are still published first.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<usize, SessionError> {
        let backend = self.backend.as_mut().ok_or(SessionError::Destroyed)?;

        let mut fds = Vec::with_capacity(2);
        fds.push(backend.get_fd().map_err(seat_lost)?);
        if let Some(fd) = self.hotplug.as_ref().and_then(|h| h.as_raw_fd()) {
            fds.push(fd);
        }

        if let Err(e) = wait_readable(&fds, timeout) {
            if e.is_transient() {
                trace!("dispatch: poll interrupted, retrying next call");
                return Ok(0);
            }
            return Err(seat_lost(e));
        }

        let mut notifications = std::mem::take(&mut self.notifications);
        let result = backend.dispatch(&mut notifications);

        let mut published = 0;
        let mut failure = None;
        for notification in notifications.drain(..) {
            match self.handle_notification(notification) {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!("Seat {:?} handling failed: {}", notification, e);
                    failure.get_or_insert(e);
                }
            }
        }
        self.notifications = notifications;

        if let Some(e) = failure {
            return Err(seat_lost(e));
        }

        if let Err(e) = result {
            if e.is_transient() {
                trace!("dispatch: transient seat error: {}", e);
            } else {
                return Err(seat_lost(e));
            }
        }

        published += self.process_hotplug();
        Ok(published)
    }

    fn handle_notification(&mut self, notification: SeatNotification) -> Result<(), SessionError> {
        match notification {
            SeatNotification::Enable => {
                // Acknowledge only now, after any earlier Disable in the batch
                // has been released
                if let Some(backend) = self.backend.as_mut() {
                    backend.enable_seat()?;
                }
                self.active = true;
                for entry in self.registry.iter_mut() {
                    entry.revoked = false;
                }
                info!("Session activated on seat '{}'", self.seat_name);
                self.publish(SessionEvent::Activated);
            }
            SeatNotification::Disable => {
                self.active = false;
                for entry in self.registry.iter_mut() {
                    if entry.device.class == DeviceClass::Gpu {
                        entry.revoked = true;
                    }
                }
                info!("Session deactivated on seat '{}'", self.seat_name);
                self.publish(SessionEvent::Deactivated);

                if let Some(backend) = self.backend.as_mut() {
                    backend.disable_seat()?;
                }
            }
        }
        Ok(())
    }

    fn process_hotplug(&mut self) -> usize {
        let Some(source) = self.hotplug.as_mut() else {
            return 0;
        };

        let mut events = std::mem::take(&mut self.hotplug_events);
        source.poll(&mut events);

        let mut published = 0;
        for event in events.drain(..) {
            published += self.handle_hotplug(event);
        }
        self.hotplug_events = events;
        published
    }

    fn handle_hotplug(&mut self, event: HotplugEvent) -> usize {
        match event.action {
            HotplugAction::Add => {
                debug!("Device added: {}", event.path.display());
                self.publish(SessionEvent::DeviceAdded { path: event.path });
                1
            }
            HotplugAction::Change => {
                debug!("Device changed: {}", event.path.display());
                self.publish(SessionEvent::DeviceChanged { path: event.path });
                1
            }
            HotplugAction::Remove => {
                let ids = self.registry.ids_for_path(&event.path);
                if ids.is_empty() {
                    debug!("Device removed: {}", event.path.display());
                    self.publish(SessionEvent::DeviceRemoved {
                        path: event.path,
                        device: None,
                    });
                    return 1;
                }

                for id in &ids {
                    self.invalidate(*id);
                    self.publish(SessionEvent::DeviceRemoved {
                        path: event.path.clone(),
                        device: Some(*id),
                    });
                }
                ids.len()
            }
        }
    }

    /// Mark a device whose node went away
    ///
    /// The descriptor stays open: the compositor still holds its number and
    /// closing it here would let the next open reuse it under the handle.
    fn invalidate(&mut self, id: DeviceId) {
        let Some(entry) = self.registry.find_mut(id) else {
            return;
        };
        entry.removed = true;
        info!(
            "{} ({}) removed, revoked until closed",
            id,
            entry.device.path.display()
        );
    }

    /// Subscribe to session events; each subscriber sees every event in order
    pub fn subscribe(&mut self) -> Subscription {
        let (tx, rx) = mpsc::channel();
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, tx));
        Subscription { id, events: rx }
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    fn publish(&mut self, event: SessionEvent) {
        trace!("Publishing {:?}", event);
        // Subscribers whose receiver is gone are dropped
        self.subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Damage for the next frame, gated on the session being active
    ///
    /// While inactive nothing is rendered and the tracker keeps its damage.
    pub fn attach_for_render(&self, tracker: &DamageTracker, age: u32) -> FrameDamage {
        if !self.is_active() {
            return FrameDamage::idle();
        }
        tracker.attach_for_render(age)
    }

    /// Close every open device, then the seat
    ///
    /// Idempotent; the session is unusable afterwards.
    pub fn destroy(&mut self) {
        let Some(mut backend) = self.backend.take() else {
            return;
        };

        for entry in self.registry.drain() {
            debug!("Force-closing {} ({})", entry.device.id, entry.device.path.display());
            if let Err(e) = backend.close_device(entry.backend_id) {
                warn!("Failed to close {}: {}", entry.device.id, e);
            }
        }

        self.active = false;
        self.hotplug = None;
        self.subscribers.clear();
        backend.close_seat();
        info!("Session on seat '{}' destroyed", self.seat_name);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn seat_lost(err: SessionError) -> SessionError {
    match err {
        SessionError::SeatLost { .. } | SessionError::Destroyed => err,
        other => SessionError::SeatLost {
            code: other.os_code(),
            message: other.to_string(),
        },
    }
}

#[cfg(all(target_os = "linux", feature = "udev"))]
fn open_hotplug(config: &HotplugConfig) -> Option<Box<dyn HotplugSource>> {
    if !config.enabled {
        return None;
    }
    match crate::hotplug::UdevMonitor::new(&config.subsystems) {
        Ok(monitor) => Some(Box::new(monitor)),
        Err(e) => {
            info!("Hotplug monitor unavailable: {:#}", e);
            None
        }
    }
}

#[cfg(not(all(target_os = "linux", feature = "udev")))]
fn open_hotplug(config: &HotplugConfig) -> Option<Box<dyn HotplugSource>> {
    if config.enabled {
        info!("Hotplug monitor unavailable: udev support not compiled in");
    }
    None
}

/// poll(2) the given descriptors for readability
fn wait_readable(fds: &[RawFd], timeout: Option<Duration>) -> Result<bool, SessionError> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = match timeout {
        None => -1,
        // Round up so a sub-millisecond timeout still waits
        Some(d) => ((d.as_micros() + 999) / 1000).min(libc::c_int::MAX as u128) as libc::c_int,
    };

    let ret = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    if ret < 0 {
        return Err(SessionError::last_os_error("poll"));
    }
    Ok(ret > 0)
}

#[cfg(test)]
mod tests;
