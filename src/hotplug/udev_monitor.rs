//! udev hotplug monitor
//!
//! Watches the configured subsystems (drm and input by default) on the
//! udev netlink socket. DRM connector changes show up as "change" events
//! carrying HOTPLUG=1.

use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{Context, Result};
use log::{debug, info};
use udev::EventType;

use super::{HotplugEvent, HotplugSource};

pub struct UdevMonitor {
    socket: udev::MonitorSocket,
}

impl UdevMonitor {
    pub fn new<S: AsRef<str>>(subsystems: &[S]) -> Result<Self> {
        let mut builder = udev::MonitorBuilder::new().context("Failed to create udev monitor builder")?;
        for subsystem in subsystems {
            builder = builder
                .match_subsystem(subsystem.as_ref())
                .with_context(|| format!("Failed to match {} subsystem", subsystem.as_ref()))?;
        }
        let socket = builder.listen().context("Failed to start udev monitor")?;

        info!("udev hotplug monitor initialized");
        Ok(Self { socket })
    }
}

impl HotplugSource for UdevMonitor {
    fn as_raw_fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn poll(&mut self, out: &mut Vec<HotplugEvent>) {
        for event in self.socket.iter() {
            // Only device nodes can be opened through a seat
            let Some(path) = event.devnode().map(|p| p.to_path_buf()) else {
                continue;
            };

            let hotplug = match event.event_type() {
                EventType::Add => HotplugEvent::added(path),
                EventType::Remove => HotplugEvent::removed(path),
                EventType::Change if event.property_value("HOTPLUG").map_or(false, |v| v == "1") => {
                    HotplugEvent::changed(path)
                }
                _ => continue,
            };

            debug!(
                "udev: {:?} {} ({})",
                hotplug.action,
                hotplug.path.display(),
                event.devpath().to_string_lossy()
            );
            out.push(hotplug);
        }
    }
}
