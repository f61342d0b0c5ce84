//! bseat - seat sessions and output damage tracking for Linux compositors
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │          Compositor Event Loop           │
//! ├──────────────────────────────────────────┤
//! │  Session  ──probe──►  seatd | direct |   │
//! │     │                 noop backend       │
//! │     ├── DeviceRegistry (open devices)    │
//! │     └── Hotplug (udev / channel)         │
//! │                          ↓               │
//! │  DamageTracker (per output)  →  Render   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! The session decides whether the compositor may touch hardware at all;
//! the damage tracker decides what to repaint once it may.

pub mod config;
pub mod constants;
pub mod damage;
pub mod hotplug;
pub mod session;

pub use config::{Config, HotplugConfig, SessionConfig};
pub use damage::{DamageTracker, FrameDamage, Rect, Region};
pub use hotplug::{ChannelHotplug, HotplugAction, HotplugEvent, HotplugSender, HotplugSource};
pub use session::{
    BackendKind, CloseOutcome, Device, DeviceClass, DeviceId, Session, SessionError, SessionEvent,
    SessionState, Subscription, SubscriptionId,
};
