//! Output damage tracking
//!
//! One [`DamageTracker`] per output accumulates the regions that changed
//! since the last presented frame and remembers the damage of the last
//! few frames, so a renderer can repaint only what a (possibly stale)
//! back buffer is missing.
//!
//! Per frame:
//! 1. `add_region` / `add_whole_output` as things change
//! 2. `attach_for_render(buffer_age)` before rendering
//! 3. `flush()` after a successful present

mod region;

pub use region::{Rect, Region};

use log::trace;

use crate::constants::DAMAGE_HISTORY_LEN;

/// Result of [`DamageTracker::attach_for_render`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDamage {
    /// Something changed or a repaint was requested
    pub needs_frame: bool,
    /// What to repaint in the buffer about to be rendered into
    pub buffer_damage: Region,
}

impl FrameDamage {
    /// Nothing to draw
    pub fn idle() -> Self {
        Self {
            needs_frame: false,
            buffer_damage: Region::new(),
        }
    }
}

pub struct DamageTracker {
    bounds: Rect,
    /// Damage since the last flush
    current: Region,
    /// Ring of flushed frames; `cursor` is the most recent
    history: [Region; DAMAGE_HISTORY_LEN],
    cursor: usize,
    /// How many history slots hold damage from a real frame
    valid: usize,
    /// Repaint needed even without damage (resize, explicit request)
    pending_attach: bool,
}

impl DamageTracker {
    /// Tracker for a `width` x `height` output; the first frame is a full repaint
    pub fn new(width: i32, height: i32) -> Self {
        let mut tracker = Self {
            bounds: Rect::new(0, 0, width, height),
            current: Region::new(),
            history: Default::default(),
            cursor: 0,
            valid: 0,
            pending_attach: false,
        };
        tracker.reset();
        tracker
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    /// Damage accumulated since the last flush
    pub fn current(&self) -> &Region {
        &self.current
    }

    /// Damage of a flushed frame, 0 = most recent
    pub fn history(&self, index: usize) -> Option<&Region> {
        if index >= self.valid {
            return None;
        }
        let slot = (self.cursor + index) % DAMAGE_HISTORY_LEN;
        Some(&self.history[slot])
    }

    pub fn add_region(&mut self, rect: Rect) {
        if let Some(clipped) = rect.intersection(&self.bounds) {
            self.current.add_rect(clipped);
        }
    }

    pub fn add_damage(&mut self, region: &Region) {
        for rect in region.rects() {
            self.add_region(*rect);
        }
    }

    pub fn add_whole_output(&mut self) {
        self.current.add_rect(self.bounds);
    }

    /// Ask for a frame even if nothing is damaged
    pub fn schedule_repaint(&mut self) {
        self.pending_attach = true;
    }

    /// Output mode changed: old damage coordinates are meaningless
    pub fn resize(&mut self, width: i32, height: i32) {
        self.bounds = Rect::new(0, 0, width, height);
        self.reset();
    }

    fn reset(&mut self) {
        for slot in &mut self.history {
            slot.clear();
        }
        self.valid = 0;
        self.current.clear();
        self.add_whole_output();
        self.pending_attach = true;
    }

    /// Decide whether to render and what to repaint in a buffer of `age`
    ///
    /// Age 1 is the buffer presented last frame, age 2 the one before. Age 0
    /// (unknown contents) or an age beyond the history damages everything.
    pub fn attach_for_render(&self, age: u32) -> FrameDamage {
        let needs_frame = !self.current.is_empty() || self.pending_attach;
        let buffer_damage = self.buffer_damage(age);
        trace!(
            "attach age={} needs_frame={} rects={}",
            age,
            needs_frame,
            buffer_damage.rects().len()
        );
        FrameDamage {
            needs_frame,
            buffer_damage,
        }
    }

    fn buffer_damage(&self, age: u32) -> Region {
        let whole = || Region::from_rect(self.bounds);

        let age = age as usize;
        if age == 0 || age > DAMAGE_HISTORY_LEN {
            return whole();
        }

        let mut damage = self.current.clone();
        for index in 0..age - 1 {
            match self.history(index) {
                Some(past) => damage.union_with(past),
                // Buffer is older than anything we remember
                None => return whole(),
            }
        }
        damage
    }

    /// Frame presented: rotate current damage into history
    pub fn flush(&mut self) {
        self.cursor = (self.cursor + DAMAGE_HISTORY_LEN - 1) % DAMAGE_HISTORY_LEN;
        // Swap instead of clone so the oldest slot's allocation is reused
        std::mem::swap(&mut self.current, &mut self.history[self.cursor]);
        self.current.clear();
        self.valid = (self.valid + 1).min(DAMAGE_HISTORY_LEN);
        self.pending_attach = false;
    }
}
