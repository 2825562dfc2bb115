//! Render targets: the only thing a session writes into

use super::MediaSource;
use std::sync::Mutex;

/// Display surface. Holds at most one media source at a time.
pub trait RenderTarget: Send + Sync {
    /// Replace whatever is displayed with `source`
    fn attach(&self, source: MediaSource);

    /// Clear the surface
    fn release(&self);
}

/// Keeps the latest attached source in memory, for API readers
#[derive(Default)]
pub struct FrameSlot {
    current: Mutex<Option<MediaSource>>,
}

impl FrameSlot {
    /// Create new FrameSlot
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<MediaSource> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl RenderTarget for FrameSlot {
    fn attach(&self, source: MediaSource) {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(source);
    }

    fn release(&self) {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}
