//! Framebuffer hand-off — §5/§6. No concrete video device ships in this
//! crate; this is the snapshot-publish primitive a display device would use
//! to hand a completed frame to a renderer thread without blocking either
//! side on the other's pace.

use std::sync::{Arc, Mutex};

/// Publishes snapshots of `T` for a renderer to pick up. The device thread
/// calls [`publish`](Self::publish) after it finishes drawing into its back
/// buffer (e.g. at vblank); the render thread calls [`latest`](Self::latest)
/// whenever it wants to draw, always getting the most recently published
/// frame rather than blocking on device progress.
///
/// This is a snapshot-publish protocol, not a true lock-free one: the inner
/// mutex is only ever held for the instant of an `Arc` pointer swap, so
/// contention between the two threads is effectively irrelevant in
/// practice.
pub struct RenderHandoff<T> {
    slot: Mutex<Arc<T>>,
}

impl<T> RenderHandoff<T> {
    pub fn new(initial: T) -> Self {
        Self { slot: Mutex::new(Arc::new(initial)) }
    }

    /// Swaps in a newly rendered frame, returning the previous one so the
    /// caller can reuse its allocation for the next back buffer.
    pub fn publish(&self, frame: T) -> Arc<T> {
        let mut guard = self.slot.lock().expect("render handoff mutex poisoned");
        std::mem::replace(&mut *guard, Arc::new(frame))
    }

    /// Returns the most recently published frame.
    pub fn latest(&self) -> Arc<T> {
        self.slot.lock().expect("render handoff mutex poisoned").clone()
    }
}
