//! Single-slot frame mailbox
//!
//! The rendezvous between the pipeline worker and the monitor sender. The
//! slot holds at most one encoded frame; a frame arriving while the slot is
//! occupied is dropped and counted, so a slow client can never stall the
//! pipeline. Because at most one frame is buffered, delivery order is the
//! pipeline's processing order.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// What the pipeline hands encoded frames to.
pub trait FrameSink: Send + Sync {
    /// Whether an authorized session is currently consuming frames.
    fn ready(&self) -> bool;

    /// Offer an encoded frame. Returns false when the frame was dropped
    /// (no session, or the slot was still occupied).
    fn send_frame(&self, frame: Bytes) -> bool;
}

#[derive(Default)]
pub struct FrameMailbox {
    slot: Mutex<Option<Bytes>>,
    dropped: AtomicU64,
    monitoring: AtomicBool,
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the server on session transitions. Enabling clears any
    /// stale frame and resets the drop counter for the new session.
    pub fn set_monitoring(&self, on: bool) {
        if on {
            *self.slot.lock() = None;
            self.dropped.store(0, Ordering::Relaxed);
        }
        self.monitoring.store(on, Ordering::SeqCst);
    }

    /// Take ownership of the pending frame, if any.
    pub fn take(&self) -> Option<Bytes> {
        self.slot.lock().take()
    }

    /// Frames dropped on the current session.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSink for FrameMailbox {
    fn ready(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    fn send_frame(&self, frame: Bytes) -> bool {
        if !self.ready() {
            return false;
        }
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(frame);
            true
        } else {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(dropped, "monitor busy, frame dropped");
            false
        }
    }
}
