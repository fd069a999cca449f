//! Single-slot mailbox carrying H.264 frames from the USB encode path to
//! the RTP sender.
//!
//! The producer never blocks: if the sender is copying the previous frame
//! out of the slot, the new frame is dropped. A pending frame that has not
//! been collected yet is overwritten by a newer one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Default slot size. Larger frames are truncated.
pub const DEFAULT_RELAY_CAPACITY: usize = 256 * 1024;

struct RelaySlot {
    data: Vec<u8>,
    len: usize,
    pending: bool,
    woken: bool,
}

/// Outcome of [`FrameRelay::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    /// A frame of this many bytes was copied out.
    Frame(usize),
    /// [`FrameRelay::wake`] was called; the waiter should re-check state.
    Woken,
    TimedOut,
}

pub struct FrameRelay {
    slot: Mutex<RelaySlot>,
    ready: Condvar,
    open: AtomicBool,
    capacity: usize,
    offered: AtomicU64,
    dropped: AtomicU64,
}

impl FrameRelay {
    pub fn new(capacity: usize) -> Self {
        Self {
            slot: Mutex::new(RelaySlot {
                data: vec![0; capacity],
                len: 0,
                pending: false,
                woken: false,
            }),
            ready: Condvar::new(),
            open: AtomicBool::new(false),
            capacity,
            offered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start accepting frames (an RTP consumer is playing). A wake left
    /// over from before the relay opened is dropped.
    pub fn open(&self) {
        self.slot.lock().woken = false;
        self.open.store(true, Ordering::SeqCst);
    }

    /// Stop accepting frames and discard any pending one.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.slot.lock().pending = false;
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Offer a frame. Returns whether it was stored.
    pub fn offer(&self, frame: &[u8]) -> bool {
        if !self.is_open() {
            return false;
        }
        self.offered.fetch_add(1, Ordering::Relaxed);
        let Some(mut slot) = self.slot.try_lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(bytes = frame.len(), "relay busy, frame dropped");
            return false;
        };
        let len = frame.len().min(self.capacity);
        if len < frame.len() {
            tracing::warn!(
                bytes = frame.len(),
                capacity = self.capacity,
                "frame larger than relay slot, truncated"
            );
        }
        slot.data[..len].copy_from_slice(&frame[..len]);
        slot.len = len;
        slot.pending = true;
        drop(slot);
        self.ready.notify_one();
        true
    }

    /// Interrupt a pending [`wait`](Self::wait).
    pub fn wake(&self) {
        self.slot.lock().woken = true;
        self.ready.notify_all();
    }

    /// Wait up to `timeout` for a frame and copy it into `out`.
    pub fn wait(&self, timeout: Duration, out: &mut Vec<u8>) -> RelayEvent {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if slot.pending {
                slot.pending = false;
                let len = slot.len;
                out.clear();
                out.extend_from_slice(&slot.data[..len]);
                return RelayEvent::Frame(len);
            }
            if slot.woken {
                slot.woken = false;
                return RelayEvent::Woken;
            }
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                return RelayEvent::TimedOut;
            }
        }
    }

    /// Frames offered while open.
    pub fn offered(&self) -> u64 {
        self.offered.load(Ordering::Relaxed)
    }

    /// Frames dropped because the slot was busy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FrameRelay {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_CAPACITY)
    }
}
