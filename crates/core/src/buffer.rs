//! Per-buffer ownership tracking.
//!
//! Every buffer the pipeline touches (camera pool entries, the crop staging
//! buffer, the encoder output) carries a [`BufferState`]. Moves between
//! states go through [`BufferSlot::advance`], which rejects any move that
//! does not correspond to a pipeline step:
//!
//! ```text
//! Free --dequeue--> Captured --deliver--> InFlight --release--> Free
//!                      |
//!                      +--copied/consumed--> Free
//! Free --crop-----> Cropped  --deliver--> InFlight
//!                      +--consumed--> Free
//! Free --encode---> Encoded  --deliver--> InFlight
//!                      +--dropped--> Free
//! ```

use crate::error::{Error, Result};

/// Ownership state of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferState {
    /// Owned by the device (or unused).
    #[default]
    Free,
    /// Dequeued from the camera, content valid.
    Captured,
    /// Holds a cropped copy of a camera frame.
    Cropped,
    /// Holds encoder output.
    Encoded,
    /// Handed to a consumer, waiting for its release.
    InFlight,
}

impl BufferState {
    pub fn can_advance(self, next: BufferState) -> bool {
        use BufferState::*;
        matches!(
            (self, next),
            (Free, Captured | Cropped | Encoded)
                | (Captured | Cropped | Encoded, InFlight | Free)
                | (InFlight, Free)
        )
    }
}

/// A buffer's current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferSlot {
    state: BufferState,
}

impl BufferSlot {
    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn is_free(&self) -> bool {
        self.state == BufferState::Free
    }

    /// Force the slot back to `Free` during teardown, returning the state
    /// it was in.
    pub fn reclaim(&mut self) -> BufferState {
        std::mem::take(&mut self.state)
    }

    /// Move to `next`, or fail without changing state.
    pub fn advance(&mut self, next: BufferState) -> Result<()> {
        if !self.state.can_advance(next) {
            return Err(Error::BufferTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(from = ?self.state, to = ?next, "buffer transition");
        self.state = next;
        Ok(())
    }
}
