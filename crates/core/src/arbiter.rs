//! Exclusive ownership of the camera and H.264 encoder.
//!
//! Two clients want the shared [`Hardware`]: the USB-driven
//! [`StreamOrchestrator`](crate::stream::StreamOrchestrator) and the RTSP
//! self-capture loop. The arbiter holds the hardware while nobody uses it
//! and moves it, by value, to whichever client takes it. A client can only
//! touch a device it currently owns.
//!
//! USB is authoritative. [`ResourceArbiter::usb_wants_hardware`] raises the
//! "USB owns" flag, which the self-capture loop checks once per frame; the
//! loop then tears down and hands the hardware back. The wait is bounded by
//! [`ArbiterConfig::handoff_timeout`]; past it the flag stays raised and
//! USB collects the hardware later with [`ResourceArbiter::try_take_for_usb`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::device::{FrameSource, HardwareEncoder};
use crate::error::{Error, Result};
use crate::relay::FrameRelay;

/// The shared devices, moved as one unit between owners.
pub struct Hardware {
    pub camera: Box<dyn FrameSource>,
    pub h264: Box<dyn HardwareEncoder>,
}

impl Hardware {
    pub fn new(camera: Box<dyn FrameSource>, h264: Box<dyn HardwareEncoder>) -> Self {
        Self { camera, h264 }
    }
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware").finish_non_exhaustive()
    }
}

/// Who currently holds the [`Hardware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Available,
    Usb,
    SelfCapture,
}

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// Longest a USB commit waits for self-capture to yield.
    pub handoff_timeout: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            handoff_timeout: Duration::from_millis(500),
        }
    }
}

struct Slot {
    hardware: Option<Hardware>,
    owner: Owner,
}

pub struct ResourceArbiter {
    slot: Mutex<Slot>,
    returned: Condvar,
    usb_owns: AtomicBool,
    relay: Arc<FrameRelay>,
    config: ArbiterConfig,
}

impl ResourceArbiter {
    pub fn new(hardware: Hardware, relay: Arc<FrameRelay>, config: ArbiterConfig) -> Self {
        Self {
            slot: Mutex::new(Slot {
                hardware: Some(hardware),
                owner: Owner::Available,
            }),
            returned: Condvar::new(),
            usb_owns: AtomicBool::new(false),
            relay,
            config,
        }
    }

    /// The relay woken when hardware becomes available again.
    pub fn relay(&self) -> &Arc<FrameRelay> {
        &self.relay
    }

    /// Whether the USB path has claimed the hardware. Polled by
    /// self-capture once per frame.
    pub fn usb_owns(&self) -> bool {
        self.usb_owns.load(Ordering::SeqCst)
    }

    pub fn owner(&self) -> Owner {
        self.slot.lock().owner
    }

    /// Claim the hardware for the USB path.
    ///
    /// Raises the "USB owns" flag, then waits for self-capture to return
    /// the hardware. If it has not done so within the handoff timeout this
    /// returns [`Error::ResourceContention`] with the flag still raised:
    /// self-capture is still forced out, and the claim completes through
    /// [`try_take_for_usb`](Self::try_take_for_usb) or is dropped with
    /// [`usb_withdraws`](Self::usb_withdraws).
    pub fn usb_wants_hardware(&self) -> Result<Hardware> {
        let started = Instant::now();
        let deadline = started + self.config.handoff_timeout;
        let mut slot = self.slot.lock();
        self.usb_owns.store(true, Ordering::SeqCst);

        loop {
            if let Some(hardware) = slot.hardware.take() {
                let previous = slot.owner;
                slot.owner = Owner::Usb;
                tracing::info!(
                    ?previous,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "hardware handed to USB"
                );
                return Ok(hardware);
            }
            if self.returned.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }

        // last look in case the release raced the timeout
        if let Some(hardware) = slot.hardware.take() {
            slot.owner = Owner::Usb;
            return Ok(hardware);
        }

        let waited = started.elapsed();
        tracing::warn!(
            waited_ms = waited.as_millis() as u64,
            owner = ?slot.owner,
            "self-capture did not yield hardware in time, USB claim stays pending"
        );
        Err(Error::ResourceContention { waited })
    }

    /// Complete a pending USB claim without blocking.
    pub fn try_take_for_usb(&self) -> Option<Hardware> {
        let mut slot = self.slot.lock();
        if !self.usb_owns() {
            return None;
        }
        let hardware = slot.hardware.take()?;
        slot.owner = Owner::Usb;
        tracing::info!("pending USB claim completed");
        Some(hardware)
    }

    /// Drop a USB claim that never received the hardware.
    pub fn usb_withdraws(&self) {
        {
            let slot = self.slot.lock();
            if slot.owner == Owner::Usb {
                return;
            }
            self.usb_owns.store(false, Ordering::SeqCst);
        }
        tracing::info!("pending USB claim withdrawn");
        if self.relay.is_open() {
            self.relay.wake();
        }
    }

    /// Give the hardware back after a USB session stops.
    pub fn usb_releases_hardware(&self, hardware: Hardware) {
        {
            let mut slot = self.slot.lock();
            slot.hardware = Some(hardware);
            slot.owner = Owner::Available;
            self.usb_owns.store(false, Ordering::SeqCst);
        }
        self.returned.notify_all();
        tracing::info!("USB released hardware");
        if self.relay.is_open() {
            self.relay.wake();
        }
    }

    /// Take the hardware for self-capture, unless USB owns it or it is
    /// already taken.
    pub fn try_acquire_self_capture(&self) -> Option<Hardware> {
        if self.usb_owns() {
            return None;
        }
        let mut slot = self.slot.lock();
        if self.usb_owns() {
            return None;
        }
        let hardware = slot.hardware.take()?;
        slot.owner = Owner::SelfCapture;
        tracing::debug!("self-capture acquired hardware");
        Some(hardware)
    }

    /// Return the hardware after self-capture has torn down.
    pub fn release_self_capture(&self, hardware: Hardware) {
        {
            let mut slot = self.slot.lock();
            slot.hardware = Some(hardware);
            slot.owner = Owner::Available;
        }
        self.returned.notify_all();
        tracing::debug!("self-capture released hardware");
    }
}
