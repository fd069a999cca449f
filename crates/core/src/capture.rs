//! RTP sender thread and the self-capture loop.
//!
//! While an RTSP client is playing, frames reach it one of two ways:
//!
//! - **USB streaming H.264**: the orchestrator offers each encoded frame to
//!   the [`FrameRelay`]; the sender copies it out and packetizes it.
//! - **USB idle**: the sender takes the hardware from the arbiter and runs
//!   the camera and encoder itself at native resolution until USB claims
//!   them back, the client stops playing, or the server shuts down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::arbiter::{Hardware, ResourceArbiter};
use crate::device::{EncoderParams, PixelFormat};
use crate::error::{Error, Result};
use crate::relay::{FrameRelay, RelayEvent};
use crate::session::SharedRtpSession;

/// Timing of the sender loop.
#[derive(Debug, Clone, Copy)]
pub struct SenderTiming {
    /// Poll interval while no client is playing or no hardware is free.
    pub idle_poll: Duration,
    /// Longest wait for a relayed frame before re-checking state.
    pub frame_wait: Duration,
    /// Pause after a failed self-capture session before retrying.
    pub restart_backoff: Duration,
}

impl Default for SenderTiming {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(100),
            frame_wait: Duration::from_secs(1),
            restart_backoff: Duration::from_secs(1),
        }
    }
}

/// The camera and H.264 encoder driven on behalf of the RTSP client.
pub struct SelfCapture<'a> {
    arbiter: &'a ResourceArbiter,
    rtp: &'a SharedRtpSession,
    params: EncoderParams,
    running: &'a AtomicBool,
}

impl<'a> SelfCapture<'a> {
    pub fn new(
        arbiter: &'a ResourceArbiter,
        rtp: &'a SharedRtpSession,
        params: EncoderParams,
        running: &'a AtomicBool,
    ) -> Self {
        Self {
            arbiter,
            rtp,
            params,
            running,
        }
    }

    /// Run one self-capture session. Returns the number of frames sent, 0
    /// if the hardware was not available.
    ///
    /// The hardware is always stopped and handed back before returning.
    pub fn run(&self) -> Result<u64> {
        let Some(mut hardware) = self.arbiter.try_acquire_self_capture() else {
            return Ok(0);
        };
        let result = self.stream(&mut hardware);
        hardware.h264.stop();
        hardware.camera.stop();
        self.arbiter.release_self_capture(hardware);
        if let Ok(frames) = result {
            tracing::info!(frames, usb_owns = self.arbiter.usb_owns(), "self-capture stopped");
        }
        result
    }

    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && !self.arbiter.usb_owns()
            && self.rtp.lock().is_active()
    }

    fn stream(&self, hardware: &mut Hardware) -> Result<u64> {
        let (width, height) = hardware.camera.native_resolution();
        hardware
            .camera
            .configure(width, height, PixelFormat::Yuv420)?;
        hardware
            .h264
            .start(width, height, PixelFormat::Yuv420, &self.params)?;
        tracing::info!(width, height, "self-capture started");

        let mut frames = 0;
        while self.should_continue() {
            let captured = hardware.camera.dequeue()?;
            let encoded = match hardware.camera.buffer(captured.id) {
                Ok(raw) => hardware.h264.encode(&raw[..captured.bytes_used]),
                Err(e) => Err(e),
            };
            hardware.camera.enqueue(captured.id)?;
            let len = encoded?;

            let sent = self.rtp.lock().send_frame(&hardware.h264.output()[..len]);
            hardware.h264.release_output()?;
            match sent {
                Ok(report) => {
                    frames += 1;
                    tracing::trace!(frames, packets = report.packets, "self-capture frame sent");
                }
                Err(Error::RtpInactive) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(frames)
    }
}

/// Feeds the RTP session from the relay or from self-capture.
pub struct RtpSender {
    arbiter: Arc<ResourceArbiter>,
    relay: Arc<FrameRelay>,
    rtp: SharedRtpSession,
    params: EncoderParams,
    timing: SenderTiming,
    running: Arc<AtomicBool>,
    frame: Vec<u8>,
}

impl RtpSender {
    pub fn new(
        arbiter: Arc<ResourceArbiter>,
        rtp: SharedRtpSession,
        params: EncoderParams,
        timing: SenderTiming,
        running: Arc<AtomicBool>,
    ) -> Self {
        let relay = arbiter.relay().clone();
        let frame = Vec::with_capacity(relay.capacity());
        Self {
            arbiter,
            relay,
            rtp,
            params,
            timing,
            running,
            frame,
        }
    }

    /// Loop until `running` is cleared.
    pub fn run(mut self) {
        tracing::debug!("RTP sender started");
        while self.running.load(Ordering::SeqCst) {
            if !self.rtp.lock().is_active() {
                // PLAY wakes the relay, so this returns early when a client starts
                self.relay.wait(self.timing.idle_poll, &mut self.frame);
                continue;
            }

            if !self.arbiter.usb_owns() {
                let capture =
                    SelfCapture::new(&self.arbiter, &self.rtp, self.params, &self.running);
                match capture.run() {
                    Ok(0) => thread::sleep(self.timing.idle_poll),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "self-capture failed, backing off");
                        thread::sleep(self.timing.restart_backoff);
                    }
                }
                continue;
            }

            if let RelayEvent::Frame(len) = self.relay.wait(self.timing.frame_wait, &mut self.frame) {
                match self.rtp.lock().send_frame(&self.frame[..len]) {
                    Ok(report) => {
                        tracing::trace!(len, packets = report.packets, "relayed frame sent");
                    }
                    Err(e) => tracing::debug!(error = %e, "relayed frame not sent"),
                }
            }
        }
        tracing::debug!("RTP sender exited");
    }
}
