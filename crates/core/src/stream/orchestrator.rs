//! Per-format capture pipeline driven by the USB host.
//!
//! ```text
//! commit ──> Starting ──> Streaming ──stop──> Idle
//!               │ failure (rolled back)
//!               └──────────────────────────> Idle
//! ```
//!
//! `Starting` outlasts `commit` when self-capture misses the handoff
//! bound. The claim stays raised, and the session comes up on the first
//! [`produce_frame`](StreamOrchestrator::produce_frame) that finds the
//! hardware returned. Until then the host gets no frame.
//!
//! A frame travels camera → crop (if the negotiated size differs from
//! native) → encoder (MJPEG/H.264) → host. Where it ends up decides how it
//! is released:
//!
//! | Format | Cropped | Delivered from | Release returns |
//! |--------|---------|----------------|-----------------|
//! | Raw | no | camera buffer | camera buffer |
//! | Raw | yes | staging buffer | nothing |
//! | MJPEG/H.264 | either | encoder output | encoder output |
//!
//! Raw at native size is the only case where a camera buffer stays
//! dequeued while the host transfers it. Every other path copies or
//! consumes the camera buffer and requeues it before returning.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::{Frame, FrameOrigin, FrameRef, FrameTable, StreamFormat, UvcStreamHandler};
use crate::arbiter::{Hardware, ResourceArbiter};
use crate::buffer::{BufferSlot, BufferState};
use crate::crop::{self, CropLayout};
use crate::device::{EncoderKind, EncoderParams, HardwareEncoder, cache_aligned_len};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Starting,
    Streaming,
}

/// Encoder settings for USB sessions.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// H.264 parameters; the default makes every frame an IDR frame.
    pub h264: EncoderParams,
    pub jpeg: EncoderParams,
}

/// Delivered frame and byte totals, readable from any thread.
#[derive(Debug, Default)]
pub struct StreamCounters {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl StreamCounters {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn record(&self, len: usize) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }
}

struct CropStage {
    layout: CropLayout,
    /// Cache-line rounded; the frame occupies `len` bytes.
    buffer: Vec<u8>,
    len: usize,
    slot: BufferSlot,
}

/// Format committed by the host, kept until the hardware arrives.
#[derive(Debug, Clone, Copy)]
struct CommitRequest {
    format: StreamFormat,
    width: u32,
    height: u32,
    fps: u32,
    since: Instant,
}

struct StreamSession {
    format: StreamFormat,
    width: u32,
    height: u32,
    fps: u32,
    native: (u32, u32),
    hardware: Hardware,
    encoder: Option<EncoderKind>,
    crop: Option<CropStage>,
    camera_slots: Vec<BufferSlot>,
    encoder_slot: BufferSlot,
    in_flight: Option<FrameRef>,
}

/// Owns the USB pipeline and the JPEG encoder; borrows the camera and
/// H.264 encoder from the [`ResourceArbiter`] for the life of a session.
///
/// All operations take `&mut self`, so a commit can never overlap a
/// produce/release pair; a frame still in flight when a commit or stop
/// arrives is reclaimed before the devices are stopped.
pub struct StreamOrchestrator {
    arbiter: Arc<ResourceArbiter>,
    jpeg: Box<dyn HardwareEncoder>,
    frames: FrameTable,
    config: OrchestratorConfig,
    state: StreamState,
    session: Option<StreamSession>,
    pending: Option<CommitRequest>,
    counters: Arc<StreamCounters>,
    sequence: u64,
    clock: Instant,
}

fn active_encoder<'a>(
    kind: Option<EncoderKind>,
    jpeg: &'a mut Box<dyn HardwareEncoder>,
    h264: &'a mut Box<dyn HardwareEncoder>,
) -> Option<&'a mut Box<dyn HardwareEncoder>> {
    match kind? {
        EncoderKind::Jpeg => Some(jpeg),
        EncoderKind::H264 => Some(h264),
    }
}

impl StreamOrchestrator {
    pub fn new(
        arbiter: Arc<ResourceArbiter>,
        jpeg: Box<dyn HardwareEncoder>,
        frames: FrameTable,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            arbiter,
            jpeg,
            frames,
            config,
            state: StreamState::Idle,
            session: None,
            pending: None,
            counters: Arc::new(StreamCounters::default()),
            sequence: 0,
            clock: Instant::now(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn frame_table(&self) -> &FrameTable {
        &self.frames
    }

    pub fn counters(&self) -> Arc<StreamCounters> {
        self.counters.clone()
    }

    /// Committed `(format, width, height, fps)`, if streaming.
    pub fn negotiated(&self) -> Option<(StreamFormat, u32, u32, u32)> {
        self.session
            .as_ref()
            .map(|s| (s.format, s.width, s.height, s.fps))
    }

    /// Whether the current session crops camera frames.
    pub fn is_cropping(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.crop.is_some())
    }

    /// Start a session for `format` at `width` x `height`.
    ///
    /// A request outside the frame table is rejected before anything
    /// changes. A running session is stopped first. Any failure while
    /// starting rolls back to [`StreamState::Idle`] with the hardware
    /// returned to the arbiter.
    ///
    /// If self-capture does not yield the hardware within the handoff
    /// bound the commit still succeeds and stays in
    /// [`StreamState::Starting`]; see the module docs.
    pub fn commit(&mut self, format: StreamFormat, width: u32, height: u32, fps: u32) -> Result<()> {
        self.frames.validate(format, width, height, fps)?;

        if self.session.is_some() || self.pending.is_some() {
            tracing::info!(?format, width, height, "commit while streaming, restarting session");
            self.stop();
        }

        self.state = StreamState::Starting;
        tracing::info!(?format, width, height, fps, "starting stream session");

        let request = CommitRequest {
            format,
            width,
            height,
            fps,
            since: Instant::now(),
        };
        match self.arbiter.usb_wants_hardware() {
            Ok(hardware) => self.start_session(hardware, request),
            Err(Error::ResourceContention { waited }) => {
                tracing::warn!(
                    ?format,
                    waited_ms = waited.as_millis() as u64,
                    "hardware not yet returned, commit pending"
                );
                self.pending = Some(request);
                Ok(())
            }
            Err(e) => {
                self.arbiter.usb_withdraws();
                self.state = StreamState::Idle;
                Err(e)
            }
        }
    }

    /// Whether a commit is waiting for self-capture to yield.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Finish a pending commit if the hardware has come back.
    fn resume_pending(&mut self) -> Result<()> {
        let Some(request) = self.pending else {
            return Ok(());
        };
        let Some(hardware) = self.arbiter.try_take_for_usb() else {
            return Err(Error::ResourceContention {
                waited: request.since.elapsed(),
            });
        };
        self.pending = None;
        tracing::info!(
            format = ?request.format,
            waited_ms = request.since.elapsed().as_millis() as u64,
            "hardware arrived for pending commit"
        );
        self.start_session(hardware, request)
    }

    fn start_session(&mut self, mut hardware: Hardware, request: CommitRequest) -> Result<()> {
        let CommitRequest {
            format,
            width,
            height,
            fps,
            ..
        } = request;
        match self.bring_up(&mut hardware, format, width, height, fps) {
            Ok((crop, camera_slots)) => {
                let native = hardware.camera.native_resolution();
                self.session = Some(StreamSession {
                    format,
                    width,
                    height,
                    fps,
                    native,
                    hardware,
                    encoder: format.encoder(),
                    crop,
                    camera_slots,
                    encoder_slot: BufferSlot::default(),
                    in_flight: None,
                });
                self.state = StreamState::Streaming;
                tracing::info!(
                    ?format,
                    width,
                    height,
                    native_width = native.0,
                    native_height = native.1,
                    cropping = self.is_cropping(),
                    "stream session started"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(?format, width, height, error = %e, "stream start failed, rolling back");
                hardware.h264.stop();
                self.jpeg.stop();
                hardware.camera.stop();
                self.arbiter.usb_releases_hardware(hardware);
                self.state = StreamState::Idle;
                Err(e)
            }
        }
    }

    fn bring_up(
        &mut self,
        hardware: &mut Hardware,
        format: StreamFormat,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<(Option<CropStage>, Vec<BufferSlot>)> {
        let (native_w, native_h) = hardware.camera.native_resolution();
        if width > native_w || height > native_h {
            return Err(Error::FormatRejected {
                format,
                width,
                height,
                fps,
            });
        }
        let capture = format.capture_format();
        let count = hardware.camera.configure(native_w, native_h, capture)?;

        let crop = if (width, height) != (native_w, native_h) {
            let layout = CropLayout::for_format(capture)
                .ok_or_else(|| Error::device("crop buffer", format!("cannot crop {capture:?}")))?;
            let len = layout.frame_len(width, height);
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(cache_aligned_len(len))
                .map_err(|e| Error::device("crop buffer", e.to_string()))?;
            buffer.resize(cache_aligned_len(len), 0);
            tracing::debug!(?layout, len, allocated = buffer.len(), "crop buffer allocated");
            Some(CropStage {
                layout,
                buffer,
                len,
                slot: BufferSlot::default(),
            })
        } else {
            None
        };

        if let Some(kind) = format.encoder() {
            let params = match kind {
                EncoderKind::Jpeg => self.config.jpeg,
                EncoderKind::H264 => self.config.h264,
            };
            let encoder = match kind {
                EncoderKind::Jpeg => &mut self.jpeg,
                EncoderKind::H264 => &mut hardware.h264,
            };
            encoder.start(width, height, capture, &params)?;
        }

        Ok((crop, vec![BufferSlot::default(); count]))
    }

    /// Capture, crop and encode the next frame.
    ///
    /// H.264 output is also offered to the RTP relay. The frame must be
    /// returned through [`release_frame`](Self::release_frame) before the
    /// next call.
    pub fn produce_frame(&mut self) -> Result<Frame<'_>> {
        self.resume_pending()?;
        let info = self.capture_next()?;
        let data = self.frame_data(&info)?;
        Ok(Frame { info, data })
    }

    fn capture_next(&mut self) -> Result<FrameRef> {
        let session = self.session.as_mut().ok_or(Error::NotStreaming)?;
        if session.in_flight.is_some() {
            return Err(Error::FrameInFlight);
        }

        let (origin, len) = match Self::run_pipeline(session, &mut self.jpeg, &self.arbiter) {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(error = %e, "frame production failed");
                Self::reclaim(session, &mut self.jpeg);
                return Err(e);
            }
        };

        let info = FrameRef {
            sequence: self.sequence,
            format: session.format,
            width: session.width,
            height: session.height,
            len,
            timestamp: self.clock.elapsed(),
            origin,
        };
        self.sequence += 1;
        session.in_flight = Some(info);
        self.counters.record(len);
        tracing::trace!(sequence = info.sequence, len, ?origin, "frame produced");
        Ok(info)
    }

    fn run_pipeline(
        session: &mut StreamSession,
        jpeg: &mut Box<dyn HardwareEncoder>,
        arbiter: &ResourceArbiter,
    ) -> Result<(FrameOrigin, usize)> {
        let StreamSession {
            width,
            height,
            native,
            hardware,
            encoder,
            crop,
            camera_slots,
            encoder_slot,
            ..
        } = session;

        let captured = hardware.camera.dequeue()?;
        let id = captured.id;
        camera_slots
            .get_mut(id)
            .ok_or_else(|| Error::device("camera", format!("buffer {id} outside pool")))?
            .advance(BufferState::Captured)?;

        if let Some(stage) = crop.as_mut() {
            let needed = stage.layout.frame_len(native.0, native.1);
            if captured.bytes_used < needed {
                return Err(Error::device(
                    "camera",
                    format!("short frame: {} of {needed} bytes", captured.bytes_used),
                ));
            }
            let src = hardware.camera.buffer(id)?;
            crop::crop(
                &src[..captured.bytes_used],
                native.0,
                native.1,
                &mut stage.buffer,
                *width,
                *height,
                stage.layout,
            );
            hardware.camera.enqueue(id)?;
            camera_slots[id].advance(BufferState::Free)?;
            stage.slot.advance(BufferState::Cropped)?;
        }

        let Some(enc) = active_encoder(*encoder, jpeg, &mut hardware.h264) else {
            return match crop.as_mut() {
                Some(stage) => {
                    stage.slot.advance(BufferState::InFlight)?;
                    Ok((FrameOrigin::Staging, stage.len))
                }
                None => {
                    camera_slots[id].advance(BufferState::InFlight)?;
                    Ok((FrameOrigin::Camera(id), captured.bytes_used))
                }
            };
        };

        let encoded = match crop.as_mut() {
            Some(stage) => {
                enc.flush_input(&stage.buffer[..cache_aligned_len(stage.len)]);
                let encoded = enc.encode(&stage.buffer[..stage.len]);
                stage.slot.advance(BufferState::Free)?;
                encoded
            }
            None => {
                let encoded = match hardware.camera.buffer(id) {
                    Ok(raw) => enc.encode(&raw[..captured.bytes_used]),
                    Err(e) => Err(e),
                };
                hardware.camera.enqueue(id)?;
                camera_slots[id].advance(BufferState::Free)?;
                encoded
            }
        };
        let len = encoded?;
        encoder_slot.advance(BufferState::Encoded)?;

        if enc.kind() == EncoderKind::H264 {
            arbiter.relay().offer(&enc.output()[..len]);
        }
        encoder_slot.advance(BufferState::InFlight)?;
        Ok((FrameOrigin::Encoder, len))
    }

    /// Bytes of the frame currently in flight.
    pub fn frame_data(&self, info: &FrameRef) -> Result<&[u8]> {
        let session = self.session.as_ref().ok_or(Error::NotStreaming)?;
        if session.in_flight.map(|f| f.sequence) != Some(info.sequence) {
            return Err(Error::UnknownFrame {
                sequence: info.sequence,
            });
        }
        let data = match info.origin {
            FrameOrigin::Camera(id) => session.hardware.camera.buffer(id)?,
            FrameOrigin::Staging => session
                .crop
                .as_ref()
                .map(|stage| &stage.buffer[..stage.len])
                .ok_or(Error::NotStreaming)?,
            FrameOrigin::Encoder => match session.encoder {
                Some(EncoderKind::Jpeg) => self.jpeg.output(),
                Some(EncoderKind::H264) => session.hardware.h264.output(),
                None => return Err(Error::NotStreaming),
            },
        };
        Ok(&data[..info.len.min(data.len())])
    }

    /// Return the buffer behind a delivered frame.
    ///
    /// Releasing after the session stopped is a no-op; the buffer was
    /// reclaimed by [`stop`](Self::stop).
    pub fn release_frame(&mut self, frame: FrameRef) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(sequence = frame.sequence, "release after stop ignored");
            return Ok(());
        };
        if session.in_flight.map(|f| f.sequence) != Some(frame.sequence) {
            return Err(Error::UnknownFrame {
                sequence: frame.sequence,
            });
        }
        session.in_flight = None;

        match frame.origin {
            FrameOrigin::Encoder => {
                if let Some(enc) =
                    active_encoder(session.encoder, &mut self.jpeg, &mut session.hardware.h264)
                {
                    enc.release_output()?;
                }
                session.encoder_slot.advance(BufferState::Free)?;
            }
            FrameOrigin::Camera(id) => {
                session.hardware.camera.enqueue(id)?;
                if let Some(slot) = session.camera_slots.get_mut(id) {
                    slot.advance(BufferState::Free)?;
                }
            }
            FrameOrigin::Staging => {
                if let Some(stage) = session.crop.as_mut() {
                    stage.slot.advance(BufferState::Free)?;
                }
            }
        }
        tracing::trace!(sequence = frame.sequence, origin = ?frame.origin, "frame released");
        Ok(())
    }

    /// Return every buffer the pipeline still holds to its device.
    fn reclaim(session: &mut StreamSession, jpeg: &mut Box<dyn HardwareEncoder>) {
        for (id, slot) in session.camera_slots.iter_mut().enumerate() {
            if !slot.is_free() {
                if let Err(e) = session.hardware.camera.enqueue(id) {
                    tracing::warn!(id, error = %e, "camera buffer requeue failed");
                }
                slot.reclaim();
            }
        }
        if let Some(stage) = session.crop.as_mut() {
            stage.slot.reclaim();
        }
        if !session.encoder_slot.is_free() {
            if let Some(enc) = active_encoder(session.encoder, jpeg, &mut session.hardware.h264)
                && let Err(e) = enc.release_output()
            {
                tracing::warn!(error = %e, "encoder output release failed");
            }
            session.encoder_slot.reclaim();
        }
        session.in_flight = None;
    }

    /// Tear down the session and hand the hardware back. Idempotent.
    pub fn stop(&mut self) {
        if self.pending.take().is_some() {
            self.arbiter.usb_withdraws();
        }
        let Some(mut session) = self.session.take() else {
            self.state = StreamState::Idle;
            return;
        };
        if let Some(frame) = session.in_flight {
            tracing::debug!(sequence = frame.sequence, "stopping with frame in flight");
        }
        Self::reclaim(&mut session, &mut self.jpeg);

        if let Some(enc) = active_encoder(session.encoder, &mut self.jpeg, &mut session.hardware.h264) {
            enc.stop();
        }
        session.hardware.camera.stop();
        drop(session.crop.take());

        self.arbiter.usb_releases_hardware(session.hardware);
        self.state = StreamState::Idle;
        tracing::info!(
            format = ?session.format,
            frames = self.counters.frames(),
            "stream session stopped"
        );
    }
}

impl UvcStreamHandler for StreamOrchestrator {
    fn on_commit(&mut self, format: StreamFormat, width: u32, height: u32, fps: u32) -> Result<()> {
        self.commit(format, width, height, fps)
    }

    fn on_get_frame(&mut self) -> Option<Frame<'_>> {
        match self.produce_frame() {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!(error = %e, "no frame for host");
                None
            }
        }
    }

    fn on_release_frame(&mut self, frame: FrameRef) {
        if let Err(e) = self.release_frame(frame) {
            tracing::warn!(sequence = frame.sequence, error = %e, "frame release failed");
        }
    }

    fn on_stop(&mut self) {
        self.stop();
    }
}

impl Drop for StreamOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{ArbiterConfig, Owner};
    use crate::device::PixelFormat;
    use crate::device::synthetic::{CameraProbe, EncoderProbe, SyntheticCamera, SyntheticEncoder};
    use crate::media::h264::H264Packetizer;
    use crate::relay::{FrameRelay, RelayEvent};
    use crate::stream::FrameSize;
    use std::time::Duration;

    struct Rig {
        orchestrator: StreamOrchestrator,
        arbiter: Arc<ResourceArbiter>,
        camera: Arc<CameraProbe>,
        h264: Arc<EncoderProbe>,
        jpeg: Arc<EncoderProbe>,
    }

    fn rig(native: u32) -> Rig {
        let camera = SyntheticCamera::new(native, native);
        let h264 = SyntheticEncoder::open(EncoderKind::H264);
        let jpeg = SyntheticEncoder::open(EncoderKind::Jpeg);
        let (camera_probe, h264_probe, jpeg_probe) = (camera.probe(), h264.probe(), jpeg.probe());
        let arbiter = Arc::new(ResourceArbiter::new(
            Hardware::new(Box::new(camera), Box::new(h264)),
            Arc::new(FrameRelay::default()),
            ArbiterConfig {
                handoff_timeout: Duration::from_millis(50),
            },
        ));
        let orchestrator = StreamOrchestrator::new(
            arbiter.clone(),
            Box::new(jpeg),
            FrameTable::new(
                vec![FrameSize::new(native, native, 15), FrameSize::new(16, 8, 15)],
                vec![FrameSize::new(native, native, 50), FrameSize::new(16, 8, 50)],
                vec![FrameSize::new(native, native, 50), FrameSize::new(16, 8, 50)],
            ),
            OrchestratorConfig::default(),
        );
        Rig {
            orchestrator,
            arbiter,
            camera: camera_probe,
            h264: h264_probe,
            jpeg: jpeg_probe,
        }
    }

    #[test]
    fn raw_native_holds_camera_buffer_until_release() {
        let mut rig = rig(32);
        rig.orchestrator.commit(StreamFormat::Raw, 32, 32, 15).unwrap();
        assert!(!rig.orchestrator.is_cropping());

        let frame = rig.orchestrator.produce_frame().unwrap();
        let info = frame.info;
        assert_eq!(info.origin, FrameOrigin::Camera(0));
        assert_eq!(frame.data.len(), 32 * 32 * 2);
        assert_eq!(frame.data[5], SyntheticCamera::pattern_byte(5));
        assert_eq!(rig.camera.outstanding(), 1);

        rig.orchestrator.release_frame(info).unwrap();
        assert_eq!(rig.camera.outstanding(), 0);
    }

    #[test]
    fn raw_cropped_releases_camera_before_return() {
        let mut rig = rig(32);
        rig.orchestrator.commit(StreamFormat::Raw, 16, 8, 15).unwrap();
        assert!(rig.orchestrator.is_cropping());

        let frame = rig.orchestrator.produce_frame().unwrap();
        assert_eq!(frame.info.origin, FrameOrigin::Staging);
        assert_eq!(frame.data.len(), 16 * 8 * 2);
        // x offset 8, y offset 12 in a 32-pixel wide UYVY frame
        let at = (12 * 32 + 8) * 2;
        assert_eq!(frame.data[0], SyntheticCamera::pattern_byte(at));
        let info = frame.info;
        assert_eq!(rig.camera.outstanding(), 0);

        rig.orchestrator.release_frame(info).unwrap();
        assert_eq!(rig.camera.outstanding(), 0);
    }

    #[test]
    fn h264_frames_are_offered_to_open_relay() {
        let mut rig = rig(32);
        rig.arbiter.relay().open();
        rig.orchestrator.commit(StreamFormat::H264, 16, 8, 30).unwrap();
        assert_eq!(rig.h264.last_config().map(|c| (c.0, c.1)), Some((16, 8)));
        assert_eq!(rig.h264.last_flush_len(), 0);

        let frame = rig.orchestrator.produce_frame().unwrap();
        assert_eq!(frame.info.origin, FrameOrigin::Encoder);
        let nals = H264Packetizer::extract_nal_units(frame.data);
        assert_eq!(nals[0][0] & 0x1f, 7);
        let (info, bytes) = (frame.info, frame.data.to_vec());
        assert_eq!(rig.camera.outstanding(), 0);
        assert!(rig.h264.output_held());
        assert_eq!(rig.h264.last_flush_len(), cache_aligned_len(16 * 8 * 3 / 2));

        let mut relayed = Vec::new();
        assert_eq!(
            rig.arbiter.relay().wait(Duration::from_millis(10), &mut relayed),
            RelayEvent::Frame(bytes.len())
        );
        assert_eq!(relayed, bytes);

        rig.orchestrator.release_frame(info).unwrap();
        assert!(!rig.h264.output_held());
    }

    #[test]
    fn mjpeg_uses_jpeg_encoder_at_native() {
        let mut rig = rig(16);
        rig.orchestrator.commit(StreamFormat::Mjpeg, 16, 16, 30).unwrap();
        assert_eq!(rig.camera.last_config(), Some((16, 16, PixelFormat::Uyvy)));

        let frame = rig.orchestrator.produce_frame().unwrap();
        assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
        let info = frame.info;
        assert_eq!(rig.camera.outstanding(), 0);
        assert_eq!(rig.h264.frames(), 0);
        rig.orchestrator.release_frame(info).unwrap();
        assert!(!rig.jpeg.output_held());
    }

    #[test]
    fn second_frame_requires_release() {
        let mut rig = rig(16);
        rig.orchestrator.commit(StreamFormat::H264, 16, 16, 30).unwrap();
        let info = rig.orchestrator.produce_frame().unwrap().info;
        assert!(matches!(
            rig.orchestrator.produce_frame(),
            Err(Error::FrameInFlight)
        ));
        rig.orchestrator.release_frame(info).unwrap();
        assert!(matches!(
            rig.orchestrator.release_frame(info),
            Err(Error::UnknownFrame { .. })
        ));
        let next = rig.orchestrator.produce_frame().unwrap().info;
        assert_eq!(next.sequence, info.sequence + 1);
        assert!(next.timestamp >= info.timestamp);
    }

    #[test]
    fn produce_without_commit_fails() {
        let mut rig = rig(16);
        assert!(matches!(
            rig.orchestrator.produce_frame(),
            Err(Error::NotStreaming)
        ));
    }

    #[test]
    fn rejected_format_changes_nothing() {
        let mut rig = rig(16);
        rig.orchestrator.commit(StreamFormat::Raw, 16, 16, 15).unwrap();
        let err = rig.orchestrator.commit(StreamFormat::Raw, 16, 16, 30).unwrap_err();
        assert!(matches!(err, Error::FormatRejected { .. }));
        assert_eq!(rig.orchestrator.state(), StreamState::Streaming);
        assert_eq!(
            rig.orchestrator.negotiated(),
            Some((StreamFormat::Raw, 16, 16, 15))
        );
        assert_eq!(rig.camera.configures(), 1);
    }

    #[test]
    fn commit_while_streaming_restarts_cleanly() {
        let mut rig = rig(32);
        rig.orchestrator.commit(StreamFormat::Raw, 32, 32, 15).unwrap();
        let _held = rig.orchestrator.produce_frame().unwrap().info;

        rig.orchestrator.commit(StreamFormat::H264, 16, 8, 30).unwrap();
        assert_eq!(rig.camera.leaked(), 0);
        assert_eq!(rig.camera.stops(), 1);
        assert_eq!(rig.camera.configures(), 2);
        assert_eq!(rig.camera.conflicts(), 0);
        assert_eq!(rig.camera.last_config(), Some((32, 32, PixelFormat::Yuv420)));
        assert_eq!(rig.orchestrator.state(), StreamState::Streaming);
    }

    #[test]
    fn stop_is_idempotent_and_returns_hardware() {
        let mut rig = rig(16);
        rig.orchestrator.commit(StreamFormat::H264, 16, 16, 30).unwrap();
        assert_eq!(rig.arbiter.owner(), Owner::Usb);
        let _in_flight = rig.orchestrator.produce_frame().unwrap().info;

        rig.orchestrator.stop();
        rig.orchestrator.stop();
        assert_eq!(rig.orchestrator.state(), StreamState::Idle);
        assert_eq!(rig.arbiter.owner(), Owner::Available);
        assert!(!rig.arbiter.usb_owns());
        assert_eq!(rig.h264.leaked(), 0);
        assert_eq!(rig.h264.stops(), 1);
        assert_eq!(rig.camera.stops(), 1);
        assert!(!rig.camera.is_streaming());
    }

    #[test]
    fn release_after_stop_is_ignored() {
        let mut rig = rig(16);
        rig.orchestrator.commit(StreamFormat::Raw, 16, 16, 15).unwrap();
        let info = rig.orchestrator.produce_frame().unwrap().info;
        rig.orchestrator.stop();
        assert!(rig.orchestrator.release_frame(info).is_ok());
        assert_eq!(rig.camera.leaked(), 0);
    }

    #[test]
    fn camera_failure_rolls_back() {
        let mut rig = rig(16);
        rig.camera.fail_next_configure();
        let err = rig.orchestrator.commit(StreamFormat::H264, 16, 16, 30).unwrap_err();
        assert!(matches!(err, Error::DeviceFault { .. }));
        assert_eq!(rig.orchestrator.state(), StreamState::Idle);
        assert_eq!(rig.arbiter.owner(), Owner::Available);
        assert!(!rig.arbiter.usb_owns());
        assert_eq!(rig.h264.starts(), 0);
    }

    #[test]
    fn encoder_failure_rolls_back_camera() {
        let mut rig = rig(16);
        rig.jpeg.fail_next_start();
        assert!(rig.orchestrator.commit(StreamFormat::Mjpeg, 16, 16, 30).is_err());
        assert_eq!(rig.orchestrator.state(), StreamState::Idle);
        assert!(!rig.camera.is_streaming());
        assert_eq!(rig.arbiter.owner(), Owner::Available);

        rig.orchestrator.commit(StreamFormat::Mjpeg, 16, 16, 30).unwrap();
        assert_eq!(rig.camera.conflicts(), 0);
    }

    #[test]
    fn slow_handoff_leaves_commit_pending() {
        let mut rig = rig(16);
        let held = rig.arbiter.try_acquire_self_capture().unwrap();
        rig.orchestrator.commit(StreamFormat::Raw, 16, 16, 15).unwrap();
        assert_eq!(rig.orchestrator.state(), StreamState::Starting);
        assert!(rig.orchestrator.is_pending());
        assert!(rig.arbiter.usb_owns());
        assert!(matches!(
            rig.orchestrator.produce_frame(),
            Err(Error::ResourceContention { .. })
        ));
        assert!(rig.orchestrator.on_get_frame().is_none());

        rig.arbiter.release_self_capture(held);
        assert!(rig.arbiter.try_acquire_self_capture().is_none());
        let info = rig.orchestrator.produce_frame().unwrap().info;
        assert_eq!(rig.orchestrator.state(), StreamState::Streaming);
        assert_eq!(rig.arbiter.owner(), Owner::Usb);
        assert_eq!(
            rig.orchestrator.negotiated(),
            Some((StreamFormat::Raw, 16, 16, 15))
        );
        rig.orchestrator.release_frame(info).unwrap();
        rig.orchestrator.stop();
        assert_eq!(rig.arbiter.owner(), Owner::Available);
    }

    #[test]
    fn stop_while_pending_withdraws_claim() {
        let mut rig = rig(16);
        let held = rig.arbiter.try_acquire_self_capture().unwrap();
        rig.orchestrator.commit(StreamFormat::H264, 16, 16, 30).unwrap();
        assert!(rig.arbiter.usb_owns());

        rig.orchestrator.stop();
        assert_eq!(rig.orchestrator.state(), StreamState::Idle);
        assert!(!rig.orchestrator.is_pending());
        assert!(!rig.arbiter.usb_owns());
        rig.arbiter.release_self_capture(held);
        assert_eq!(rig.h264.starts(), 0);
        assert!(rig.arbiter.try_acquire_self_capture().is_some());
    }

    #[test]
    fn counters_track_delivered_frames() {
        let mut rig = rig(16);
        rig.orchestrator.commit(StreamFormat::Raw, 16, 16, 15).unwrap();
        for _ in 0..3 {
            let info = rig.orchestrator.produce_frame().unwrap().info;
            rig.orchestrator.release_frame(info).unwrap();
        }
        let counters = rig.orchestrator.counters();
        assert_eq!(counters.frames(), 3);
        assert_eq!(counters.bytes(), 3 * 16 * 16 * 2);
    }

    #[test]
    fn uvc_handler_callbacks() {
        let mut rig = rig(16);
        let handler: &mut dyn UvcStreamHandler = &mut rig.orchestrator;
        assert!(handler.on_get_frame().is_none());
        handler.on_commit(StreamFormat::H264, 16, 16, 30).unwrap();
        let info = handler.on_get_frame().map(|f| f.info).unwrap();
        handler.on_release_frame(info);
        handler.on_stop();
        assert!(!rig.h264.output_held());
        assert_eq!(rig.arbiter.owner(), Owner::Available);
    }
}
