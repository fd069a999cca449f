//! In-memory camera, encoder and ISP.
//!
//! These behave like the real V4L2 devices as far as the core can observe:
//! fixed native resolution, a small buffer pool with dequeue/enqueue
//! discipline, an encoder that must be reopened on resolution change and
//! rejects input layouts it cannot take. Each device reports what happened
//! to it through a shared probe so tests can assert on ownership and leaks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    BufferId, CapturedBuffer, EncoderKind, EncoderParams, FrameSource, HardwareEncoder, PixelFormat,
};
use crate::controls::{IspBackend, IspControl};
use crate::error::{Error, Result};

const CAMERA: &str = "camera";

/// Counters shared between a [`SyntheticCamera`] and whoever observes it.
#[derive(Debug, Default)]
pub struct CameraProbe {
    configures: AtomicUsize,
    stops: AtomicUsize,
    frames: AtomicU64,
    outstanding: AtomicUsize,
    leaked: AtomicUsize,
    conflicts: AtomicUsize,
    streaming: AtomicBool,
    fail_next_configure: AtomicBool,
    last_config: Mutex<Option<(u32, u32, PixelFormat)>>,
}

impl CameraProbe {
    pub fn configures(&self) -> usize {
        self.configures.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Buffers currently dequeued and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Buffers that were still dequeued when the device was stopped.
    pub fn leaked(&self) -> usize {
        self.leaked.load(Ordering::SeqCst)
    }

    /// Attempts to configure the device while it was already streaming.
    pub fn conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<(u32, u32, PixelFormat)> {
        *self.last_config.lock()
    }

    /// Make the next `configure` call fail with a device fault.
    pub fn fail_next_configure(&self) {
        self.fail_next_configure.store(true, Ordering::SeqCst);
    }
}

/// Camera producing a fixed test pattern at its native resolution.
pub struct SyntheticCamera {
    native: (u32, u32),
    buffer_count: usize,
    frame_interval: Duration,
    format: Option<PixelFormat>,
    buffers: Vec<Vec<u8>>,
    held: Vec<bool>,
    free: VecDeque<BufferId>,
    probe: Arc<CameraProbe>,
}

impl SyntheticCamera {
    pub const DEFAULT_BUFFER_COUNT: usize = 2;

    pub fn new(width: u32, height: u32) -> Self {
        Self {
            native: (width, height),
            buffer_count: Self::DEFAULT_BUFFER_COUNT,
            frame_interval: Duration::ZERO,
            format: None,
            buffers: Vec::new(),
            held: Vec::new(),
            free: VecDeque::new(),
            probe: Arc::new(CameraProbe::default()),
        }
    }

    /// Delay applied by every `dequeue`, emulating the sensor frame rate.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count.max(1);
        self
    }

    pub fn probe(&self) -> Arc<CameraProbe> {
        self.probe.clone()
    }

    /// Byte at `offset` of every captured frame.
    pub fn pattern_byte(offset: usize) -> u8 {
        (offset % 251) as u8
    }
}

impl FrameSource for SyntheticCamera {
    fn native_resolution(&self) -> (u32, u32) {
        self.native
    }

    fn configure(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<usize> {
        if self.format.is_some() {
            self.probe.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(Error::device(CAMERA, "device busy"));
        }
        if self.probe.fail_next_configure.swap(false, Ordering::SeqCst) {
            return Err(Error::device(CAMERA, "injected configure failure"));
        }
        if (width, height) != self.native {
            return Err(Error::device(
                CAMERA,
                format!("{width}x{height} is not the native resolution"),
            ));
        }
        let len = format
            .frame_len(width, height)
            .ok_or_else(|| Error::device(CAMERA, format!("cannot capture {format:?}")))?;

        let frame: Vec<u8> = (0..len).map(Self::pattern_byte).collect();
        self.buffers = vec![frame; self.buffer_count];
        self.held = vec![false; self.buffer_count];
        self.free = (0..self.buffer_count).collect();
        self.format = Some(format);

        self.probe.configures.fetch_add(1, Ordering::SeqCst);
        self.probe.streaming.store(true, Ordering::SeqCst);
        *self.probe.last_config.lock() = Some((width, height, format));

        tracing::debug!(width, height, ?format, buffers = self.buffer_count, "synthetic camera streaming");
        Ok(self.buffer_count)
    }

    fn dequeue(&mut self) -> Result<CapturedBuffer> {
        if self.format.is_none() {
            return Err(Error::device(CAMERA, "not streaming"));
        }
        if !self.frame_interval.is_zero() {
            thread::sleep(self.frame_interval);
        }
        let id = self
            .free
            .pop_front()
            .ok_or_else(|| Error::device(CAMERA, "all buffers dequeued"))?;
        self.held[id] = true;
        self.probe.frames.fetch_add(1, Ordering::SeqCst);
        self.probe.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(CapturedBuffer {
            id,
            bytes_used: self.buffers[id].len(),
        })
    }

    fn buffer(&self, id: BufferId) -> Result<&[u8]> {
        match self.held.get(id) {
            Some(true) => Ok(&self.buffers[id]),
            _ => Err(Error::device(CAMERA, format!("buffer {id} is not dequeued"))),
        }
    }

    fn enqueue(&mut self, id: BufferId) -> Result<()> {
        match self.held.get_mut(id) {
            Some(held) if *held => {
                *held = false;
                self.free.push_back(id);
                self.probe.outstanding.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(Error::device(CAMERA, format!("buffer {id} is not dequeued"))),
        }
    }

    fn stop(&mut self) {
        if self.format.take().is_none() {
            return;
        }
        let leaked = self.held.iter().filter(|h| **h).count();
        if leaked > 0 {
            tracing::warn!(leaked, "camera stopped with buffers still dequeued");
            self.probe.leaked.fetch_add(leaked, Ordering::SeqCst);
            self.probe.outstanding.fetch_sub(leaked, Ordering::SeqCst);
        }
        self.buffers.clear();
        self.held.clear();
        self.free.clear();
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        self.probe.streaming.store(false, Ordering::SeqCst);
    }
}

/// Counters shared between a [`SyntheticEncoder`] and whoever observes it.
#[derive(Debug, Default)]
pub struct EncoderProbe {
    starts: AtomicUsize,
    reopens: AtomicUsize,
    stops: AtomicUsize,
    frames: AtomicU64,
    leaked: AtomicUsize,
    conflicts: AtomicUsize,
    flushed: AtomicUsize,
    running: AtomicBool,
    output_held: AtomicBool,
    fail_next_start: AtomicBool,
    last_config: Mutex<Option<(u32, u32, EncoderParams)>>,
}

impl EncoderProbe {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Times the device was torn down and reopened for a new resolution.
    pub fn reopens(&self) -> usize {
        self.reopens.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Output buffers still held by the caller when the encoder stopped.
    pub fn leaked(&self) -> usize {
        self.leaked.load(Ordering::SeqCst)
    }

    /// Attempts to start the encoder while it was already running.
    pub fn conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }

    /// Length of the last region flushed through `flush_input`.
    pub fn last_flush_len(&self) -> usize {
        self.flushed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn output_held(&self) -> bool {
        self.output_held.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<(u32, u32, EncoderParams)> {
        *self.last_config.lock()
    }

    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }
}

struct EncoderConfig {
    width: u32,
    height: u32,
    input_len: usize,
    params: EncoderParams,
}

/// Encoder emitting structurally valid JPEG or H.264 Annex-B frames.
///
/// H.264 frames carry SPS + PPS + IDR slice every `i_period` frames and a
/// single non-IDR slice otherwise. Payload bytes never contain a start code.
pub struct SyntheticEncoder {
    kind: EncoderKind,
    config: Option<EncoderConfig>,
    last_resolution: Option<(u32, u32)>,
    frame_index: u64,
    output: Vec<u8>,
    output_held: bool,
    probe: Arc<EncoderProbe>,
}

impl SyntheticEncoder {
    const SPS: [u8; 6] = [0x67, 0x42, 0xC0, 0x1F, 0x8C, 0x8D];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    pub fn open(kind: EncoderKind) -> Self {
        Self {
            kind,
            config: None,
            last_resolution: None,
            frame_index: 0,
            output: Vec::new(),
            output_held: false,
            probe: Arc::new(EncoderProbe::default()),
        }
    }

    pub fn probe(&self) -> Arc<EncoderProbe> {
        self.probe.clone()
    }

    fn encode_h264(&mut self, raw: &[u8], params: &EncoderParams) {
        let idr = self.frame_index % u64::from(params.i_period()) == 0;
        self.output.clear();
        let step = if idr {
            self.output.extend_from_slice(&[0, 0, 0, 1]);
            self.output.extend_from_slice(&Self::SPS);
            self.output.extend_from_slice(&[0, 0, 0, 1]);
            self.output.extend_from_slice(&Self::PPS);
            self.output.extend_from_slice(&[0, 0, 0, 1, 0x65]);
            20
        } else {
            self.output.extend_from_slice(&[0, 0, 0, 1, 0x41]);
            80
        };
        self.output
            .extend(raw.iter().step_by(step).map(|b| b | 0x80));
    }

    fn encode_jpeg(&mut self, raw: &[u8], params: &EncoderParams) {
        let step = 4 + usize::from(100 - params.jpeg_quality()) / 4;
        self.output.clear();
        self.output.extend_from_slice(&[0xFF, 0xD8]);
        self.output.extend(raw.iter().step_by(step).map(|b| b & 0x7F));
        self.output.extend_from_slice(&[0xFF, 0xD9]);
    }
}

impl HardwareEncoder for SyntheticEncoder {
    fn kind(&self) -> EncoderKind {
        self.kind
    }

    fn start(
        &mut self,
        width: u32,
        height: u32,
        input: PixelFormat,
        params: &EncoderParams,
    ) -> Result<()> {
        let device = self.kind.device_name();
        if self.config.is_some() {
            self.probe.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(Error::device(device, "device busy"));
        }
        if self.probe.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(Error::device(device, "injected start failure"));
        }
        if input != self.kind.input_format() {
            return Err(Error::device(device, format!("input {input:?} not supported")));
        }
        let input_len = input
            .frame_len(width, height)
            .ok_or_else(|| Error::device(device, "compressed input"))?;

        if let Some(previous) = self.last_resolution
            && previous != (width, height)
        {
            tracing::debug!(?previous, width, height, "reopening encoder for new resolution");
            self.probe.reopens.fetch_add(1, Ordering::SeqCst);
        }
        self.last_resolution = Some((width, height));
        self.frame_index = 0;
        self.config = Some(EncoderConfig {
            width,
            height,
            input_len,
            params: *params,
        });

        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        self.probe.running.store(true, Ordering::SeqCst);
        *self.probe.last_config.lock() = Some((width, height, *params));
        Ok(())
    }

    fn encode(&mut self, raw: &[u8]) -> Result<usize> {
        let device = self.kind.device_name();
        let Some(config) = self.config.as_ref() else {
            return Err(Error::device(device, "not started"));
        };
        if self.output_held {
            return Err(Error::device(device, "output buffer not returned"));
        }
        if raw.len() != config.input_len {
            return Err(Error::device(
                device,
                format!(
                    "input of {} bytes, expected {} for {}x{}",
                    raw.len(),
                    config.input_len,
                    config.width,
                    config.height
                ),
            ));
        }
        let params = config.params;
        match self.kind {
            EncoderKind::H264 => self.encode_h264(raw, &params),
            EncoderKind::Jpeg => self.encode_jpeg(raw, &params),
        }
        self.frame_index += 1;
        self.output_held = true;
        self.probe.frames.fetch_add(1, Ordering::SeqCst);
        self.probe.output_held.store(true, Ordering::SeqCst);
        Ok(self.output.len())
    }

    fn output(&self) -> &[u8] {
        &self.output
    }

    fn release_output(&mut self) -> Result<()> {
        if !self.output_held {
            return Err(Error::device(self.kind.device_name(), "output buffer not held"));
        }
        self.output_held = false;
        self.probe.output_held.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        if self.config.take().is_none() {
            return;
        }
        if self.output_held {
            tracing::warn!(kind = ?self.kind, "encoder stopped with output buffer held");
            self.probe.leaked.fetch_add(1, Ordering::SeqCst);
            self.output_held = false;
            self.probe.output_held.store(false, Ordering::SeqCst);
        }
        self.output.clear();
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        self.probe.running.store(false, Ordering::SeqCst);
    }

    fn flush_input(&mut self, region: &[u8]) {
        self.probe.flushed.store(region.len(), Ordering::SeqCst);
    }
}

/// ISP that records every control it is asked to apply.
#[derive(Debug, Clone, Default)]
pub struct RecordingIsp {
    applied: Arc<Mutex<Vec<IspControl>>>,
}

impl RecordingIsp {
    pub fn applied(&self) -> Vec<IspControl> {
        self.applied.lock().clone()
    }
}

impl IspBackend for RecordingIsp {
    fn apply(&mut self, control: IspControl) -> Result<()> {
        self.applied.lock().push(control);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::H264Packetizer;

    #[test]
    fn camera_dequeue_enqueue_cycle() {
        let mut cam = SyntheticCamera::new(64, 32);
        let probe = cam.probe();
        assert_eq!(cam.configure(64, 32, PixelFormat::Uyvy).unwrap(), 2);

        let a = cam.dequeue().unwrap();
        let b = cam.dequeue().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.bytes_used, 64 * 32 * 2);
        assert!(cam.dequeue().is_err(), "pool exhausted");
        assert_eq!(probe.outstanding(), 2);

        cam.enqueue(a.id).unwrap();
        assert!(cam.enqueue(a.id).is_err(), "double enqueue");
        assert!(cam.buffer(a.id).is_err());
        assert_eq!(cam.buffer(b.id).unwrap()[7], SyntheticCamera::pattern_byte(7));

        cam.enqueue(b.id).unwrap();
        cam.stop();
        assert_eq!(probe.leaked(), 0);
        assert_eq!(probe.stops(), 1);
    }

    #[test]
    fn camera_rejects_non_native_and_busy() {
        let mut cam = SyntheticCamera::new(64, 32);
        assert!(cam.configure(32, 16, PixelFormat::Uyvy).is_err());
        cam.configure(64, 32, PixelFormat::Yuv420).unwrap();
        assert!(cam.configure(64, 32, PixelFormat::Yuv420).is_err());
        assert_eq!(cam.probe().conflicts(), 1);
    }

    #[test]
    fn camera_stop_is_idempotent_and_counts_leaks() {
        let mut cam = SyntheticCamera::new(16, 16);
        let probe = cam.probe();
        cam.stop();
        assert_eq!(probe.stops(), 0);

        cam.configure(16, 16, PixelFormat::Uyvy).unwrap();
        cam.dequeue().unwrap();
        cam.stop();
        cam.stop();
        assert_eq!(probe.leaked(), 1);
        assert_eq!(probe.outstanding(), 0);
        assert_eq!(probe.stops(), 1);
    }

    #[test]
    fn h264_output_follows_i_period() {
        let mut enc = SyntheticEncoder::open(EncoderKind::H264);
        let params = EncoderParams {
            i_period: Some(2),
            ..Default::default()
        };
        enc.start(32, 32, PixelFormat::Yuv420, &params).unwrap();
        let raw = vec![0u8; 32 * 32 * 3 / 2];

        let len = enc.encode(&raw).unwrap();
        let types: Vec<u8> = H264Packetizer::extract_nal_units(&enc.output()[..len])
            .iter()
            .map(|n| n[0] & 0x1f)
            .collect();
        assert_eq!(types, vec![7, 8, 5]);
        enc.release_output().unwrap();

        let len = enc.encode(&raw).unwrap();
        let types: Vec<u8> = H264Packetizer::extract_nal_units(&enc.output()[..len])
            .iter()
            .map(|n| n[0] & 0x1f)
            .collect();
        assert_eq!(types, vec![1]);
    }

    #[test]
    fn encoder_requires_output_release() {
        let mut enc = SyntheticEncoder::open(EncoderKind::Jpeg);
        enc.start(16, 16, PixelFormat::Uyvy, &EncoderParams::default())
            .unwrap();
        let raw = vec![1u8; 16 * 16 * 2];
        let len = enc.encode(&raw).unwrap();
        assert_eq!(&enc.output()[..2], &[0xFF, 0xD8]);
        assert_eq!(&enc.output()[len - 2..len], &[0xFF, 0xD9]);
        assert!(enc.encode(&raw).is_err());
        enc.release_output().unwrap();
        assert!(enc.release_output().is_err());
        enc.encode(&raw).unwrap();
    }

    #[test]
    fn encoder_rejects_wrong_input_format() {
        let mut enc = SyntheticEncoder::open(EncoderKind::H264);
        assert!(
            enc.start(16, 16, PixelFormat::Uyvy, &EncoderParams::default())
                .is_err()
        );
    }

    #[test]
    fn encoder_reopens_on_resolution_change() {
        let mut enc = SyntheticEncoder::open(EncoderKind::H264);
        let probe = enc.probe();
        let params = EncoderParams::default();
        enc.start(64, 64, PixelFormat::Yuv420, &params).unwrap();
        enc.stop();
        enc.start(64, 64, PixelFormat::Yuv420, &params).unwrap();
        enc.stop();
        assert_eq!(probe.reopens(), 0);
        enc.start(32, 32, PixelFormat::Yuv420, &params).unwrap();
        assert_eq!(probe.reopens(), 1);
    }

    #[test]
    fn encoder_stop_counts_held_output() {
        let mut enc = SyntheticEncoder::open(EncoderKind::H264);
        let probe = enc.probe();
        enc.start(16, 16, PixelFormat::Yuv420, &EncoderParams::default())
            .unwrap();
        enc.encode(&[0u8; 16 * 16 * 3 / 2]).unwrap();
        enc.stop();
        assert_eq!(probe.leaked(), 1);
        assert!(!probe.output_held());
    }
}
