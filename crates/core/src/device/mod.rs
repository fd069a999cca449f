//! Capture and encode device abstractions.
//!
//! The core never talks to a driver directly. A board integration supplies
//! a [`FrameSource`] (the raw camera) and one [`HardwareEncoder`] per codec
//! (a mem2mem JPEG or H.264 block). Both follow the V4L2 buffer model: the
//! device owns a fixed pool of buffers, the caller borrows one at a time by
//! index and must hand it back exactly once.
//!
//! [`synthetic`] provides in-memory implementations used by tests and the
//! command-line server.

pub mod synthetic;

use crate::error::Result;

/// Index of a buffer in a device's pool.
pub type BufferId = usize;

/// Hardware cache line size in bytes. DMA-visible regions are synchronized
/// in whole lines.
pub const CACHE_LINE_SIZE: usize = 64;

/// Round `len` up to a whole number of cache lines.
pub const fn cache_aligned_len(len: usize) -> usize {
    (len + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Pixel layouts moving between camera, cropper and encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed 4:2:2, 2 bytes per pixel (`U0 Y0 V0 Y1`).
    Uyvy,
    /// Planar 4:2:0 (I420): full-size Y plane, then quarter-size U and V.
    Yuv420,
    /// Baseline JPEG bitstream.
    Jpeg,
    /// H.264 Annex-B bitstream.
    H264,
}

impl PixelFormat {
    /// Size of one uncompressed frame, or `None` for compressed formats.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            Self::Uyvy => Some(pixels * 2),
            Self::Yuv420 => Some(pixels * 3 / 2),
            Self::Jpeg | Self::H264 => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Jpeg | Self::H264)
    }
}

/// Codec implemented by a [`HardwareEncoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Jpeg,
    H264,
}

impl EncoderKind {
    /// Raw layout the encoder block accepts as input.
    pub fn input_format(self) -> PixelFormat {
        match self {
            Self::Jpeg => PixelFormat::Uyvy,
            Self::H264 => PixelFormat::Yuv420,
        }
    }

    pub fn output_format(self) -> PixelFormat {
        match self {
            Self::Jpeg => PixelFormat::Jpeg,
            Self::H264 => PixelFormat::H264,
        }
    }

    pub(crate) fn device_name(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg encoder",
            Self::H264 => "h264 encoder",
        }
    }
}

/// Encoder tuning. Every field is optional; unset fields fall back to
/// [`EncoderParams::I_PERIOD_DEFAULT`] and friends.
///
/// The defaults make every H.264 frame an IDR frame, because a UVC host
/// has no way to request a keyframe on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderParams {
    /// Distance between IDR frames, in frames.
    pub i_period: Option<u32>,
    /// Target bitrate in bits per second.
    pub bitrate: Option<u32>,
    pub min_qp: Option<u8>,
    pub max_qp: Option<u8>,
    /// JPEG quality, 1..=100.
    pub jpeg_quality: Option<u8>,
}

impl EncoderParams {
    pub const I_PERIOD_DEFAULT: u32 = 1;
    pub const BITRATE_DEFAULT: u32 = 2_000_000;
    pub const MIN_QP_DEFAULT: u8 = 20;
    pub const MAX_QP_DEFAULT: u8 = 40;
    pub const JPEG_QUALITY_DEFAULT: u8 = 80;

    pub fn i_period(&self) -> u32 {
        self.i_period.unwrap_or(Self::I_PERIOD_DEFAULT).max(1)
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate.unwrap_or(Self::BITRATE_DEFAULT)
    }

    /// Quantizer bounds, swapped into order if given reversed.
    pub fn qp_range(&self) -> (u8, u8) {
        let min = self.min_qp.unwrap_or(Self::MIN_QP_DEFAULT);
        let max = self.max_qp.unwrap_or(Self::MAX_QP_DEFAULT);
        (min.min(max), min.max(max))
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
            .unwrap_or(Self::JPEG_QUALITY_DEFAULT)
            .clamp(1, 100)
    }
}

/// A buffer handed out by [`FrameSource::dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedBuffer {
    pub id: BufferId,
    pub bytes_used: usize,
}

/// Raw capture device running at one fixed native resolution.
///
/// Opening the device is the implementor's constructor. After
/// [`configure`](Self::configure) every successful [`dequeue`](Self::dequeue)
/// must be paired with exactly one [`enqueue`](Self::enqueue), and only once
/// the buffer content has been copied or consumed.
pub trait FrameSource: Send {
    /// Resolution the sensor delivers. It cannot change at runtime.
    fn native_resolution(&self) -> (u32, u32);

    /// Allocate the buffer pool and start streaming. Returns the pool size.
    fn configure(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<usize>;

    /// Block until a filled buffer is available.
    fn dequeue(&mut self) -> Result<CapturedBuffer>;

    /// Content of a buffer. Only valid between `dequeue` and `enqueue`.
    fn buffer(&self, id: BufferId) -> Result<&[u8]>;

    /// Return a buffer to the device's free pool.
    fn enqueue(&mut self, id: BufferId) -> Result<()>;

    /// Stop streaming and release the pool. Safe to call when never
    /// configured, or more than once.
    fn stop(&mut self);
}

/// Memory-to-memory encoder block (one raw frame in, one bitstream frame out).
///
/// A started encoder that is asked to [`start`](Self::start) at a different
/// resolution must tear itself down and reopen; the hardware rejects format
/// changes in place.
pub trait HardwareEncoder: Send {
    fn kind(&self) -> EncoderKind;

    fn start(
        &mut self,
        width: u32,
        height: u32,
        input: PixelFormat,
        params: &EncoderParams,
    ) -> Result<()>;

    /// Submit one raw frame and block until its encoded output is ready.
    ///
    /// The raw input slot is reclaimed before returning. The output
    /// buffer, readable through [`output`](Self::output), stays with the
    /// caller until [`release_output`](Self::release_output). Implementations
    /// invalidate the CPU cache over the output region before returning.
    fn encode(&mut self, raw: &[u8]) -> Result<usize>;

    /// Encoded bytes of the last [`encode`](Self::encode) call.
    fn output(&self) -> &[u8];

    /// Hand the output buffer back to the device.
    fn release_output(&mut self) -> Result<()>;

    /// Halt both queues and release buffer memory. Idempotent.
    fn stop(&mut self);

    /// Flush CPU writes in `region` so the device sees them. `region`
    /// length is a multiple of [`CACHE_LINE_SIZE`].
    fn flush_input(&mut self, _region: &[u8]) {}
}
