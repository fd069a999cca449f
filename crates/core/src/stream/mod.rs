//! USB-facing stream pipeline.
//!
//! The UVC layer talks to the camera through [`UvcStreamHandler`], four
//! callbacks that map 1:1 onto [`StreamOrchestrator`]'s commit, produce,
//! release and stop. The handler hands out [`Frame`]s borrowing pipeline
//! memory; the host-side transfer must finish and call
//! [`UvcStreamHandler::on_release_frame`] before the next frame is requested.

pub mod formats;
pub mod orchestrator;

use std::time::Duration;

use crate::device::{BufferId, EncoderKind, PixelFormat};
use crate::error::Result;

pub use formats::{FrameSize, FrameTable};
pub use orchestrator::{OrchestratorConfig, StreamCounters, StreamOrchestrator, StreamState};

/// Formats offered to the USB host, in UVC `bFormatIndex` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamFormat {
    /// Uncompressed packed 4:2:2.
    Raw,
    Mjpeg,
    H264,
}

impl StreamFormat {
    pub const ALL: [StreamFormat; 3] = [Self::Raw, Self::Mjpeg, Self::H264];

    /// 1-based UVC format index.
    pub fn format_index(self) -> u8 {
        match self {
            Self::Raw => 1,
            Self::Mjpeg => 2,
            Self::H264 => 3,
        }
    }

    pub fn from_format_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(Self::Raw),
            2 => Some(Self::Mjpeg),
            3 => Some(Self::H264),
            _ => None,
        }
    }

    /// Layout the camera must capture in for this stream.
    pub fn capture_format(self) -> PixelFormat {
        match self {
            Self::Raw | Self::Mjpeg => PixelFormat::Uyvy,
            Self::H264 => PixelFormat::Yuv420,
        }
    }

    /// Encoder the pipeline runs, if any.
    pub fn encoder(self) -> Option<EncoderKind> {
        match self {
            Self::Raw => None,
            Self::Mjpeg => Some(EncoderKind::Jpeg),
            Self::H264 => Some(EncoderKind::H264),
        }
    }

    /// Layout of delivered frames.
    pub fn output_format(self) -> PixelFormat {
        match self.encoder() {
            Some(kind) => kind.output_format(),
            None => self.capture_format(),
        }
    }
}

/// Which buffer a delivered frame lives in. Decides the release path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// A camera buffer held across the delivery (raw, native size).
    Camera(BufferId),
    /// The crop staging buffer (raw, cropped).
    Staging,
    /// The active encoder's output buffer.
    Encoder,
}

/// Metadata of a delivered frame, returned to the orchestrator on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef {
    pub sequence: u64,
    pub format: StreamFormat,
    pub width: u32,
    pub height: u32,
    pub len: usize,
    /// Monotonic capture time since the orchestrator was created.
    pub timestamp: Duration,
    pub origin: FrameOrigin,
}

/// A delivered frame and its bytes.
#[derive(Debug)]
pub struct Frame<'a> {
    pub info: FrameRef,
    pub data: &'a [u8],
}

/// Callbacks the USB video layer drives.
pub trait UvcStreamHandler {
    /// Host committed a format (VS_COMMIT_CONTROL).
    fn on_commit(&mut self, format: StreamFormat, width: u32, height: u32, fps: u32)
    -> Result<()>;

    /// Next frame for the host, or `None` if none could be produced.
    fn on_get_frame(&mut self) -> Option<Frame<'_>>;

    /// The host transfer of `frame` completed.
    fn on_release_frame(&mut self, frame: FrameRef);

    /// Host stopped streaming.
    fn on_stop(&mut self);
}
