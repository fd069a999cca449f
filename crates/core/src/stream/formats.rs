//! Per-format frame tables offered to the USB host.
//!
//! UVC indexes formats and frames from 1 (`bFormatIndex`, `bFrameIndex`);
//! index 0 or past the end of a table means "no such frame".

use super::StreamFormat;
use crate::error::{Error, Result};

/// One `{width, height, max fps}` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
    pub max_fps: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32, max_fps: u32) -> Self {
        Self {
            width,
            height,
            max_fps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTable {
    raw: Vec<FrameSize>,
    mjpeg: Vec<FrameSize>,
    h264: Vec<FrameSize>,
}

impl FrameTable {
    /// Uncompressed frames saturate USB high-speed bulk bandwidth quickly.
    pub const RAW_MAX_FPS: u32 = 15;
    pub const ENCODED_MAX_FPS: u32 = 50;

    /// Sizes offered below native when they fit inside the sensor window.
    pub const CROP_SIZES: [(u32, u32); 4] = [(1920, 1080), (1280, 720), (640, 480), (320, 240)];

    pub fn new(raw: Vec<FrameSize>, mjpeg: Vec<FrameSize>, h264: Vec<FrameSize>) -> Self {
        Self { raw, mjpeg, h264 }
    }

    /// Native resolution first, then every smaller standard size that fits.
    pub fn for_native(width: u32, height: u32) -> Self {
        let sizes = |max_fps| {
            std::iter::once(FrameSize::new(width, height, max_fps))
                .chain(
                    Self::CROP_SIZES
                        .iter()
                        .filter(|&&(w, h)| w <= width && h <= height && (w, h) != (width, height))
                        .map(move |&(w, h)| FrameSize::new(w, h, max_fps)),
                )
                .collect::<Vec<_>>()
        };
        Self::new(
            sizes(Self::RAW_MAX_FPS),
            sizes(Self::ENCODED_MAX_FPS),
            sizes(Self::ENCODED_MAX_FPS),
        )
    }

    pub fn frames(&self, format: StreamFormat) -> &[FrameSize] {
        match format {
            StreamFormat::Raw => &self.raw,
            StreamFormat::Mjpeg => &self.mjpeg,
            StreamFormat::H264 => &self.h264,
        }
    }

    /// Resolve 1-based UVC indices.
    pub fn lookup(&self, format_index: u8, frame_index: u8) -> Option<(StreamFormat, FrameSize)> {
        let format = StreamFormat::from_format_index(format_index)?;
        let frame = self
            .frames(format)
            .get(usize::from(frame_index).checked_sub(1)?)?;
        Some((format, *frame))
    }

    /// Check a commit request against the table.
    pub fn validate(
        &self,
        format: StreamFormat,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<FrameSize> {
        self.frames(format)
            .iter()
            .find(|f| f.width == width && f.height == height)
            .filter(|f| (1..=f.max_fps).contains(&fps))
            .copied()
            .ok_or(Error::FormatRejected {
                format,
                width,
                height,
                fps,
            })
    }
}
