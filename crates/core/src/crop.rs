//! Center crop from the sensor's native resolution to a negotiated size.
//!
//! The crop window is centered. Offsets are snapped down to even values
//! where the layout requires it so that a chroma sample is never split:
//!
//! - Packed 4:2:2 (`UYVY`): one `U Y V Y` macro-pixel covers two pixels, so
//!   the horizontal offset is even. The vertical offset is not constrained.
//! - Planar 4:2:0: both offsets are even, and the chroma planes are cropped
//!   at half the luma offsets and size.
//!
//! Invalid geometry is a programming error and panics.

use crate::device::PixelFormat;

/// Memory layout understood by [`crop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropLayout {
    Packed422,
    Planar420,
}

impl CropLayout {
    /// Layout for a raw pixel format, `None` for compressed formats.
    pub fn for_format(format: PixelFormat) -> Option<Self> {
        match format {
            PixelFormat::Uyvy => Some(Self::Packed422),
            PixelFormat::Yuv420 => Some(Self::Planar420),
            PixelFormat::Jpeg | PixelFormat::H264 => None,
        }
    }

    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Packed422 => pixels * 2,
            Self::Planar420 => pixels * 3 / 2,
        }
    }

    /// Top-left corner of the centered crop window.
    pub fn offsets(self, src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> (u32, u32) {
        let x = ((src_w - dst_w) / 2) & !1;
        let y = (src_h - dst_h) / 2;
        match self {
            Self::Packed422 => (x, y),
            Self::Planar420 => (x, y & !1),
        }
    }
}

/// Crop `src` (`src_w` x `src_h`) into `dst` (`dst_w` x `dst_h`).
///
/// # Panics
///
/// If the destination is larger than the source, a buffer is too short,
/// or the geometry cannot be represented in `layout` (odd packed width,
/// odd planar dimensions).
pub fn crop(
    src: &[u8],
    src_w: u32,
    src_h: u32,
    dst: &mut [u8],
    dst_w: u32,
    dst_h: u32,
    layout: CropLayout,
) {
    assert!(
        dst_w <= src_w && dst_h <= src_h,
        "crop {dst_w}x{dst_h} larger than source {src_w}x{src_h}"
    );
    assert!(src.len() >= layout.frame_len(src_w, src_h), "source too short");
    assert!(dst.len() >= layout.frame_len(dst_w, dst_h), "destination too short");

    let (x_off, y_off) = layout.offsets(src_w, src_h, dst_w, dst_h);
    let (src_w, src_h, dst_w, dst_h) = (
        src_w as usize,
        src_h as usize,
        dst_w as usize,
        dst_h as usize,
    );
    let (x_off, y_off) = (x_off as usize, y_off as usize);

    match layout {
        CropLayout::Packed422 => {
            assert!(dst_w % 2 == 0, "packed crop width must be even");
            copy_plane(src, src_w * 2, dst, dst_w * 2, dst_h, x_off * 2, y_off);
        }
        CropLayout::Planar420 => {
            assert!(
                src_w % 2 == 0 && src_h % 2 == 0 && dst_w % 2 == 0 && dst_h % 2 == 0,
                "planar 4:2:0 dimensions must be even"
            );
            let (src_luma, src_chroma) = src.split_at(src_w * src_h);
            let (dst_luma, dst_chroma) = dst.split_at_mut(dst_w * dst_h);
            copy_plane(src_luma, src_w, dst_luma, dst_w, dst_h, x_off, y_off);

            let src_plane = (src_w / 2) * (src_h / 2);
            let dst_plane = (dst_w / 2) * (dst_h / 2);
            let (src_u, src_v) = src_chroma.split_at(src_plane);
            let (dst_u, dst_v) = dst_chroma.split_at_mut(dst_plane);
            for (s, d) in [(src_u, dst_u), (src_v, dst_v)] {
                copy_plane(s, src_w / 2, d, dst_w / 2, dst_h / 2, x_off / 2, y_off / 2);
            }
        }
    }
}

/// Copy a `row_bytes` x `rows` window starting at (`x_bytes`, `y`) out of
/// a plane whose rows are `src_stride` bytes long.
fn copy_plane(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    row_bytes: usize,
    rows: usize,
    x_bytes: usize,
    y: usize,
) {
    for (row, out) in dst.chunks_exact_mut(row_bytes).take(rows).enumerate() {
        let start = (y + row) * src_stride + x_bytes;
        out.copy_from_slice(&src[start..start + row_bytes]);
    }
}
