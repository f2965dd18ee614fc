//! Crop bookkeeping and the texture-coordinate transform.
//!
//! The transform maps normalized sampler coordinates into the crop-adjusted
//! region of the physical buffer. It is a pure function of the buffer
//! dimensions, the crop rectangle, and the per-format bilinear inset, so it
//! stays unit-testable without any GPU context.

use crate::frame::PixelFormat;

/// A crop rectangle in buffer pixel coordinates.
///
/// `left`/`top` are inclusive, `right`/`bottom` exclusive. A rectangle is
/// valid when `left < right` and `top < bottom` and it lies within the buffer
/// bounds it is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl CropRect {
    /// Creates a crop rectangle.
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Width of the rectangle; zero or negative when degenerate.
    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    /// Height of the rectangle; zero or negative when degenerate.
    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Returns true if the rectangle encloses no pixels.
    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    /// Returns true if the rectangle is non-degenerate and within a
    /// `width` x `height` buffer.
    pub fn is_valid_within(&self, width: u32, height: u32) -> bool {
        !self.is_empty()
            && self.left >= 0
            && self.top >= 0
            && self.right <= width as i32
            && self.bottom <= height as i32
    }

    /// Intersects the rectangle with a `width` x `height` buffer, returning
    /// `None` if nothing remains. Used when a queued buffer is smaller than
    /// the geometry the crop was validated against.
    pub fn clamped_to(&self, width: u32, height: u32) -> Option<CropRect> {
        let clamped = CropRect {
            left: self.left.max(0),
            top: self.top.max(0),
            right: self.right.min(width as i32),
            bottom: self.bottom.min(height as i32),
        };
        if clamped.is_empty() {
            None
        } else {
            Some(clamped)
        }
    }

    /// Returns true if the rectangle covers the whole buffer, in which case
    /// it is equivalent to no crop at all.
    pub fn covers(&self, width: u32, height: u32) -> bool {
        self.left <= 0 && self.top <= 0 && self.right >= width as i32 && self.bottom >= height as i32
    }
}

/// Default buffer geometry plus the crop requested for upcoming frames.
///
/// The crop set here is stamped onto frames at queue time; it never applies
/// retroactively to frames already queued or acquired.
#[derive(Debug, Clone)]
pub struct GeometryState {
    default_width: u32,
    default_height: u32,
    format: PixelFormat,
    crop: Option<CropRect>,
}

impl GeometryState {
    /// Creates geometry state with a 1x1 RGBA default, matching a producer
    /// that has not yet declared its buffer geometry.
    pub fn new() -> Self {
        Self {
            default_width: 1,
            default_height: 1,
            format: PixelFormat::Rgba8888,
            crop: None,
        }
    }

    /// Sets the size and format used for buffers the producer dequeues.
    pub fn set_buffer_geometry(&mut self, width: u32, height: u32, format: PixelFormat) {
        self.default_width = width;
        self.default_height = height;
        self.format = format;
    }

    /// Stores the crop applied to subsequently queued frames. Callers
    /// validate against the current default size first.
    pub fn set_crop(&mut self, crop: Option<CropRect>) {
        self.crop = crop;
    }

    /// The crop for upcoming frames, if any.
    pub fn crop(&self) -> Option<CropRect> {
        self.crop
    }

    /// Default buffer size.
    pub fn default_size(&self) -> (u32, u32) {
        (self.default_width, self.default_height)
    }

    /// Default buffer format.
    pub fn format(&self) -> PixelFormat {
        self.format
    }
}

impl Default for GeometryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Column-major 4x4 multiply: `a * b`, so `b` applies first.
fn mtx_mul(a: &[f32; 16], b: &[f32; 16]) -> [f32; 16] {
    let mut out = [0.0; 16];
    for col in 0..4 {
        for row in 0..4 {
            let mut sum = 0.0;
            for k in 0..4 {
                sum += a[k * 4 + row] * b[col * 4 + k];
            }
            out[col * 4 + row] = sum;
        }
    }
    out
}

#[rustfmt::skip]
const MTX_IDENTITY: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 1.0, 0.0,
    0.0, 0.0, 0.0, 1.0,
];

// Buffers store row 0 at the top; sampler coordinates put t=0 at the bottom.
#[rustfmt::skip]
const MTX_FLIP_V: [f32; 16] = [
    1.0,  0.0, 0.0, 0.0,
    0.0, -1.0, 0.0, 0.0,
    0.0,  0.0, 1.0, 0.0,
    0.0,  1.0, 0.0, 1.0,
];

/// Computes the column-major texture transform for a buffer and crop.
///
/// With no crop (or a crop covering the full buffer) the result is the
/// vertical flip alone. Otherwise the crop is normalized to [0,1]^2 and each
/// axis that does not span the buffer is inset by `inset` texels on both
/// sides, so bilinear filtering at the crop edge cannot blend in texels from
/// outside the rectangle. The inset is format-dependent: see
/// [`PixelFormat::crop_inset`].
pub fn transform_for(
    buffer_width: u32,
    buffer_height: u32,
    crop: Option<CropRect>,
    inset: f32,
) -> [f32; 16] {
    let bw = buffer_width as f32;
    let bh = buffer_height as f32;

    let crop_mtx = match crop {
        Some(c) if !c.is_empty() && !c.covers(buffer_width, buffer_height) => {
            let mut tx = c.left as f32 / bw;
            let mut ty = (bh - c.bottom as f32) / bh;
            let mut sx = c.width() as f32 / bw;
            let mut sy = c.height() as f32 / bh;

            // Only inset axes the crop does not span entirely; a full-span
            // axis clamps at the buffer edge, which is already safe.
            if c.left > 0 || c.right < buffer_width as i32 {
                tx = (c.left as f32 + inset) / bw;
                sx = (c.width() as f32 - 2.0 * inset) / bw;
            }
            if c.top > 0 || c.bottom < buffer_height as i32 {
                ty = (bh - c.bottom as f32 + inset) / bh;
                sy = (c.height() as f32 - 2.0 * inset) / bh;
            }

            #[rustfmt::skip]
            let m = [
                sx,  0.0, 0.0, 0.0,
                0.0, sy,  0.0, 0.0,
                0.0, 0.0, 1.0, 0.0,
                tx,  ty,  0.0, 1.0,
            ];
            m
        }
        _ => MTX_IDENTITY,
    };

    mtx_mul(&MTX_FLIP_V, &crop_mtx)
}
