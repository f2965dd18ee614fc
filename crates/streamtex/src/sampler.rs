//! Software reference sampler.
//!
//! Reproduces on the CPU what a GPU sampling pipeline observes when drawing a
//! full-viewport quad with the queue's texture transform: texture coordinates
//! at pixel centers, the transform matrix applied, bilinear filtering with
//! clamp-to-edge, and BT.601 limited-range conversion for planar YUV. This is
//! what makes the pixel-level behavior of the hand-off core testable without
//! a GPU driver.

use crate::frame::{BufferLayout, FrameBuffer, PixelFormat};

// BT.601 limited-range YUV to RGB.
const YUV_Y_SCALE: f32 = 1.164;
const YUV_V_TO_R: f32 = 1.596;
const YUV_V_TO_G: f32 = 0.813;
const YUV_U_TO_G: f32 = 0.391;
const YUV_U_TO_B: f32 = 2.018;

fn clamp_u8(v: f32) -> u8 {
    (v + 0.5).floor().clamp(0.0, 255.0) as u8
}

/// Bilinear sample of one 8-bit plane at normalized coordinates, with texel
/// centers at half-texel offsets and clamp-to-edge addressing.
fn sample_plane(
    data: &[u8],
    offset: usize,
    stride: usize,
    width: usize,
    height: usize,
    s: f32,
    t: f32,
) -> f32 {
    let u = s * width as f32 - 0.5;
    let v = t * height as f32 - 0.5;
    let x0 = u.floor();
    let y0 = v.floor();
    let fx = u - x0;
    let fy = v - y0;

    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    let x0c = x0.clamp(0.0, max_x) as usize;
    let x1c = (x0 + 1.0).clamp(0.0, max_x) as usize;
    let y0c = y0.clamp(0.0, max_y) as usize;
    let y1c = (y0 + 1.0).clamp(0.0, max_y) as usize;

    let texel = |x: usize, y: usize| data[offset + y * stride + x] as f32;
    let top = texel(x0c, y0c) * (1.0 - fx) + texel(x1c, y0c) * fx;
    let bottom = texel(x0c, y1c) * (1.0 - fx) + texel(x1c, y1c) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Bilinear sample of one RGBA channel from a packed buffer.
fn sample_packed_channel(
    data: &[u8],
    stride: usize,
    width: usize,
    height: usize,
    channel: usize,
    s: f32,
    t: f32,
) -> f32 {
    let u = s * width as f32 - 0.5;
    let v = t * height as f32 - 0.5;
    let x0 = u.floor();
    let y0 = v.floor();
    let fx = u - x0;
    let fy = v - y0;

    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    let x0c = x0.clamp(0.0, max_x) as usize;
    let x1c = (x0 + 1.0).clamp(0.0, max_x) as usize;
    let y0c = y0.clamp(0.0, max_y) as usize;
    let y1c = (y0 + 1.0).clamp(0.0, max_y) as usize;

    let texel = |x: usize, y: usize| data[(y * stride + x) * 4 + channel] as f32;
    let top = texel(x0c, y0c) * (1.0 - fx) + texel(x1c, y0c) * fx;
    let bottom = texel(x0c, y1c) * (1.0 - fx) + texel(x1c, y1c) * fx;
    top * (1.0 - fy) + bottom * fy
}

fn yuv_to_rgba(y: f32, u: f32, v: f32) -> [u8; 4] {
    let y = YUV_Y_SCALE * (y - 16.0);
    let u = u - 128.0;
    let v = v - 128.0;
    [
        clamp_u8(y + YUV_V_TO_R * v),
        clamp_u8(y - YUV_V_TO_G * v - YUV_U_TO_G * u),
        clamp_u8(y + YUV_U_TO_B * u),
        255,
    ]
}

/// Samples the buffer at transformed normalized coordinates `(s, t)`.
pub fn sample(buffer: &FrameBuffer, s: f32, t: f32) -> [u8; 4] {
    let data = buffer.bytes();
    let width = buffer.width() as usize;
    let height = buffer.height() as usize;
    match buffer.layout() {
        BufferLayout::Packed { stride, .. } => {
            let mut out = [0u8; 4];
            for (channel, value) in out.iter_mut().enumerate() {
                *value = clamp_u8(sample_packed_channel(
                    data, stride, width, height, channel, s, t,
                ));
            }
            out
        }
        BufferLayout::Planar {
            y_offset,
            y_stride,
            v_offset,
            v_stride,
            u_offset,
            u_stride,
            chroma_width,
            chroma_height,
            ..
        } => {
            // The planes are sampled at the same normalized coordinates; the
            // chroma planes just have fewer texels behind them.
            let y = sample_plane(data, y_offset, y_stride, width, height, s, t);
            let u = sample_plane(data, u_offset, u_stride, chroma_width, chroma_height, s, t);
            let v = sample_plane(data, v_offset, v_stride, chroma_width, chroma_height, s, t);
            yuv_to_rgba(y, u, v)
        }
    }
}

/// Renders one viewport pixel the way the GPU pipeline would.
///
/// The viewport origin is bottom-left. The pixel center is converted to
/// normalized quad coordinates, pushed through the column-major texture
/// transform, and sampled bilinearly from the buffer.
pub fn render_pixel(
    buffer: &FrameBuffer,
    matrix: &[f32; 16],
    viewport: (u32, u32),
    x: u32,
    y: u32,
) -> [u8; 4] {
    let s = (x as f32 + 0.5) / viewport.0 as f32;
    let t = (y as f32 + 0.5) / viewport.1 as f32;
    let ts = matrix[0] * s + matrix[4] * t + matrix[12];
    let tt = matrix[1] * s + matrix[5] * t + matrix[13];
    sample(buffer, ts, tt)
}
