//! Frame buffer handles, pixel formats, and plane layout rules.
//!
//! A [`FrameBuffer`] is one contiguous allocation plus the geometry needed to
//! interpret it. The queue owns buffers while they are in flight; the producer
//! gets exclusive access while filling (plain `&mut` access stands in for the
//! platform allocator's lock/unlock pair), and the consumer holds a shared
//! reference while the frame is bound as the current texture source.

/// Pixel formats honored by the hand-off core.
///
/// `Yv12` is the planar luma/chroma format used for software-decoded video:
/// a full-resolution Y plane followed by quarter-resolution V then U planes.
/// `Rgba8888` is the packed 4-channel format used for GPU-rendered frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0 with V before U and 16-byte aligned chroma strides.
    Yv12,
    /// Packed 32-bit RGBA.
    Rgba8888,
}

impl PixelFormat {
    /// Returns the number of planes for this format.
    pub fn num_planes(&self) -> usize {
        match self {
            PixelFormat::Yv12 => 3,
            PixelFormat::Rgba8888 => 1,
        }
    }

    /// Returns true if this format stores channels in separate planes.
    pub fn is_planar(&self) -> bool {
        matches!(self, PixelFormat::Yv12)
    }

    /// Inset, in texels, applied at crop edges to keep bilinear filtering
    /// from pulling in samples outside the crop rectangle.
    ///
    /// Packed formats need half a texel. Formats with 2x2-subsampled chroma
    /// need a whole texel, because a half-texel step in the luma plane is only
    /// a quarter-texel step in the chroma planes.
    pub fn crop_inset(&self) -> f32 {
        match self {
            PixelFormat::Yv12 => 1.0,
            PixelFormat::Rgba8888 => 0.5,
        }
    }
}

/// Derived plane layout for a buffer.
///
/// The YV12 rules match the platform allocator exactly: the Y plane uses the
/// buffer row stride, the V plane follows it, then the U plane; chroma strides
/// are half the luma stride rounded up to 16 bytes, and chroma planes are half
/// height. Getting these wrong shifts every sampled chroma value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLayout {
    /// Single interleaved plane; `stride` is in pixels, 4 bytes each.
    Packed { stride: usize, size: usize },
    /// Y plane, then V, then U.
    Planar {
        y_offset: usize,
        y_stride: usize,
        v_offset: usize,
        v_stride: usize,
        u_offset: usize,
        u_stride: usize,
        chroma_width: usize,
        chroma_height: usize,
        size: usize,
    },
}

impl BufferLayout {
    /// Computes the layout for the given geometry.
    pub fn new(width: u32, height: u32, stride: u32, format: PixelFormat) -> Self {
        let (width, height, stride) = (width as usize, height as usize, stride as usize);
        match format {
            PixelFormat::Rgba8888 => BufferLayout::Packed {
                stride,
                size: stride * height * 4,
            },
            PixelFormat::Yv12 => {
                let y_stride = stride;
                let chroma_stride = (y_stride / 2 + 0xf) & !0xf;
                let chroma_height = height / 2;
                let v_offset = y_stride * height;
                let u_offset = v_offset + chroma_stride * chroma_height;
                BufferLayout::Planar {
                    y_offset: 0,
                    y_stride,
                    v_offset,
                    v_stride: chroma_stride,
                    u_offset,
                    u_stride: chroma_stride,
                    chroma_width: width / 2,
                    chroma_height,
                    size: u_offset + chroma_stride * chroma_height,
                }
            }
        }
    }

    /// Total allocation size in bytes.
    pub fn size(&self) -> usize {
        match *self {
            BufferLayout::Packed { size, .. } => size,
            BufferLayout::Planar { size, .. } => size,
        }
    }
}

/// A pixel buffer plus the geometry needed to interpret it.
///
/// Immutable once queued; mutated only by the producer between dequeue and
/// queue, through [`FrameBuffer::bytes_mut`].
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl FrameBuffer {
    /// Creates a zero-filled buffer with the given geometry.
    pub fn new(width: u32, height: u32, stride: u32, format: PixelFormat) -> Self {
        let layout = BufferLayout::new(width, height, stride, format);
        Self {
            width,
            height,
            stride,
            format,
            data: vec![0; layout.size()],
        }
    }

    /// Logical width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Logical height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in pixels; may exceed `width` due to allocator padding.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Pixel format.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Plane layout for this buffer.
    pub fn layout(&self) -> BufferLayout {
        BufferLayout::new(self.width, self.height, self.stride, self.format)
    }

    /// Read access to the backing bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Write access to the backing bytes. Exclusive by construction: only the
    /// producer holds a `&mut FrameBuffer`, between dequeue and queue.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Returns true if this buffer can be reused for the requested geometry
    /// without reallocating.
    pub fn matches(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}

/// Seam for the platform buffer allocator.
///
/// The queue calls this during dequeue when a free slot has no backing buffer
/// or its buffer no longer matches the requested geometry. The core never
/// inspects pixel content itself.
pub trait BufferAllocator: Send + Sync {
    /// Allocates a buffer for the requested geometry, choosing the row stride.
    fn allocate(&self, width: u32, height: u32, format: PixelFormat) -> FrameBuffer;
}

/// Heap-backed allocator used when no platform allocator is supplied.
///
/// Pads row strides to a multiple of 16 pixels, mirroring the common gralloc
/// alignment so stride-dependent code paths are exercised.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, width: u32, height: u32, format: PixelFormat) -> FrameBuffer {
        let stride = (width + 0xf) & !0xf;
        tracing::trace!(width, height, stride, ?format, "allocating frame buffer");
        FrameBuffer::new(width, height, stride, format)
    }
}
