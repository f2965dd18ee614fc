//! Single-producer / single-consumer frame hand-off.
//!
//! `streamtex` moves pixel buffers from a producer (a decoder or renderer)
//! to a consumer (a texture sampler) without copies, using a small fixed set
//! of buffer slots. The producer dequeues a slot, fills it, and queues it;
//! the consumer acquires the latest queued frame together with a 4x4 texture
//! transform that maps normalized sampler coordinates into the frame's crop
//! region. Only the newest frame is retained, so a fast producer drops stale
//! frames instead of blocking.
//!
//! ```
//! use std::time::Duration;
//! use streamtex::{PixelFormat, SlotQueue};
//!
//! let queue = SlotQueue::new(3);
//! queue.set_buffer_geometry(64, 64, PixelFormat::Rgba8888)?;
//!
//! let mut buf = queue.dequeue()?;
//! buf.buffer_mut().bytes_mut().fill(0xff);
//! queue.queue(buf, Duration::from_millis(16))?;
//!
//! let frame = queue.acquire_latest()?;
//! assert_eq!(frame.buffer.width(), 64);
//! # Ok::<(), streamtex::HandoffError>(())
//! ```
//!
//! For lockstep producer/consumer alternation, register a
//! [`FrameCondition`] as the queue's frame-available listener and drive the
//! producer with a [`ProducerDriver`].

pub mod frame;
pub mod geometry;
pub mod interlock;
pub mod sampler;
pub mod slot_queue;

pub use frame::{BufferAllocator, BufferLayout, FrameBuffer, HeapAllocator, PixelFormat};
pub use geometry::{transform_for, CropRect, GeometryState};
pub use interlock::{FrameCondition, ProducerDriver};
pub use slot_queue::{
    AcquiredFrame, DequeuedBuffer, FrameAvailableListener, HandoffError, SlotQueue, SlotState,
    DEFAULT_SLOT_COUNT, MAX_SLOT_COUNT, MIN_SLOT_COUNT,
};
