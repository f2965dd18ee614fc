//! Buffer slot lifecycle and the producer/consumer hand-off protocol.
//!
//! A [`SlotQueue`] owns a small fixed array of buffer slots cycling through
//! Free, Dequeued, Queued, and Acquired. The producer side dequeues a slot,
//! fills its buffer, and queues it back; the consumer side acquires the most
//! recently queued frame and samples from it until the next acquire. Only the
//! newest queued frame is retained, so a producer running faster than the
//! consumer drops stale frames instead of stalling.
//!
//! Handles are `Clone` and share one queue, so the producer and consumer can
//! live on different threads without any channel between them.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::frame::{BufferAllocator, FrameBuffer, HeapAllocator, PixelFormat};
use crate::geometry::{transform_for, CropRect, GeometryState};

/// Number of buffer slots when none is given at construction.
pub const DEFAULT_SLOT_COUNT: usize = 3;

/// Smallest supported slot count: one in flight plus one held by the consumer.
pub const MIN_SLOT_COUNT: usize = 2;

/// Largest supported slot count.
pub const MAX_SLOT_COUNT: usize = 4;

/// Errors returned by queue operations. Every failure leaves the queue state
/// unchanged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandoffError {
    /// `try_dequeue` found no Free slot.
    #[error("no free buffer slot available")]
    NoFreeSlot,
    /// `acquire_latest` found nothing queued since the last acquire.
    #[error("no frame has been queued since the last acquire")]
    NoFrameAvailable,
    /// The crop rectangle is degenerate or exceeds the buffer bounds.
    #[error("crop rectangle {crop:?} is invalid for {width}x{height} buffers")]
    InvalidCrop {
        crop: CropRect,
        width: u32,
        height: u32,
    },
    /// A producer operation was called from inside the frame-available
    /// listener, which would deadlock or recurse.
    #[error("queue operation called from inside the frame-available listener")]
    ReentrantNotifier,
    /// A second dequeue was attempted while a buffer is already out.
    #[error("a buffer is already dequeued")]
    AlreadyDequeued,
    /// The queue has been abandoned by the consumer.
    #[error("buffer queue is abandoned")]
    Abandoned,
}

/// Lifecycle state of one buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the queue, available to the producer.
    Free,
    /// Handed to the producer for filling.
    Dequeued,
    /// Filled and waiting for the consumer.
    Queued,
    /// Held by the consumer as the current texture source.
    Acquired,
}

/// Observer invoked synchronously on the producer's stack each time a frame
/// is queued.
pub trait FrameAvailableListener: Send + Sync {
    fn on_frame_available(&self);
}

struct BufferSlot {
    buffer: Option<Arc<FrameBuffer>>,
    state: SlotState,
    crop: Option<CropRect>,
    timestamp: Duration,
}

impl BufferSlot {
    fn empty() -> Self {
        Self {
            buffer: None,
            state: SlotState::Free,
            crop: None,
            timestamp: Duration::ZERO,
        }
    }
}

struct QueueState {
    slots: Vec<BufferSlot>,
    geometry: GeometryState,
    current_matrix: [f32; 16],
    abandoned: bool,
}

impl QueueState {
    fn find(&self, state: SlotState) -> Option<usize> {
        self.slots.iter().position(|s| s.state == state)
    }
}

struct Inner {
    state: Mutex<QueueState>,
    slot_freed: Condvar,
    listener: Mutex<Option<Arc<dyn FrameAvailableListener>>>,
    // Thread currently inside the listener callback, if any. Producer
    // operations from that thread are rejected rather than deadlocked.
    notifying: Mutex<Option<ThreadId>>,
    allocator: Box<dyn BufferAllocator>,
}

impl Inner {
    fn in_listener(&self) -> bool {
        *self.notifying.lock() == Some(thread::current().id())
    }

    fn notify_listener(&self) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            *self.notifying.lock() = Some(thread::current().id());
            // Reset even if the callback panics, so a poisoned marker cannot
            // wedge the producer thread forever.
            struct Reset<'a>(&'a Mutex<Option<ThreadId>>);
            impl Drop for Reset<'_> {
                fn drop(&mut self) {
                    *self.0.lock() = None;
                }
            }
            let _reset = Reset(&self.notifying);
            listener.on_frame_available();
        }
    }
}

/// A buffer checked out by the producer.
///
/// Holds exclusive write access to the underlying [`FrameBuffer`] until it is
/// passed back through [`SlotQueue::queue`] or [`SlotQueue::cancel`]. Dropping
/// it without queueing cancels implicitly, so an early return on the producer
/// side cannot leak the slot.
pub struct DequeuedBuffer {
    inner: Arc<Inner>,
    slot: usize,
    buffer: Option<FrameBuffer>,
}

impl DequeuedBuffer {
    /// Index of the slot this buffer came from.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Read access to the buffer.
    pub fn buffer(&self) -> &FrameBuffer {
        self.buffer.as_ref().unwrap()
    }

    /// Write access for filling the frame.
    pub fn buffer_mut(&mut self) -> &mut FrameBuffer {
        self.buffer.as_mut().unwrap()
    }
}

impl fmt::Debug for DequeuedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DequeuedBuffer")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl Drop for DequeuedBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let mut state = self.inner.state.lock();
            let slot = &mut state.slots[self.slot];
            if slot.state == SlotState::Dequeued {
                trace!(slot = self.slot, "cancelling dequeued buffer");
                slot.buffer = Some(Arc::new(buffer));
                slot.state = SlotState::Free;
                self.inner.slot_freed.notify_all();
            }
        }
    }
}

/// A frame held by the consumer after [`SlotQueue::acquire_latest`].
///
/// The buffer stays bound to its slot; when the consumer acquires the next
/// frame the slot is recycled, but this handle keeps the pixel data alive
/// through its `Arc`.
#[derive(Clone)]
pub struct AcquiredFrame {
    /// The pixel data for this frame.
    pub buffer: Arc<FrameBuffer>,
    /// Crop active when the frame was queued, clamped to the buffer bounds.
    pub crop: Option<CropRect>,
    /// Presentation timestamp supplied at queue time.
    pub timestamp: Duration,
    /// Column-major texture transform for this frame.
    pub matrix: [f32; 16],
}

impl fmt::Debug for AcquiredFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredFrame")
            .field("crop", &self.crop)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// Shared handle to the buffer slot queue.
#[derive(Clone)]
pub struct SlotQueue {
    inner: Arc<Inner>,
}

impl SlotQueue {
    /// Creates a queue with `capacity` slots backed by the heap allocator.
    ///
    /// `capacity` is clamped to [`MIN_SLOT_COUNT`]..=[`MAX_SLOT_COUNT`].
    pub fn new(capacity: usize) -> Self {
        Self::with_allocator(capacity, Box::new(HeapAllocator))
    }

    /// Creates a queue with a caller-supplied buffer allocator.
    pub fn with_allocator(capacity: usize, allocator: Box<dyn BufferAllocator>) -> Self {
        let capacity = capacity.clamp(MIN_SLOT_COUNT, MAX_SLOT_COUNT);
        let slots = (0..capacity).map(|_| BufferSlot::empty()).collect();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    slots,
                    geometry: GeometryState::new(),
                    current_matrix: transform_for(1, 1, None, 0.0),
                    abandoned: false,
                }),
                slot_freed: Condvar::new(),
                listener: Mutex::new(None),
                notifying: Mutex::new(None),
                allocator,
            }),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    /// Registers (or clears) the frame-available listener.
    pub fn set_frame_available_listener(&self, listener: Option<Arc<dyn FrameAvailableListener>>) {
        *self.inner.listener.lock() = listener;
    }

    /// Sets the geometry used for buffers handed out by subsequent dequeues.
    /// Free slots whose buffers no longer match are reallocated lazily.
    pub fn set_buffer_geometry(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<(), HandoffError> {
        let mut state = self.inner.state.lock();
        if state.abandoned {
            return Err(HandoffError::Abandoned);
        }
        trace!(width, height, ?format, "buffer geometry updated");
        state.geometry.set_buffer_geometry(width, height, format);
        Ok(())
    }

    /// Sets the crop stamped onto frames queued after this call. `None`
    /// clears the crop. A rejected crop leaves the previous one active.
    pub fn set_crop(&self, crop: Option<CropRect>) -> Result<(), HandoffError> {
        let mut state = self.inner.state.lock();
        if state.abandoned {
            return Err(HandoffError::Abandoned);
        }
        if let Some(c) = crop {
            let (width, height) = state.geometry.default_size();
            if !c.is_valid_within(width, height) {
                warn!(?c, width, height, "rejecting invalid crop");
                return Err(HandoffError::InvalidCrop {
                    crop: c,
                    width,
                    height,
                });
            }
        }
        state.geometry.set_crop(crop);
        Ok(())
    }

    /// Crop currently stamped onto queued frames.
    pub fn crop(&self) -> Option<CropRect> {
        self.inner.state.lock().geometry.crop()
    }

    /// Default buffer size handed out by dequeue.
    pub fn default_size(&self) -> (u32, u32) {
        self.inner.state.lock().geometry.default_size()
    }

    /// Checks out a buffer for filling, blocking until a slot is Free.
    ///
    /// Wakes with `Abandoned` if the consumer tears the queue down while the
    /// producer is parked here.
    pub fn dequeue(&self) -> Result<DequeuedBuffer, HandoffError> {
        if self.inner.in_listener() {
            return Err(HandoffError::ReentrantNotifier);
        }
        let mut state = self.inner.state.lock();
        loop {
            if state.abandoned {
                return Err(HandoffError::Abandoned);
            }
            if state.find(SlotState::Dequeued).is_some() {
                return Err(HandoffError::AlreadyDequeued);
            }
            if state.find(SlotState::Free).is_some() {
                break;
            }
            trace!("producer waiting for a free slot");
            self.inner.slot_freed.wait(&mut state);
        }
        Ok(self.take_free_slot(&mut state))
    }

    /// Non-blocking dequeue; fails with `NoFreeSlot` when every slot is in
    /// flight.
    pub fn try_dequeue(&self) -> Result<DequeuedBuffer, HandoffError> {
        if self.inner.in_listener() {
            return Err(HandoffError::ReentrantNotifier);
        }
        let mut state = self.inner.state.lock();
        if state.abandoned {
            return Err(HandoffError::Abandoned);
        }
        if state.find(SlotState::Dequeued).is_some() {
            return Err(HandoffError::AlreadyDequeued);
        }
        if state.find(SlotState::Free).is_none() {
            return Err(HandoffError::NoFreeSlot);
        }
        Ok(self.take_free_slot(&mut state))
    }

    fn take_free_slot(&self, state: &mut QueueState) -> DequeuedBuffer {
        let (width, height) = state.geometry.default_size();
        let format = state.geometry.format();

        // Prefer a Free slot whose buffer already matches the requested
        // geometry so steady-state producers never reallocate.
        let index = state
            .slots
            .iter()
            .position(|s| {
                s.state == SlotState::Free
                    && s.buffer
                        .as_ref()
                        .is_some_and(|b| b.matches(width, height, format))
            })
            .or_else(|| state.find(SlotState::Free))
            .expect("caller checked for a free slot");

        let slot = &mut state.slots[index];
        let buffer = match slot.buffer.take() {
            // The consumer may still hold an Arc to a recycled buffer; only
            // reuse the allocation when we are the sole owner.
            Some(arc) => match Arc::try_unwrap(arc) {
                Ok(buffer) if buffer.matches(width, height, format) => buffer,
                Ok(_) | Err(_) => self.inner.allocator.allocate(width, height, format),
            },
            None => self.inner.allocator.allocate(width, height, format),
        };
        slot.state = SlotState::Dequeued;
        trace!(slot = index, width, height, "buffer dequeued");
        DequeuedBuffer {
            inner: Arc::clone(&self.inner),
            slot: index,
            buffer: Some(buffer),
        }
    }

    /// Hands a filled buffer to the consumer side.
    ///
    /// Stamps the current crop and the given timestamp onto the slot, drops
    /// any older un-acquired queued frame, and invokes the frame-available
    /// listener synchronously before returning. The listener runs with the
    /// queue unlocked, so the consumer may acquire from inside it.
    pub fn queue(
        &self,
        mut dequeued: DequeuedBuffer,
        timestamp: Duration,
    ) -> Result<(), HandoffError> {
        if self.inner.in_listener() {
            return Err(HandoffError::ReentrantNotifier);
        }
        let index = dequeued.slot;
        {
            let mut state = self.inner.state.lock();
            if state.abandoned {
                // The guard's drop runs after this lock is released and
                // returns the slot to Free with its buffer intact.
                return Err(HandoffError::Abandoned);
            }
            let buffer = dequeued.buffer.take().expect("buffer present until queue");

            // Latest-wins: demote a stale queued frame before publishing.
            if let Some(old) = state.find(SlotState::Queued) {
                debug!(slot = old, "dropping unconsumed frame");
                state.slots[old].state = SlotState::Free;
                self.inner.slot_freed.notify_all();
            }

            let crop = state.geometry.crop();
            let slot = &mut state.slots[index];
            slot.buffer = Some(Arc::new(buffer));
            slot.state = SlotState::Queued;
            slot.crop = crop;
            slot.timestamp = timestamp;
            trace!(slot = index, ?timestamp, "frame queued");
        }
        self.inner.notify_listener();
        Ok(())
    }

    /// Returns a dequeued buffer to Free without publishing it.
    pub fn cancel(&self, dequeued: DequeuedBuffer) {
        // Drop does the work; named for call-site clarity.
        drop(dequeued);
    }

    /// Claims the most recently queued frame as the current texture source.
    ///
    /// Recomputes the transform matrix from the frame's crop, releases the
    /// previously acquired slot back to the producer, and returns a handle
    /// that keeps the pixel data alive. With nothing queued since the last
    /// acquire this fails with `NoFrameAvailable` and changes nothing.
    pub fn acquire_latest(&self) -> Result<AcquiredFrame, HandoffError> {
        let mut state = self.inner.state.lock();
        if state.abandoned {
            return Err(HandoffError::Abandoned);
        }
        let index = state
            .find(SlotState::Queued)
            .ok_or(HandoffError::NoFrameAvailable)?;

        if let Some(prev) = state.find(SlotState::Acquired) {
            state.slots[prev].state = SlotState::Free;
            self.inner.slot_freed.notify_all();
        }

        let slot = &mut state.slots[index];
        slot.state = SlotState::Acquired;
        let buffer = Arc::clone(slot.buffer.as_ref().expect("queued slot has a buffer"));
        let timestamp = slot.timestamp;
        // The crop was validated against the geometry at set_crop time, which
        // may differ from this buffer's actual size.
        let crop = slot
            .crop
            .and_then(|c| c.clamped_to(buffer.width(), buffer.height()));
        let matrix = transform_for(
            buffer.width(),
            buffer.height(),
            crop,
            buffer.format().crop_inset(),
        );
        state.current_matrix = matrix;
        trace!(slot = index, ?timestamp, "frame acquired");

        Ok(AcquiredFrame {
            buffer,
            crop,
            timestamp,
            matrix,
        })
    }

    /// Transform matrix from the most recent acquire. Before any acquire this
    /// is the plain vertical flip.
    pub fn current_transform_matrix(&self) -> [f32; 16] {
        self.inner.state.lock().current_matrix
    }

    /// Marks the queue dead and wakes any blocked producer. All subsequent
    /// operations fail with `Abandoned`.
    pub fn abandon(&self) {
        let mut state = self.inner.state.lock();
        if !state.abandoned {
            debug!("queue abandoned");
            state.abandoned = true;
            self.inner.slot_freed.notify_all();
        }
    }

    /// Returns true once `abandon` has been called.
    pub fn is_abandoned(&self) -> bool {
        self.inner.state.lock().abandoned
    }

    #[cfg(test)]
    fn slot_states(&self) -> Vec<SlotState> {
        self.inner.state.lock().slots.iter().map(|s| s.state).collect()
    }
}

impl fmt::Debug for SlotQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SlotQueue")
            .field("slots", &state.slots.len())
            .field("abandoned", &state.abandoned)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue_64x66_yv12() -> SlotQueue {
        let q = SlotQueue::new(DEFAULT_SLOT_COUNT);
        q.set_buffer_geometry(64, 66, PixelFormat::Yv12).unwrap();
        q
    }

    struct CountingListener(AtomicUsize);

    impl FrameAvailableListener for CountingListener {
        fn on_frame_available(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dequeue_queue_acquire_cycle() {
        let q = queue_64x66_yv12();
        let buf = q.try_dequeue().unwrap();
        assert_eq!(buf.buffer().width(), 64);
        q.queue(buf, Duration::from_millis(16)).unwrap();
        let frame = q.acquire_latest().unwrap();
        assert_eq!(frame.timestamp, Duration::from_millis(16));
        assert_eq!(frame.buffer.height(), 66);
        assert!(frame.crop.is_none());
    }

    #[test]
    fn test_at_most_one_dequeued() {
        let q = queue_64x66_yv12();
        let _held = q.try_dequeue().unwrap();
        assert_eq!(q.try_dequeue().unwrap_err(), HandoffError::AlreadyDequeued);
        assert_eq!(q.dequeue().unwrap_err(), HandoffError::AlreadyDequeued);
    }

    #[test]
    fn test_at_most_one_acquired() {
        let q = queue_64x66_yv12();
        for ts in 0..3u64 {
            let buf = q.try_dequeue().unwrap();
            q.queue(buf, Duration::from_millis(ts)).unwrap();
            q.acquire_latest().unwrap();
            let acquired = q
                .slot_states()
                .iter()
                .filter(|s| **s == SlotState::Acquired)
                .count();
            assert_eq!(acquired, 1);
        }
    }

    #[test]
    fn test_acquire_without_queue_is_idempotent() {
        let q = queue_64x66_yv12();
        assert_eq!(
            q.acquire_latest().unwrap_err(),
            HandoffError::NoFrameAvailable
        );

        let buf = q.try_dequeue().unwrap();
        q.queue(buf, Duration::from_millis(1)).unwrap();
        let first = q.acquire_latest().unwrap();

        // No new frame: the error must not disturb the held frame or matrix.
        assert_eq!(
            q.acquire_latest().unwrap_err(),
            HandoffError::NoFrameAvailable
        );
        assert_eq!(q.current_transform_matrix(), first.matrix);
    }

    #[test]
    fn test_listener_called_synchronously_per_queue() {
        let q = queue_64x66_yv12();
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        q.set_frame_available_listener(Some(listener.clone()));

        for ts in 0..4u64 {
            let buf = q.try_dequeue().unwrap();
            assert_eq!(listener.0.load(Ordering::SeqCst), ts as usize);
            q.queue(buf, Duration::from_millis(ts)).unwrap();
            // Queue returned, so the callback must already have run.
            assert_eq!(listener.0.load(Ordering::SeqCst), ts as usize + 1);
            q.acquire_latest().unwrap();
        }
    }

    #[test]
    fn test_latest_wins_drops_stale_frame() {
        let q = queue_64x66_yv12();
        let a = q.try_dequeue().unwrap();
        q.queue(a, Duration::from_millis(1)).unwrap();
        let b = q.try_dequeue().unwrap();
        q.queue(b, Duration::from_millis(2)).unwrap();

        // The older frame was demoted, so only the newest is visible.
        let frame = q.acquire_latest().unwrap();
        assert_eq!(frame.timestamp, Duration::from_millis(2));
        assert_eq!(
            q.acquire_latest().unwrap_err(),
            HandoffError::NoFrameAvailable
        );
    }

    #[test]
    fn test_free_running_producer_never_starves() {
        // Without a consumer, queue+drop cycles mean a free slot always
        // reappears, so a producer can run forever on its own.
        let q = queue_64x66_yv12();
        for ts in 0..32u64 {
            let buf = q.try_dequeue().unwrap();
            q.queue(buf, Duration::from_millis(ts)).unwrap();
        }
        let frame = q.acquire_latest().unwrap();
        assert_eq!(frame.timestamp, Duration::from_millis(31));
    }

    #[test]
    fn test_cancel_returns_slot_without_frame() {
        let q = queue_64x66_yv12();
        let buf = q.try_dequeue().unwrap();
        q.cancel(buf);
        assert_eq!(
            q.acquire_latest().unwrap_err(),
            HandoffError::NoFrameAvailable
        );
        // The slot is reusable immediately.
        q.try_dequeue().unwrap();
    }

    #[test]
    fn test_drop_of_dequeued_buffer_cancels() {
        let q = queue_64x66_yv12();
        {
            let _buf = q.try_dequeue().unwrap();
        }
        q.try_dequeue().unwrap();
    }

    #[test]
    fn test_buffer_reused_when_geometry_matches() {
        let q = queue_64x66_yv12();
        let buf = q.try_dequeue().unwrap();
        let ptr = buf.buffer().bytes().as_ptr();
        q.queue(buf, Duration::from_millis(1)).unwrap();
        q.acquire_latest().unwrap();

        let buf = q.try_dequeue().unwrap();
        q.queue(buf, Duration::from_millis(2)).unwrap();
        q.acquire_latest().unwrap();

        // The first slot cycled back to Free with the consumer's Arc gone,
        // so dequeue hands out the same allocation.
        let buf = q.try_dequeue().unwrap();
        assert_eq!(buf.buffer().bytes().as_ptr(), ptr);
    }

    #[test]
    fn test_geometry_change_forces_reallocation() {
        let q = queue_64x66_yv12();
        let buf = q.try_dequeue().unwrap();
        q.queue(buf, Duration::from_millis(1)).unwrap();
        q.acquire_latest().unwrap();
        assert_eq!(
            q.acquire_latest().unwrap_err(),
            HandoffError::NoFrameAvailable
        );

        q.set_buffer_geometry(128, 128, PixelFormat::Rgba8888).unwrap();
        // Cycle once so the old acquired slot frees up.
        let buf = q.try_dequeue().unwrap();
        assert_eq!(buf.buffer().width(), 128);
        assert_eq!(buf.buffer().format(), PixelFormat::Rgba8888);
    }

    #[test]
    fn test_crop_applies_to_later_queues_only() {
        let q = queue_64x66_yv12();
        let buf = q.try_dequeue().unwrap();
        q.queue(buf, Duration::from_millis(1)).unwrap();

        // Crop set after queueing must not affect the already-queued frame.
        q.set_crop(Some(CropRect::new(4, 6, 22, 36))).unwrap();
        let frame = q.acquire_latest().unwrap();
        assert!(frame.crop.is_none());

        let buf = q.try_dequeue().unwrap();
        q.queue(buf, Duration::from_millis(2)).unwrap();
        let frame = q.acquire_latest().unwrap();
        assert_eq!(frame.crop, Some(CropRect::new(4, 6, 22, 36)));
    }

    #[test]
    fn test_rejected_crop_keeps_previous() {
        let q = queue_64x66_yv12();
        q.set_crop(Some(CropRect::new(4, 6, 22, 36))).unwrap();

        let err = q.set_crop(Some(CropRect::new(30, 6, 22, 36))).unwrap_err();
        assert!(matches!(err, HandoffError::InvalidCrop { .. }));
        assert_eq!(q.crop(), Some(CropRect::new(4, 6, 22, 36)));

        let err = q.set_crop(Some(CropRect::new(4, 6, 80, 36))).unwrap_err();
        assert!(matches!(err, HandoffError::InvalidCrop { .. }));
        assert_eq!(q.crop(), Some(CropRect::new(4, 6, 22, 36)));

        q.set_crop(None).unwrap();
        assert_eq!(q.crop(), None);
    }

    #[test]
    fn test_reentrant_producer_ops_rejected() {
        struct Reentrant {
            queue: Mutex<Option<SlotQueue>>,
            results: Mutex<Vec<HandoffError>>,
        }
        impl FrameAvailableListener for Reentrant {
            fn on_frame_available(&self) {
                let q = self.queue.lock().clone().unwrap();
                let mut results = self.results.lock();
                results.push(q.try_dequeue().unwrap_err());
                results.push(q.dequeue().unwrap_err());
            }
        }

        let q = queue_64x66_yv12();
        let listener = Arc::new(Reentrant {
            queue: Mutex::new(Some(q.clone())),
            results: Mutex::new(Vec::new()),
        });
        q.set_frame_available_listener(Some(listener.clone()));

        let buf = q.try_dequeue().unwrap();
        q.queue(buf, Duration::from_millis(1)).unwrap();

        let results = listener.results.lock();
        assert_eq!(
            *results,
            vec![
                HandoffError::ReentrantNotifier,
                HandoffError::ReentrantNotifier
            ]
        );
    }

    #[test]
    fn test_consumer_can_acquire_inside_listener() {
        struct AcquiringListener {
            queue: Mutex<Option<SlotQueue>>,
            seen: AtomicUsize,
        }
        impl FrameAvailableListener for AcquiringListener {
            fn on_frame_available(&self) {
                let q = self.queue.lock().clone().unwrap();
                q.acquire_latest().unwrap();
                self.seen.fetch_add(1, Ordering::SeqCst);
            }
        }

        let q = queue_64x66_yv12();
        let listener = Arc::new(AcquiringListener {
            queue: Mutex::new(Some(q.clone())),
            seen: AtomicUsize::new(0),
        });
        q.set_frame_available_listener(Some(listener.clone()));

        for ts in 0..3u64 {
            let buf = q.try_dequeue().unwrap();
            q.queue(buf, Duration::from_millis(ts)).unwrap();
        }
        assert_eq!(listener.seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_abandon_wakes_blocked_producer() {
        let q = SlotQueue::new(MIN_SLOT_COUNT);
        q.set_buffer_geometry(16, 16, PixelFormat::Rgba8888).unwrap();

        // Tie up both slots: one acquired, one queued.
        let buf = q.try_dequeue().unwrap();
        q.queue(buf, Duration::from_millis(1)).unwrap();
        q.acquire_latest().unwrap();
        let buf = q.try_dequeue().unwrap();
        q.queue(buf, Duration::from_millis(2)).unwrap();
        assert_eq!(q.try_dequeue().unwrap_err(), HandoffError::NoFreeSlot);

        let blocked = {
            let q = q.clone();
            thread::spawn(move || q.dequeue())
        };
        thread::sleep(Duration::from_millis(50));
        q.abandon();
        assert_eq!(blocked.join().unwrap().unwrap_err(), HandoffError::Abandoned);

        assert_eq!(q.try_dequeue().unwrap_err(), HandoffError::Abandoned);
        assert_eq!(q.acquire_latest().unwrap_err(), HandoffError::Abandoned);
        assert_eq!(
            q.set_buffer_geometry(8, 8, PixelFormat::Yv12).unwrap_err(),
            HandoffError::Abandoned
        );
    }

    #[test]
    fn test_queue_after_abandon_recycles_slot() {
        let q = queue_64x66_yv12();
        let buf = q.try_dequeue().unwrap();
        q.abandon();
        assert_eq!(
            q.queue(buf, Duration::from_millis(1)).unwrap_err(),
            HandoffError::Abandoned
        );
        // The slot must not be stranded in Dequeued by the failed queue.
        assert!(q.slot_states().iter().all(|s| *s == SlotState::Free));
    }

    #[test]
    fn test_capacity_clamped() {
        assert_eq!(SlotQueue::new(0).capacity(), MIN_SLOT_COUNT);
        assert_eq!(SlotQueue::new(10).capacity(), MAX_SLOT_COUNT);
        assert_eq!(SlotQueue::new(3).capacity(), 3);
    }

    #[test]
    fn test_default_matrix_is_vertical_flip() {
        let q = queue_64x66_yv12();
        let m = q.current_transform_matrix();
        assert_eq!(m[5], -1.0);
        assert_eq!(m[13], 1.0);
    }
}
