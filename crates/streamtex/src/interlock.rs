//! Producer/consumer interlock and the owned producer thread.
//!
//! [`FrameCondition`] turns the synchronous frame-available callback into a
//! rendezvous: the producer blocks inside `queue` until the consumer has
//! observed the frame and called [`FrameCondition::finish_frame`]. This gives
//! lockstep alternation with zero dropped frames, which is what a test
//! harness or a strictly paced pipeline wants.
//!
//! [`ProducerDriver`] owns the producer thread and feeds it commands over a
//! channel, so tests and callers never juggle raw join handles.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::frame::FrameBuffer;
use crate::slot_queue::{FrameAvailableListener, SlotQueue};

#[derive(Default)]
struct ConditionState {
    signaled: u64,
    waited: u64,
    finished: u64,
}

/// Blocking rendezvous between the frame-available callback and the consumer.
///
/// Counter-based rather than bare signals, so a spurious condvar wakeup can
/// neither lose a notification nor release a waiter twice. Register it as the
/// queue's listener; the consumer then drives the loop:
///
/// 1. producer calls `queue`, which runs [`on_frame_available`] on its stack;
/// 2. the callback publishes the notification and parks the producer;
/// 3. the consumer returns from [`wait_for_frame`], acquires and uses the
///    frame, then calls [`finish_frame`];
/// 4. the producer resumes out of `queue`.
///
/// [`on_frame_available`]: FrameAvailableListener::on_frame_available
/// [`wait_for_frame`]: FrameCondition::wait_for_frame
/// [`finish_frame`]: FrameCondition::finish_frame
#[derive(Default)]
pub struct FrameCondition {
    state: Mutex<ConditionState>,
    frame_available: Condvar,
    frame_finished: Condvar,
}

impl FrameCondition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a frame notification arrives that this consumer has not
    /// yet observed.
    pub fn wait_for_frame(&self) {
        let mut state = self.state.lock();
        while state.signaled <= state.waited {
            self.frame_available.wait(&mut state);
        }
        state.waited += 1;
        trace!(observed = state.waited, "frame notification observed");
    }

    /// Like [`wait_for_frame`](Self::wait_for_frame) but gives up after
    /// `timeout`, returning false. Keeps deadlock failures bounded in tests.
    pub fn wait_for_frame_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        while state.signaled <= state.waited {
            if self
                .frame_available
                .wait_for(&mut state, timeout)
                .timed_out()
            {
                warn!(?timeout, "timed out waiting for a frame");
                return false;
            }
        }
        state.waited += 1;
        true
    }

    /// Releases the producer parked inside `queue` for the oldest
    /// unacknowledged frame.
    pub fn finish_frame(&self) {
        let mut state = self.state.lock();
        state.finished += 1;
        trace!(finished = state.finished, "frame finished");
        self.frame_finished.notify_all();
    }
}

impl FrameAvailableListener for FrameCondition {
    fn on_frame_available(&self) {
        let mut state = self.state.lock();
        state.signaled += 1;
        let ticket = state.signaled;
        self.frame_available.notify_all();
        // Park the producer here, inside queue(), until the consumer is done
        // with this frame.
        while state.finished < ticket {
            self.frame_finished.wait(&mut state);
        }
    }
}

enum ProducerCommand {
    Produce(usize),
    Stop,
}

/// Owned producer thread running dequeue/fill/queue cycles on command.
///
/// The fill closure receives the buffer to write and the running frame index.
/// Frames are timestamped at a nominal 16ms cadence. The thread stops and
/// joins when the driver is dropped.
pub struct ProducerDriver {
    command_tx: Sender<ProducerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl ProducerDriver {
    /// Spawns the producer thread over a shared queue handle.
    pub fn spawn<F>(queue: SlotQueue, mut fill: F) -> Self
    where
        F: FnMut(&mut FrameBuffer, u64) + Send + 'static,
    {
        let (command_tx, command_rx) = unbounded();
        let handle = thread::Builder::new()
            .name("streamtex-producer".into())
            .spawn(move || {
                let mut frame_index = 0u64;
                while let Ok(command) = command_rx.recv() {
                    match command {
                        ProducerCommand::Produce(count) => {
                            for _ in 0..count {
                                let mut buf = match queue.dequeue() {
                                    Ok(buf) => buf,
                                    Err(err) => {
                                        debug!(%err, "producer stopping");
                                        return;
                                    }
                                };
                                fill(buf.buffer_mut(), frame_index);
                                let timestamp = Duration::from_millis(frame_index * 16);
                                if let Err(err) = queue.queue(buf, timestamp) {
                                    debug!(%err, "producer stopping");
                                    return;
                                }
                                frame_index += 1;
                            }
                        }
                        ProducerCommand::Stop => return,
                    }
                }
            })
            .expect("spawn producer thread");
        Self {
            command_tx,
            handle: Some(handle),
        }
    }

    /// Asks the producer to run `count` dequeue/fill/queue cycles.
    pub fn produce(&self, count: usize) {
        let _ = self.command_tx.send(ProducerCommand::Produce(count));
    }
}

impl Drop for ProducerDriver {
    fn drop(&mut self) {
        let _ = self.command_tx.send(ProducerCommand::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
