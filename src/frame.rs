//! Frame handoff between the capture producer and the inference consumer.
//!
//! - `Frame`: one compressed image pushed by a frame source.
//! - `FrameHandoff`: single-slot, latest-wins mailbox. Writers never block on
//!   the reader; the reader always gets the newest frame it has not seen yet.
//!
//! The handoff is not a queue. When inference is slower than
//! capture, intermediate frames are overwritten and never processed.

use bytes::Bytes;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One encoded frame as produced by the capture hardware.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Monotonic sequence assigned by the handoff on `put` (starts at 1).
    pub sequence: u64,
    /// Instant the frame entered the handoff.
    pub captured_at: Instant,
    /// Encoded bytes (JPEG for every source in this crate).
    pub data: Bytes,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Age of this frame since capture.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

/// Outcome of `FrameHandoff::take`.
#[derive(Debug)]
pub enum Take {
    Frame(Frame),
    /// The handoff was closed; the consumer must exit.
    Closed,
}

// ----------------------------------------------------------------------------
// FrameHandoff
// ----------------------------------------------------------------------------

struct Slot {
    latest: Option<Frame>,
    written: u64,
    taken: u64,
    closed: bool,
}

/// Single-slot mailbox with newest-data-wins semantics.
///
/// Single consumer: `take` tracks the last sequence it handed out and only
/// returns frames newer than that one.
pub struct FrameHandoff {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl FrameHandoff {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                latest: None,
                written: 0,
                taken: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Overwrite the slot with a new frame and wake waiters.
    ///
    /// Always succeeds, including after `close` (the frame is then simply
    /// never taken). Returns the sequence assigned to the frame.
    pub fn put(&self, data: impl Into<Bytes>) -> u64 {
        let sequence = {
            let mut slot = self.lock();
            slot.written += 1;
            let sequence = slot.written;
            slot.latest = Some(Frame {
                sequence,
                captured_at: Instant::now(),
                data: data.into(),
            });
            sequence
        };
        self.ready.notify_all();
        sequence
    }

    /// Block until a frame newer than the last taken one exists, or until the
    /// handoff is closed.
    ///
    /// The slot is not cleared; only the consumer's cursor advances. Closing
    /// wins over an unread frame.
    pub fn take(&self) -> Take {
        let mut slot = self.lock();
        loop {
            if slot.closed {
                return Take::Closed;
            }
            if slot.written > slot.taken {
                if let Some(frame) = slot.latest.clone() {
                    slot.taken = frame.sequence;
                    return Take::Frame(frame);
                }
            }
            slot = match self.ready.wait(slot) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Like `take`, but gives up after `timeout` and returns `None`.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Take> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if slot.closed {
                return Some(Take::Closed);
            }
            if slot.written > slot.taken {
                if let Some(frame) = slot.latest.clone() {
                    slot.taken = frame.sequence;
                    return Some(Take::Frame(frame));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = match self.ready.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Signal shutdown. Wakes every blocked `take`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Sequence of the newest frame written so far (0 if none).
    pub fn written_sequence(&self) -> u64 {
        self.lock().written
    }

    /// Sequence of the last frame handed to the consumer (0 if none).
    pub fn taken_sequence(&self) -> u64 {
        self.lock().taken
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A panic while holding the slot cannot leave it inconsistent: every
        // critical section is a handful of plain field writes.
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for FrameHandoff {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
