use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::shared::frame::SharedFrame;

/// Bounded drop-oldest frame queue with a last-known-good slot.
///
/// The capture thread pushes, consumers pop. When the queue is drained,
/// consumers keep seeing the most recent frame ever pushed instead of
/// nothing, so a briefly stalled camera does not blank the output.
pub struct FrameBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
}

struct BufferState {
    frames: VecDeque<SharedFrame>,
    last_good: Option<SharedFrame>,
}

impl FrameBuffer {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BufferState {
                frames: VecDeque::with_capacity(capacity),
                last_good: None,
            }),
        }
    }

    /// Appends a frame, returning the oldest one if it had to be evicted.
    pub fn push(&self, frame: SharedFrame) -> Option<SharedFrame> {
        let mut state = self.lock();
        let evicted = if state.frames.len() >= self.capacity {
            state.frames.pop_front()
        } else {
            None
        };
        state.last_good = Some(SharedFrame::clone(&frame));
        state.frames.push_back(frame);
        evicted
    }

    /// Oldest queued frame, or the last-known-good frame when the queue is empty.
    pub fn pop(&self) -> Option<SharedFrame> {
        let mut state = self.lock();
        match state.frames.pop_front() {
            Some(frame) => Some(frame),
            None => state.last_good.clone(),
        }
    }

    pub fn last_good(&self) -> Option<SharedFrame> {
        self.lock().last_good.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops queued frames and the last-known-good slot.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.frames.clear();
        state.last_good = None;
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // Every mutation leaves the state consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
