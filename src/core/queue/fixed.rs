use std::sync::Arc;

use super::buffered::{Buffer, BufferedQueue};
use crate::core::predicate::EnqueuePredicate;

/// Fixed-capacity circular buffer.
#[derive(Debug)]
pub struct RingBuffer<T> {
    slots: Box<[Option<T>]>,
    start: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    #[inline]
    fn slot(&self, offset: usize) -> usize {
        (self.start + offset) % self.slots.len()
    }
}

impl<T: Send> Buffer<T> for RingBuffer<T> {
    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn capacity(&self) -> Option<usize> {
        Some(self.slots.len())
    }

    fn push_back(&mut self, element: T) {
        // admission keeps us from getting here
        debug_assert!(self.len < self.slots.len(), "push into a full ring buffer");
        if self.len == self.slots.len() {
            return;
        }
        let end = self.slot(self.len);
        self.slots[end] = Some(element);
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let element = self.slots[self.start].take();
        self.start = (self.start + 1) % self.slots.len();
        self.len -= 1;
        element
    }
}

/// Bounded FIFO queue backed by a [`RingBuffer`].
///
/// Enqueues are rejected once the buffer (including reservations) is
/// physically full, whatever the predicate says.
pub type FixedSizeQueue<T> = BufferedQueue<T, RingBuffer<T>>;

impl<T: Send> BufferedQueue<T, RingBuffer<T>> {
    /// Returns `None` for a zero capacity: a fixed queue cannot be unbounded.
    pub fn new(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        Some(Self::unrestricted(RingBuffer::new(capacity)))
    }

    pub fn with_predicate(capacity: usize, predicate: Arc<dyn EnqueuePredicate>) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        Some(Self::from_buffer(RingBuffer::new(capacity), predicate))
    }
}
