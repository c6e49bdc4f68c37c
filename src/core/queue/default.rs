use std::collections::VecDeque;
use std::sync::Arc;

use super::buffered::{Buffer, BufferedQueue};
use crate::core::predicate::{EnqueuePredicate, ThresholdEnqueuePredicate};

impl<T: Send> Buffer<T> for VecDeque<T> {
    #[inline]
    fn len(&self) -> usize {
        VecDeque::len(self)
    }

    #[inline]
    fn capacity(&self) -> Option<usize> {
        None
    }

    #[inline]
    fn push_back(&mut self, element: T) {
        VecDeque::push_back(self, element);
    }

    #[inline]
    fn pop_front(&mut self) -> Option<T> {
        VecDeque::pop_front(self)
    }
}

/// Unbounded FIFO queue. Only its [`EnqueuePredicate`] limits admission.
pub type DefaultQueue<T> = BufferedQueue<T, VecDeque<T>>;

impl<T: Send> BufferedQueue<T, VecDeque<T>> {
    /// A queue that accepts everything.
    pub fn new() -> Self {
        Self::unrestricted(VecDeque::new())
    }

    /// A queue that stays strictly below `limit` elements (`0` = no limit).
    pub fn with_threshold(limit: usize) -> Self {
        Self::with_predicate(Arc::new(ThresholdEnqueuePredicate::new(limit)))
    }

    pub fn with_predicate(predicate: Arc<dyn EnqueuePredicate>) -> Self {
        Self::from_buffer(VecDeque::new(), predicate)
    }
}

impl<T: Send> Default for BufferedQueue<T, VecDeque<T>> {
    fn default() -> Self {
        Self::new()
    }
}
