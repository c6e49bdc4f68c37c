use super::{EnqueuePredicate, QueueState};

/// Accepts elements while the queue stays strictly below a fixed limit.
///
/// A limit of `0` disables the check.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdEnqueuePredicate {
    limit: usize,
}

impl ThresholdEnqueuePredicate {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl EnqueuePredicate for ThresholdEnqueuePredicate {
    #[inline]
    fn accept(&self, count: usize, state: &QueueState) -> bool {
        if self.limit == 0 {
            return true;
        }
        state.size.saturating_add(count) < self.limit
    }
}
