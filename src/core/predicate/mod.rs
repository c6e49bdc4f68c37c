//! Admission control for queues.
//!
//! A queue consults its [`EnqueuePredicate`] inside its critical section,
//! before any element is stored or reserved. Predicates receive the number
//! of incoming elements and a [`QueueState`] snapshot rather than the queue
//! itself, so they can never re-enter the queue's lock.

pub mod rate_limit;
pub mod threshold;

pub use rate_limit::RateLimitingPredicate;
pub use threshold::ThresholdEnqueuePredicate;

use std::fmt::Debug;

/// Occupancy of a queue at the moment a predicate is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueState {
    /// Committed elements plus outstanding reservations.
    pub size: usize,
    /// Physical capacity, `None` for unbounded queues.
    pub max_size: Option<usize>,
}

/// Decides whether `count` new elements may enter a queue.
///
/// Implementations must be thread-safe; stateful predicates (such as the
/// token bucket) use interior mutability.
pub trait EnqueuePredicate: Send + Sync + Debug {
    fn accept(&self, count: usize, state: &QueueState) -> bool;
}

/// Accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEnqueuePredicate;

impl EnqueuePredicate for NullEnqueuePredicate {
    #[inline]
    fn accept(&self, _count: usize, _state: &QueueState) -> bool {
        true
    }
}
