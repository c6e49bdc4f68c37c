//! Queue abstractions.
//!
//! A queue is both a [`Sink`] (producers push work into it, subject to
//! admission control) and a [`Source`] (workers pull work out of it).
//! Two implementations share one engine ([`BufferedQueue`]):
//!
//! - [`DefaultQueue`]: growable FIFO, bounded only by its predicate.
//! - [`FixedSizeQueue`]: ring buffer with a physical capacity fixed at
//!   construction.

pub mod buffered;
pub mod default;
pub mod fixed;

pub use buffered::{BufferedQueue, QueuePreparedEnqueue};
pub use default::DefaultQueue;
pub use fixed::{FixedSizeQueue, RingBuffer};

use std::sync::Arc;
use std::time::Duration;

use crate::core::error::SinkError;
use crate::core::predicate::EnqueuePredicate;

/// Size and capacity queries shared by sinks and sources.
pub trait Occupancy {
    /// Committed elements plus outstanding reservations.
    fn size(&self) -> usize;

    /// Physical capacity; `None` when unbounded.
    fn max_size(&self) -> Option<usize>;

    fn is_full(&self) -> bool {
        match self.max_size() {
            Some(max) => max <= self.size(),
            None => false,
        }
    }

    /// Remaining room; `None` when unbounded.
    fn can_accept(&self) -> Option<usize> {
        self.max_size().map(|max| max.saturating_sub(self.size()))
    }
}

/// A two-phase enqueue: room was reserved by `prepare_enqueue`, the
/// elements are inserted on `commit` or released on `abort`.
///
/// Exactly one of the two must be called, once. Reuse fails with
/// [`SinkError::AlreadyProcessed`]. Handles dropped while still pending are
/// aborted.
pub trait PreparedEnqueue: Send {
    fn commit(&mut self) -> Result<(), SinkError>;
    fn abort(&mut self) -> Result<(), SinkError>;
}

/// The producer side of a queue.
pub trait Sink<T>: Occupancy + Send + Sync {
    /// Appends one element or fails with [`SinkError::Full`].
    fn enqueue(&self, element: T) -> Result<(), SinkError>;

    /// Appends all elements or none of them.
    fn enqueue_many(&self, elements: Vec<T>) -> Result<(), SinkError>;

    /// Like [`Sink::enqueue`] but reports rejection as `false`.
    fn try_enqueue(&self, element: T) -> bool;

    /// Checks admission once and reserves room for `elements`.
    fn prepare_enqueue(
        &self,
        elements: Vec<T>,
    ) -> Result<Box<dyn PreparedEnqueue + '_>, SinkError>;
}

/// Hook run around every dequeue operation of a [`Source`].
pub trait DequeueInterceptor: Send + Sync {
    fn before(&self, source: &dyn Occupancy);
    fn after(&self, source: &dyn Occupancy);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullDequeueInterceptor;

impl DequeueInterceptor for NullDequeueInterceptor {
    #[inline]
    fn before(&self, _source: &dyn Occupancy) {}

    #[inline]
    fn after(&self, _source: &dyn Occupancy) {}
}

/// The consumer side of a queue.
///
/// Dequeue operations wait at most [`Source::timeout`] for the queue's lock
/// and never wait for data: an empty queue yields nothing immediately.
pub trait Source<T>: Occupancy + Send + Sync {
    fn dequeue(&self) -> Option<T>;

    /// Removes up to `max` of the oldest elements.
    fn dequeue_many(&self, max: usize) -> Vec<T>;

    fn dequeue_all(&self) -> Vec<T>;

    /// A zero timeout means a single immediate lock attempt.
    fn set_timeout(&self, timeout: Duration);

    fn timeout(&self) -> Duration;

    fn set_dequeue_interceptor(&self, interceptor: Arc<dyn DequeueInterceptor>);

    fn dequeue_interceptor(&self) -> Arc<dyn DequeueInterceptor>;
}

/// A sink and a source over the same buffer, with a replaceable predicate.
pub trait Queue<T>: Sink<T> + Source<T> {
    fn set_enqueue_predicate(&self, predicate: Arc<dyn EnqueuePredicate>);

    fn enqueue_predicate(&self) -> Arc<dyn EnqueuePredicate>;
}
