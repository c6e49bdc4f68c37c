//! The queue engine shared by [`DefaultQueue`](super::DefaultQueue) and
//! [`FixedSizeQueue`](super::FixedSizeQueue).
//!
//! One `parking_lot::Mutex` per queue guards the buffer together with the
//! reservation counter, so the predicate check and the buffer mutation form
//! a single critical section. Different queues never contend.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{trace, warn};

use super::{
    DequeueInterceptor, NullDequeueInterceptor, Occupancy, PreparedEnqueue, Queue, Sink, Source,
};
use crate::core::error::SinkError;
use crate::core::predicate::{EnqueuePredicate, NullEnqueuePredicate, QueueState};
use crate::metrics;

/// Storage behind a [`BufferedQueue`].
pub trait Buffer<T>: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical capacity, `None` if the buffer grows on demand.
    fn capacity(&self) -> Option<usize>;

    /// Callers check room first; bounded buffers may drop on overflow.
    fn push_back(&mut self, element: T);

    fn pop_front(&mut self) -> Option<T>;
}

struct Inner<B> {
    buffer: B,
    /// Elements admitted by `prepare_enqueue` but not yet committed.
    reserve: usize,
}

impl<B> Inner<B> {
    fn size<T>(&self) -> usize
    where
        B: Buffer<T>,
    {
        self.buffer.len() + self.reserve
    }
}

pub struct BufferedQueue<T, B> {
    inner: Mutex<Inner<B>>,
    predicate: RwLock<Arc<dyn EnqueuePredicate>>,
    interceptor: RwLock<Arc<dyn DequeueInterceptor>>,
    timeout_ms: AtomicU64,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T, B> fmt::Debug for BufferedQueue<T, B>
where
    T: Send,
    B: Buffer<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedQueue")
            .field("size", &self.size())
            .field("max_size", &self.max_size())
            .field("timeout", &self.timeout())
            .field("predicate", &*self.predicate.read())
            .finish()
    }
}

impl<T, B> BufferedQueue<T, B>
where
    T: Send,
    B: Buffer<T>,
{
    pub(crate) fn from_buffer(buffer: B, predicate: Arc<dyn EnqueuePredicate>) -> Self {
        Self {
            inner: Mutex::new(Inner { buffer, reserve: 0 }),
            predicate: RwLock::new(predicate),
            interceptor: RwLock::new(Arc::new(NullDequeueInterceptor)),
            timeout_ms: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    pub(crate) fn unrestricted(buffer: B) -> Self {
        Self::from_buffer(buffer, Arc::new(NullEnqueuePredicate))
    }

    /// Runs `seal` inside the critical section and drains every committed
    /// element before releasing it. No enqueue can slip in between.
    pub fn seal_and_drain<F: FnOnce()>(&self, seal: F) -> Vec<T> {
        let mut inner = self.inner.lock();
        seal();
        let count = inner.buffer.len();
        let drained = Self::take(&mut inner, count);
        metrics::inc_dequeued(drained.len() as u64);
        drained
    }

    /// Number of committed elements, excluding reservations.
    pub fn committed(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    fn admit(&self, inner: &Inner<B>, count: usize) -> bool {
        let size = inner.size::<T>();
        let max_size = inner.buffer.capacity();
        if let Some(capacity) = max_size {
            if size.saturating_add(count) > capacity {
                return false;
            }
        }
        let state = QueueState { size, max_size };
        self.predicate.read().accept(count, &state)
    }

    fn reject(count: usize) -> SinkError {
        metrics::inc_rejected(count as u64);
        trace!(requested = count, "enqueue rejected");
        SinkError::full(count)
    }

    fn lock_for_dequeue(&self) -> Option<MutexGuard<'_, Inner<B>>> {
        let timeout = self.timeout();
        if timeout.is_zero() {
            self.inner.try_lock()
        } else {
            self.inner.try_lock_for(timeout)
        }
    }

    fn take(inner: &mut Inner<B>, count: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            match inner.buffer.pop_front() {
                Some(element) => out.push(element),
                None => break,
            }
        }
        out
    }

    fn intercepted<R>(&self, op: impl FnOnce(&mut Inner<B>) -> R, empty: R) -> R {
        let interceptor = Arc::clone(&*self.interceptor.read());
        interceptor.before(self);
        let result = match self.lock_for_dequeue() {
            Some(mut inner) => op(&mut inner),
            None => {
                trace!("queue lock not acquired within timeout");
                empty
            }
        };
        interceptor.after(self);
        result
    }

    fn release_reservation(&self, count: usize) {
        let mut inner = self.inner.lock();
        inner.reserve = inner.reserve.saturating_sub(count);
    }
}

impl<T, B> Occupancy for BufferedQueue<T, B>
where
    T: Send,
    B: Buffer<T>,
{
    fn size(&self) -> usize {
        self.inner.lock().size::<T>()
    }

    fn max_size(&self) -> Option<usize> {
        self.inner.lock().buffer.capacity()
    }
}

impl<T, B> Sink<T> for BufferedQueue<T, B>
where
    T: Send,
    B: Buffer<T>,
{
    fn enqueue(&self, element: T) -> Result<(), SinkError> {
        let mut inner = self.inner.lock();
        if !self.admit(&inner, 1) {
            return Err(Self::reject(1));
        }
        inner.buffer.push_back(element);
        metrics::inc_enqueued(1);
        Ok(())
    }

    fn enqueue_many(&self, elements: Vec<T>) -> Result<(), SinkError> {
        let count = elements.len();
        let mut inner = self.inner.lock();
        if !self.admit(&inner, count) {
            return Err(Self::reject(count));
        }
        for element in elements {
            inner.buffer.push_back(element);
        }
        metrics::inc_enqueued(count as u64);
        Ok(())
    }

    fn try_enqueue(&self, element: T) -> bool {
        self.enqueue(element).is_ok()
    }

    fn prepare_enqueue(
        &self,
        elements: Vec<T>,
    ) -> Result<Box<dyn PreparedEnqueue + '_>, SinkError> {
        let count = elements.len();
        let mut inner = self.inner.lock();
        if !self.admit(&inner, count) {
            return Err(Self::reject(count));
        }
        inner.reserve += count;
        Ok(Box::new(QueuePreparedEnqueue {
            queue: self,
            elements: Some(elements),
        }))
    }
}

impl<T, B> Source<T> for BufferedQueue<T, B>
where
    T: Send,
    B: Buffer<T>,
{
    fn dequeue(&self) -> Option<T> {
        let element = self.intercepted(|inner| inner.buffer.pop_front(), None);
        if element.is_some() {
            metrics::inc_dequeued(1);
        }
        element
    }

    fn dequeue_many(&self, max: usize) -> Vec<T> {
        let elements = self.intercepted(
            |inner| {
                let count = inner.buffer.len().min(max);
                Self::take(inner, count)
            },
            Vec::new(),
        );
        metrics::inc_dequeued(elements.len() as u64);
        elements
    }

    fn dequeue_all(&self) -> Vec<T> {
        let elements = self.intercepted(
            |inner| {
                let count = inner.buffer.len();
                Self::take(inner, count)
            },
            Vec::new(),
        );
        metrics::inc_dequeued(elements.len() as u64);
        elements
    }

    fn set_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.timeout_ms.store(millis, Ordering::Relaxed);
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    fn set_dequeue_interceptor(&self, interceptor: Arc<dyn DequeueInterceptor>) {
        *self.interceptor.write() = interceptor;
    }

    fn dequeue_interceptor(&self) -> Arc<dyn DequeueInterceptor> {
        Arc::clone(&*self.interceptor.read())
    }
}

impl<T, B> Queue<T> for BufferedQueue<T, B>
where
    T: Send,
    B: Buffer<T>,
{
    fn set_enqueue_predicate(&self, predicate: Arc<dyn EnqueuePredicate>) {
        *self.predicate.write() = predicate;
    }

    fn enqueue_predicate(&self) -> Arc<dyn EnqueuePredicate> {
        Arc::clone(&*self.predicate.read())
    }
}

/// Reservation handle returned by [`BufferedQueue::prepare_enqueue`].
pub struct QueuePreparedEnqueue<'a, T, B>
where
    T: Send,
    B: Buffer<T>,
{
    queue: &'a BufferedQueue<T, B>,
    elements: Option<Vec<T>>,
}

impl<T, B> PreparedEnqueue for QueuePreparedEnqueue<'_, T, B>
where
    T: Send,
    B: Buffer<T>,
{
    fn commit(&mut self) -> Result<(), SinkError> {
        let elements = self.elements.take().ok_or(SinkError::AlreadyProcessed)?;
        let count = elements.len();
        let mut inner = self.queue.inner.lock();
        inner.reserve = inner.reserve.saturating_sub(count);
        for element in elements {
            inner.buffer.push_back(element);
        }
        metrics::inc_enqueued(count as u64);
        Ok(())
    }

    fn abort(&mut self) -> Result<(), SinkError> {
        let elements = self.elements.take().ok_or(SinkError::AlreadyProcessed)?;
        self.queue.release_reservation(elements.len());
        Ok(())
    }
}

impl<T, B> Drop for QueuePreparedEnqueue<'_, T, B>
where
    T: Send,
    B: Buffer<T>,
{
    fn drop(&mut self) {
        if let Some(elements) = self.elements.take() {
            warn!(
                count = elements.len(),
                "prepared enqueue dropped without commit or abort; aborting"
            );
            self.queue.release_reservation(elements.len());
        }
    }
}
