//! Sinks that fan elements out to several downstream sinks.
//!
//! [`MultiCastSink`] is transactional: every downstream sink must accept or
//! nobody receives anything. [`LossyMultiCastSink`] delivers to the first
//! sink that accepts and tolerates losing elements.

use std::sync::Arc;

use tracing::debug;

use crate::core::error::SinkError;
use crate::core::queue::{Occupancy, PreparedEnqueue, Sink};

/// Commits or aborts a group of prepared enqueues together.
struct PreparedGroup<'a> {
    parts: Vec<Box<dyn PreparedEnqueue + 'a>>,
    processed: bool,
}

impl<'a> PreparedGroup<'a> {
    fn new() -> Self {
        Self {
            parts: Vec::new(),
            processed: false,
        }
    }

    fn finish(
        &mut self,
        mut op: impl FnMut(&mut Box<dyn PreparedEnqueue + 'a>) -> Result<(), SinkError>,
    ) -> Result<(), SinkError> {
        if self.processed {
            return Err(SinkError::AlreadyProcessed);
        }
        self.processed = true;
        let mut first_err = None;
        for part in &mut self.parts {
            if let Err(e) = op(part) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl PreparedEnqueue for PreparedGroup<'_> {
    fn commit(&mut self) -> Result<(), SinkError> {
        self.finish(|part| part.commit())
    }

    fn abort(&mut self) -> Result<(), SinkError> {
        self.finish(|part| part.abort())
    }
}

/// Delivers every element to all downstream sinks, or to none.
pub struct MultiCastSink<T> {
    sinks: Vec<Arc<dyn Sink<T>>>,
    single: bool,
}

impl<T> MultiCastSink<T>
where
    T: Clone + Send,
{
    pub fn new(sinks: Vec<Arc<dyn Sink<T>>>) -> Self {
        Self::with_mode(sinks, false)
    }

    /// With `single`, delivery stops at the first sink that accepts.
    pub fn with_mode(sinks: Vec<Arc<dyn Sink<T>>>, single: bool) -> Self {
        Self { sinks, single }
    }
}

impl<T> Occupancy for MultiCastSink<T> {
    fn size(&self) -> usize {
        0
    }

    fn max_size(&self) -> Option<usize> {
        None
    }
}

impl<T> Sink<T> for MultiCastSink<T>
where
    T: Clone + Send,
{
    fn enqueue(&self, element: T) -> Result<(), SinkError> {
        self.prepare_enqueue(vec![element])?.commit()
    }

    fn enqueue_many(&self, elements: Vec<T>) -> Result<(), SinkError> {
        self.prepare_enqueue(elements)?.commit()
    }

    fn try_enqueue(&self, element: T) -> bool {
        self.enqueue(element).is_ok()
    }

    fn prepare_enqueue(
        &self,
        elements: Vec<T>,
    ) -> Result<Box<dyn PreparedEnqueue + '_>, SinkError> {
        let count = elements.len();
        let mut group = PreparedGroup::new();

        for sink in &self.sinks {
            match sink.prepare_enqueue(elements.clone()) {
                Ok(prepared) => {
                    group.parts.push(prepared);
                    if self.single {
                        return Ok(Box::new(group));
                    }
                }
                Err(e) if self.single => {
                    debug!(error = %e, "multicast sink refused elements, trying next");
                }
                Err(_) => {
                    // roll back everything prepared so far
                    let _ = group.abort();
                    return Err(SinkError::full(count));
                }
            }
        }

        if self.single {
            let _ = group.abort();
            return Err(SinkError::full(count));
        }
        Ok(Box::new(group))
    }
}

/// Delivers each batch to the first downstream sink that accepts it.
///
/// Unless `one_success` is set, elements no sink accepts are dropped
/// silently.
pub struct LossyMultiCastSink<T> {
    sinks: Vec<Arc<dyn Sink<T>>>,
    one_success: bool,
}

impl<T> LossyMultiCastSink<T>
where
    T: Clone + Send,
{
    pub fn new(sinks: Vec<Arc<dyn Sink<T>>>) -> Self {
        Self::with_mode(sinks, false)
    }

    pub fn with_mode(sinks: Vec<Arc<dyn Sink<T>>>, one_success: bool) -> Self {
        Self { sinks, one_success }
    }

    fn undelivered(&self, count: usize) -> Result<(), SinkError> {
        if self.one_success {
            Err(SinkError::full(count))
        } else {
            debug!(count, "lossy multicast dropped elements");
            Ok(())
        }
    }
}

impl<T> Occupancy for LossyMultiCastSink<T> {
    fn size(&self) -> usize {
        0
    }

    fn max_size(&self) -> Option<usize> {
        None
    }
}

impl<T> Sink<T> for LossyMultiCastSink<T>
where
    T: Clone + Send,
{
    fn enqueue(&self, element: T) -> Result<(), SinkError> {
        if self.sinks.iter().any(|sink| sink.try_enqueue(element.clone())) {
            return Ok(());
        }
        self.undelivered(1)
    }

    fn enqueue_many(&self, elements: Vec<T>) -> Result<(), SinkError> {
        let count = elements.len();
        for sink in &self.sinks {
            if sink.enqueue_many(elements.clone()).is_ok() {
                return Ok(());
            }
        }
        self.undelivered(count)
    }

    fn try_enqueue(&self, element: T) -> bool {
        self.enqueue(element).is_ok()
    }

    fn prepare_enqueue(
        &self,
        elements: Vec<T>,
    ) -> Result<Box<dyn PreparedEnqueue + '_>, SinkError> {
        let count = elements.len();
        let mut group = PreparedGroup::new();
        for sink in &self.sinks {
            if let Ok(prepared) = sink.prepare_enqueue(elements.clone()) {
                group.parts.push(prepared);
                return Ok(Box::new(group));
            }
        }
        self.undelivered(count)?;
        Ok(Box::new(group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::{DefaultQueue, Source};

    fn queues(limits: &[usize]) -> Vec<Arc<DefaultQueue<u32>>> {
        limits
            .iter()
            .map(|&limit| Arc::new(DefaultQueue::with_threshold(limit)))
            .collect()
    }

    fn as_sinks(queues: &[Arc<DefaultQueue<u32>>]) -> Vec<Arc<dyn Sink<u32>>> {
        queues
            .iter()
            .map(|q| Arc::clone(q) as Arc<dyn Sink<u32>>)
            .collect()
    }

    #[test]
    fn multicast_delivers_to_every_sink() {
        let qs = queues(&[0, 0]);
        let sink = MultiCastSink::new(as_sinks(&qs));
        sink.enqueue_many(vec![1, 2]).unwrap();
        assert_eq!(qs[0].dequeue_all(), vec![1, 2]);
        assert_eq!(qs[1].dequeue_all(), vec![1, 2]);
    }

    #[test]
    fn multicast_is_all_or_nothing() {
        let qs = queues(&[0, 2]);
        let sink = MultiCastSink::new(as_sinks(&qs));
        assert!(sink.enqueue_many(vec![1, 2]).is_err());
        assert_eq!(qs[0].size(), 0);
        assert_eq!(qs[1].size(), 0);
    }

    #[test]
    fn single_mode_stops_at_first_acceptor() {
        let qs = queues(&[1, 0, 0]);
        let sink = MultiCastSink::with_mode(as_sinks(&qs), true);
        sink.enqueue(5).unwrap();
        assert_eq!(qs[0].size(), 0);
        assert_eq!(qs[1].dequeue_all(), vec![5]);
        assert_eq!(qs[2].size(), 0);
    }

    #[test]
    fn prepared_group_cannot_be_reused() {
        let qs = queues(&[0]);
        let sink = MultiCastSink::new(as_sinks(&qs));
        let mut prepared = sink.prepare_enqueue(vec![9]).unwrap();
        prepared.commit().unwrap();
        assert!(matches!(prepared.abort(), Err(SinkError::AlreadyProcessed)));
        assert_eq!(qs[0].dequeue_all(), vec![9]);
    }

    #[test]
    fn lossy_fails_over_to_next_sink() {
        let qs = queues(&[1, 0]);
        let sink = LossyMultiCastSink::new(as_sinks(&qs));
        sink.enqueue(3).unwrap();
        assert_eq!(qs[0].size(), 0);
        assert_eq!(qs[1].dequeue_all(), vec![3]);
    }

    #[test]
    fn lossy_drops_unless_one_success_required() {
        let qs = queues(&[1, 1]);
        let lossy = LossyMultiCastSink::new(as_sinks(&qs));
        assert!(lossy.enqueue(1).is_ok());
        assert!(lossy.try_enqueue(1));

        let strict = LossyMultiCastSink::with_mode(as_sinks(&qs), true);
        assert!(strict.enqueue(1).is_err());
        assert!(!strict.try_enqueue(1));
        assert!(strict.prepare_enqueue(vec![1]).is_err());
        assert_eq!(qs[0].size() + qs[1].size(), 0);
    }
}
