//! Pairing of sources with the handler that consumes them.

use std::sync::Arc;

use crate::core::queue::Source;

/// Consumes elements pulled from a pipeline's sources.
pub trait EventHandler<T>: Send + Sync {
    fn handle_event(&self, event: T);

    /// Handles one drained batch. The default forwards element by element.
    fn handle_events(&self, events: Vec<T>) {
        for event in events {
            self.handle_event(event);
        }
    }
}

/// One or more sources feeding a single [`EventHandler`].
///
/// A thread manager owns the scheduling of a pipeline once registered.
pub trait EventPipeline<T>: Send + Sync {
    fn sources(&self) -> Vec<Arc<dyn Source<T>>>;

    fn event_handler(&self) -> Arc<dyn EventHandler<T>>;
}

/// A pipeline assembled from parts, for callers without their own type.
pub struct SimplePipeline<T> {
    sources: Vec<Arc<dyn Source<T>>>,
    handler: Arc<dyn EventHandler<T>>,
}

impl<T> SimplePipeline<T> {
    pub fn new(sources: Vec<Arc<dyn Source<T>>>, handler: Arc<dyn EventHandler<T>>) -> Self {
        Self { sources, handler }
    }
}

impl<T> EventPipeline<T> for SimplePipeline<T>
where
    T: Send,
{
    fn sources(&self) -> Vec<Arc<dyn Source<T>>> {
        self.sources.clone()
    }

    fn event_handler(&self) -> Arc<dyn EventHandler<T>> {
        Arc::clone(&self.handler)
    }
}

/// Identity of a registered pipeline: the address of its `Arc` allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey(usize);

impl PipelineKey {
    pub fn of<T>(pipeline: &Arc<dyn EventPipeline<T>>) -> Self {
        PipelineKey(Arc::as_ptr(pipeline) as *const () as usize)
    }
}
