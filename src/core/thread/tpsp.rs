//! Thread-per-source-per-pipeline manager with elastic pools.
//!
//! Each source of a registered pipeline gets one core worker that
//! dequeues single elements forever. An [`ElasticController`] installed as
//! the source's dequeue interceptor adds a worker whenever the depth is
//! above `threshold + margin` and retires the oldest extra one whenever it
//! falls below `threshold - margin`.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::{panic_message, ThreadManager};
use crate::core::error::LifecycleError;
use crate::core::pipeline::{EventHandler, EventPipeline, PipelineKey};
use crate::core::queue::{DequeueInterceptor, Occupancy, Source};
use crate::metrics;

/// Workers a source always keeps.
pub const MIN_THREADS_PER_POOL: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpspConfig {
    pub max_threads_per_pool: usize,
    pub threshold: usize,
    pub margin: usize,
    /// Pause between two dequeues of a worker; zero only yields.
    pub yield_interval: Duration,
}

impl Default for TpspConfig {
    fn default() -> Self {
        Self::new(2, 1000)
    }
}

impl TpspConfig {
    /// Uses a margin of a quarter of the threshold.
    pub fn new(max_threads_per_pool: usize, threshold: usize) -> Self {
        Self {
            max_threads_per_pool,
            threshold,
            margin: threshold / 4,
            yield_interval: Duration::from_millis(1),
        }
    }

    pub fn with_margin(mut self, margin: usize) -> Self {
        self.margin = margin;
        self
    }

    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.max_threads_per_pool < MIN_THREADS_PER_POOL {
            return Err(LifecycleError::InvalidConfig(format!(
                "max_threads_per_pool must be at least {MIN_THREADS_PER_POOL}"
            )));
        }
        if self.threshold < MIN_THREADS_PER_POOL {
            return Err(LifecycleError::InvalidConfig(format!(
                "threshold {} is below the minimum pool size {MIN_THREADS_PER_POOL}",
                self.threshold
            )));
        }
        if self.margin >= self.threshold || self.threshold - self.margin <= MIN_THREADS_PER_POOL {
            return Err(LifecycleError::InvalidConfig(format!(
                "threshold {} minus margin {} leaves no room above the minimum pool size",
                self.threshold, self.margin
            )));
        }
        Ok(())
    }

    fn grow_above(&self) -> usize {
        self.threshold.saturating_add(self.margin)
    }

    fn shrink_below(&self) -> usize {
        self.threshold - self.margin
    }
}

fn source_worker<T>(
    source: Arc<dyn Source<T>>,
    handler: Arc<dyn EventHandler<T>>,
    running: Arc<AtomicBool>,
    pause: Duration,
) {
    while running.load(Ordering::Acquire) {
        if let Some(event) = source.dequeue() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.handle_event(event))) {
                error!(panic = %panic_message(payload.as_ref()), "event handler panicked");
            }
        }
        if pause.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(pause);
        }
    }
    trace!("source worker stopped");
}

/// Sizes the worker pool of one source from its depth.
pub struct ElasticController<T> {
    name: String,
    source: Arc<dyn Source<T>>,
    handler: Arc<dyn EventHandler<T>>,
    parent: Arc<dyn DequeueInterceptor>,
    config: TpspConfig,
    core: Arc<AtomicBool>,
    /// Running flags of the extra workers, oldest first.
    extras: Mutex<VecDeque<Arc<AtomicBool>>>,
    next_worker: AtomicUsize,
    stopped: AtomicBool,
}

impl<T> ElasticController<T>
where
    T: Send + 'static,
{
    /// Chains in front of the source's current interceptor and starts the
    /// core worker.
    pub fn install(
        name: String,
        source: Arc<dyn Source<T>>,
        handler: Arc<dyn EventHandler<T>>,
        config: TpspConfig,
    ) -> Result<Arc<Self>, LifecycleError> {
        let controller = Arc::new(Self {
            name,
            parent: source.dequeue_interceptor(),
            source: Arc::clone(&source),
            handler,
            config,
            core: Arc::new(AtomicBool::new(true)),
            extras: Mutex::new(VecDeque::new()),
            next_worker: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });
        source.set_dequeue_interceptor(Arc::clone(&controller) as Arc<dyn DequeueInterceptor>);
        if let Err(e) = controller.spawn(Arc::clone(&controller.core)) {
            controller.stop();
            return Err(LifecycleError::Spawn(e));
        }
        debug!(source = %controller.name, "elastic pool started");
        Ok(controller)
    }

    fn spawn(&self, running: Arc<AtomicBool>) -> std::io::Result<()> {
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let source = Arc::clone(&self.source);
        let handler = Arc::clone(&self.handler);
        let pause = self.config.yield_interval;
        thread::Builder::new()
            .name(format!("sedaq-tpsp-{}-{id}", self.name))
            .spawn(move || source_worker(source, handler, running, pause))?;
        metrics::inc_workers_spawned(1);
        Ok(())
    }

    fn grow(&self) {
        let mut extras = self.extras.lock();
        if self.stopped.load(Ordering::Acquire)
            || MIN_THREADS_PER_POOL + extras.len() >= self.config.max_threads_per_pool
        {
            return;
        }
        let running = Arc::new(AtomicBool::new(true));
        match self.spawn(Arc::clone(&running)) {
            Ok(()) => {
                extras.push_back(running);
                debug!(
                    source = %self.name,
                    active = MIN_THREADS_PER_POOL + extras.len(),
                    "elastic pool grew"
                );
            }
            Err(e) => warn!(source = %self.name, error = %e, "could not add worker"),
        }
    }

    fn shrink(&self) {
        let mut extras = self.extras.lock();
        if let Some(running) = extras.pop_front() {
            running.store(false, Ordering::Release);
            metrics::inc_workers_retired(1);
            debug!(
                source = %self.name,
                active = MIN_THREADS_PER_POOL + extras.len(),
                "elastic pool shrank"
            );
        }
    }
}

impl<T> ElasticController<T> {
    pub fn active_workers(&self) -> usize {
        if self.stopped.load(Ordering::Acquire) {
            return 0;
        }
        MIN_THREADS_PER_POOL + self.extras.lock().len()
    }

    /// Stops every worker after its current element and puts the previous
    /// interceptor back on the source.
    pub fn stop(&self) {
        {
            let mut extras = self.extras.lock();
            if self.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            self.core.store(false, Ordering::Release);
            for running in extras.drain(..) {
                running.store(false, Ordering::Release);
            }
        }
        self.source.set_dequeue_interceptor(Arc::clone(&self.parent));
        debug!(source = %self.name, "elastic pool stopped");
    }
}

impl<T> DequeueInterceptor for ElasticController<T>
where
    T: Send + 'static,
{
    fn before(&self, source: &dyn Occupancy) {
        if source.size() > self.config.grow_above() {
            self.grow();
        }
        self.parent.before(source);
    }

    fn after(&self, source: &dyn Occupancy) {
        self.parent.after(source);
        if source.size() < self.config.shrink_below() {
            self.shrink();
        }
    }
}

/// Gives every source of every registered pipeline its own elastic pool.
pub struct TpspThreadManager<T> {
    config: TpspConfig,
    pipelines: DashMap<PipelineKey, Vec<Arc<ElasticController<T>>>>,
    next_source: AtomicUsize,
    disposed: AtomicBool,
}

impl<T> TpspThreadManager<T>
where
    T: Send + 'static,
{
    pub fn new(config: TpspConfig) -> Result<Self, LifecycleError> {
        config.validate()?;
        info!(
            max_threads_per_pool = config.max_threads_per_pool,
            threshold = config.threshold,
            margin = config.margin,
            "elastic thread manager created"
        );
        Ok(Self {
            config,
            pipelines: DashMap::new(),
            next_source: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TpspConfig {
        &self.config
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Active workers per source of `pipeline`, in source order.
    pub fn active_workers(&self, pipeline: &Arc<dyn EventPipeline<T>>) -> Option<Vec<usize>> {
        self.pipelines
            .get(&PipelineKey::of(pipeline))
            .map(|entry| entry.iter().map(|c| c.active_workers()).collect())
    }

    fn ensure_live(&self) -> Result<(), LifecycleError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(LifecycleError::Disposed);
        }
        Ok(())
    }
}

impl<T> TpspThreadManager<T> {
    fn stop_all(&self) {
        let keys: Vec<PipelineKey> = self.pipelines.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, controllers)) = self.pipelines.remove(&key) {
                controllers.iter().for_each(|c| c.stop());
            }
        }
    }
}

impl<T> ThreadManager<T> for TpspThreadManager<T>
where
    T: Send + 'static,
{
    fn register(&self, pipeline: Arc<dyn EventPipeline<T>>) -> Result<(), LifecycleError> {
        self.ensure_live()?;
        let key = PipelineKey::of(&pipeline);
        if let Some((_, previous)) = self.pipelines.remove(&key) {
            debug!(?key, "pipeline re-registered");
            previous.iter().for_each(|c| c.stop());
        }

        let handler = pipeline.event_handler();
        let mut controllers = Vec::new();
        for source in pipeline.sources() {
            let n = self.next_source.fetch_add(1, Ordering::Relaxed);
            match ElasticController::install(
                n.to_string(),
                source,
                Arc::clone(&handler),
                self.config.clone(),
            ) {
                Ok(controller) => controllers.push(controller),
                Err(e) => {
                    controllers.iter().for_each(|c| c.stop());
                    return Err(e);
                }
            }
        }
        self.pipelines.insert(key, controllers);
        Ok(())
    }

    fn deregister(&self, pipeline: &Arc<dyn EventPipeline<T>>) -> Result<bool, LifecycleError> {
        self.ensure_live()?;
        match self.pipelines.remove(&PipelineKey::of(pipeline)) {
            Some((_, controllers)) => {
                controllers.iter().for_each(|c| c.stop());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn deregister_all(&self) -> Result<(), LifecycleError> {
        self.ensure_live()?;
        self.stop_all();
        Ok(())
    }

    fn dispose(&self) -> Result<(), LifecycleError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(LifecycleError::Disposed);
        }
        self.stop_all();
        info!("elastic thread manager disposed");
        Ok(())
    }
}

impl<T> Drop for TpspThreadManager<T> {
    fn drop(&mut self) {
        self.stop_all();
    }
}
