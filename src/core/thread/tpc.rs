//! Thread-per-processor manager: one shared pool, one control thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::pool::{Submission, WorkerPool};
use super::{panic_message, ThreadManager};
use crate::core::error::LifecycleError;
use crate::core::pipeline::{EventPipeline, PipelineKey};

/// Settings for a [`TpcThreadManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpcConfig {
    /// `0` detects the number of available processors.
    pub processors: usize,
    pub threads_per_processor: usize,
    /// Pause between two polling rounds.
    pub sleep_time: Duration,
    /// Idle time after which extra pool workers retire.
    pub keep_alive: Duration,
    /// Discard queued drain tasks on dispose instead of letting them run.
    pub force_shutdown: bool,
    /// Elements drained per source and round; `0` drains everything.
    pub dequeue_batch: usize,
}

impl Default for TpcConfig {
    fn default() -> Self {
        Self {
            processors: 0,
            threads_per_processor: 1,
            sleep_time: Duration::from_millis(1000),
            keep_alive: Duration::from_millis(300_000),
            force_shutdown: false,
            dequeue_batch: 0,
        }
    }
}

impl TpcConfig {
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.threads_per_processor == 0 {
            return Err(LifecycleError::InvalidConfig(
                "threads_per_processor must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn effective_processors(&self) -> usize {
        if self.processors > 0 {
            return self.processors;
        }
        thread::available_parallelism().map_or(1, |n| n.get())
    }

    /// Upper bound of the pool: one thread per processor slot, plus one.
    pub fn max_workers(&self) -> usize {
        (self.effective_processors() * self.threads_per_processor + 1).max(2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Disposed,
}

struct PipelineRunner<T> {
    pipeline: Arc<dyn EventPipeline<T>>,
    batch: usize,
}

impl<T> PipelineRunner<T> {
    /// Drains every source into the pipeline's handler. The handler runs
    /// even for an empty batch so time-driven work still advances.
    fn run(&self) {
        let handler = self.pipeline.event_handler();
        for source in self.pipeline.sources() {
            let events = if self.batch == 0 {
                source.dequeue_all()
            } else {
                source.dequeue_many(self.batch)
            };
            let handler = Arc::clone(&handler);
            if let Err(payload) = catch_unwind(AssertUnwindSafe(move || handler.handle_events(events))) {
                error!(
                    panic = %panic_message(payload.as_ref()),
                    "event pipeline handler panicked"
                );
            }
        }
    }
}

struct Control<T> {
    pipelines: DashMap<PipelineKey, Arc<PipelineRunner<T>>>,
    lifecycle: Mutex<Lifecycle>,
    wake: Condvar,
    polling: AtomicBool,
    sleep_time: Duration,
}

impl<T> Control<T>
where
    T: Send + 'static,
{
    fn run(&self, pool: &WorkerPool) {
        loop {
            {
                let mut lifecycle = self.lifecycle.lock();
                while *lifecycle == Lifecycle::Running && self.pipelines.is_empty() {
                    self.polling.store(false, Ordering::Release);
                    trace!("no pipelines registered; control loop idle");
                    self.wake.wait(&mut lifecycle);
                }
                if *lifecycle != Lifecycle::Running {
                    break;
                }
                self.polling.store(true, Ordering::Release);
            }

            let runners: Vec<_> = self
                .pipelines
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            for runner in runners {
                match pool.execute(Box::new(move || runner.run())) {
                    Ok(Submission::Queued) => {}
                    Ok(Submission::Saturated) => {
                        trace!("worker pool saturated; skipping pipeline this round")
                    }
                    Err(e) => {
                        debug!(error = %e, "worker pool refused drain task");
                        break;
                    }
                }
            }

            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Running {
                break;
            }
            self.wake.wait_for(&mut lifecycle, self.sleep_time);
        }
        self.polling.store(false, Ordering::Release);
        debug!("control loop exited");
    }

    fn notify(&self) {
        let _lifecycle = self.lifecycle.lock();
        self.wake.notify_all();
    }
}

/// Polls every registered pipeline on a fixed interval and drains it on a
/// shared worker pool.
///
/// The pool keeps two core workers and grows on demand up to
/// `processors * threads_per_processor + 1` threads. Must be
/// [`initialize`](Self::initialize)d before pipelines can be registered.
pub struct TpcThreadManager<T> {
    config: TpcConfig,
    control: Arc<Control<T>>,
    pool: Mutex<Option<WorkerPool>>,
    control_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T> TpcThreadManager<T>
where
    T: Send + 'static,
{
    pub fn new(config: TpcConfig) -> Self {
        let sleep_time = config.sleep_time;
        Self {
            config,
            control: Arc::new(Control {
                pipelines: DashMap::new(),
                lifecycle: Mutex::new(Lifecycle::Created),
                wake: Condvar::new(),
                polling: AtomicBool::new(false),
                sleep_time,
            }),
            pool: Mutex::new(None),
            control_thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TpcConfig {
        &self.config
    }

    /// Builds the pool and starts the control thread.
    pub fn initialize(&self) -> Result<(), LifecycleError> {
        self.config.validate()?;
        let mut lifecycle = self.control.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running => return Err(LifecycleError::AlreadyInitialized),
            Lifecycle::Disposed => return Err(LifecycleError::Disposed),
        }

        let max_workers = self.config.max_workers();
        let pool = WorkerPool::new("sedaq-tpc", max_workers.min(2), max_workers, self.config.keep_alive)?;

        let control = Arc::clone(&self.control);
        let control_pool = pool.clone();
        let handle = thread::Builder::new()
            .name("sedaq-tpc-control".into())
            .spawn(move || control.run(&control_pool));
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                pool.shutdown(true, Duration::ZERO);
                return Err(LifecycleError::Spawn(e));
            }
        };

        *self.pool.lock() = Some(pool);
        *self.control_thread.lock() = Some(handle);
        *lifecycle = Lifecycle::Running;
        info!(
            max_workers,
            sleep_time = ?self.config.sleep_time,
            "thread-per-processor manager initialized"
        );
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), LifecycleError> {
        match *self.control.lifecycle.lock() {
            Lifecycle::Running => Ok(()),
            Lifecycle::Created => Err(LifecycleError::NotInitialized),
            Lifecycle::Disposed => Err(LifecycleError::Disposed),
        }
    }

    pub fn pipeline_count(&self) -> usize {
        self.control.pipelines.len()
    }

    /// Whether the control thread is currently submitting polling rounds.
    pub fn is_polling(&self) -> bool {
        self.control.polling.load(Ordering::Acquire)
    }

    pub fn live_workers(&self) -> usize {
        self.pool.lock().as_ref().map_or(0, WorkerPool::live_workers)
    }
}

impl<T> ThreadManager<T> for TpcThreadManager<T>
where
    T: Send + 'static,
{
    fn register(&self, pipeline: Arc<dyn EventPipeline<T>>) -> Result<(), LifecycleError> {
        self.ensure_running()?;
        let key = PipelineKey::of(&pipeline);
        let runner = Arc::new(PipelineRunner {
            pipeline,
            batch: self.config.dequeue_batch,
        });
        if self.control.pipelines.insert(key, runner).is_some() {
            debug!(?key, "pipeline re-registered");
        }
        self.control.notify();
        Ok(())
    }

    fn deregister(&self, pipeline: &Arc<dyn EventPipeline<T>>) -> Result<bool, LifecycleError> {
        self.ensure_running()?;
        let removed = self
            .control
            .pipelines
            .remove(&PipelineKey::of(pipeline))
            .is_some();
        if self.control.pipelines.is_empty() {
            self.control.polling.store(false, Ordering::Release);
        }
        Ok(removed)
    }

    fn deregister_all(&self) -> Result<(), LifecycleError> {
        self.ensure_running()?;
        self.control.pipelines.clear();
        self.control.polling.store(false, Ordering::Release);
        Ok(())
    }

    fn dispose(&self) -> Result<(), LifecycleError> {
        {
            let mut lifecycle = self.control.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Disposed => return Err(LifecycleError::Disposed),
                Lifecycle::Created => {
                    *lifecycle = Lifecycle::Disposed;
                    return Ok(());
                }
                Lifecycle::Running => *lifecycle = Lifecycle::Disposed,
            }
            self.control.pipelines.clear();
            self.control.wake.notify_all();
        }

        if let Some(handle) = self.control_thread.lock().take() {
            if handle.join().is_err() {
                error!("control thread panicked");
            }
        }

        if let Some(pool) = self.pool.lock().take() {
            let wait = self.config.sleep_time;
            if !pool.shutdown(self.config.force_shutdown, wait) {
                warn!(
                    ?wait,
                    live = pool.live_workers(),
                    "thread pool took longer than the sleep time to shut down"
                );
            }
        }
        info!("thread-per-processor manager disposed");
        Ok(())
    }
}

impl<T> Drop for TpcThreadManager<T> {
    fn drop(&mut self) {
        let running = *self.control.lifecycle.lock() == Lifecycle::Running;
        if running {
            *self.control.lifecycle.lock() = Lifecycle::Disposed;
            self.control.pipelines.clear();
            self.control.wake.notify_all();
            if let Some(pool) = self.pool.lock().take() {
                pool.shutdown(self.config.force_shutdown, Duration::ZERO);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use super::*;
    use crate::core::pipeline::{EventHandler, SimplePipeline};
    use crate::core::queue::{DefaultQueue, Sink, Source};

    struct Count(Arc<AtomicUsize>);

    impl EventHandler<u32> for Count {
        fn handle_event(&self, _event: u32) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(sleep_ms: u64) -> TpcConfig {
        TpcConfig {
            processors: 1,
            sleep_time: Duration::from_millis(sleep_ms),
            ..TpcConfig::default()
        }
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn pool_bounds_follow_processor_count() {
        let mut config = config(10);
        assert_eq!(config.max_workers(), 2);
        config.processors = 4;
        config.threads_per_processor = 2;
        assert_eq!(config.max_workers(), 9);
        config.threads_per_processor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn lifecycle_is_enforced() {
        let manager = TpcThreadManager::<u32>::new(config(10));
        let queue = Arc::new(DefaultQueue::new());
        let pipeline: Arc<dyn EventPipeline<u32>> = Arc::new(SimplePipeline::new(
            vec![queue as Arc<dyn Source<u32>>],
            Arc::new(Count(Arc::new(AtomicUsize::new(0)))),
        ));

        assert!(matches!(
            manager.register(Arc::clone(&pipeline)),
            Err(LifecycleError::NotInitialized)
        ));
        manager.initialize().unwrap();
        assert!(matches!(manager.initialize(), Err(LifecycleError::AlreadyInitialized)));
        manager.register(pipeline).unwrap();
        manager.dispose().unwrap();
        assert!(matches!(manager.dispose(), Err(LifecycleError::Disposed)));
        assert!(matches!(manager.deregister_all(), Err(LifecycleError::Disposed)));
    }

    #[test]
    fn drains_registered_pipelines() {
        let manager = TpcThreadManager::new(config(10));
        manager.initialize().unwrap();

        let queue = Arc::new(DefaultQueue::<u32>::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let pipeline: Arc<dyn EventPipeline<u32>> = Arc::new(SimplePipeline::new(
            vec![Arc::clone(&queue) as Arc<dyn Source<u32>>],
            Arc::new(Count(Arc::clone(&seen))),
        ));
        manager.register(Arc::clone(&pipeline)).unwrap();
        queue.enqueue_many((0..100).collect()).unwrap();

        assert!(wait_until(Duration::from_secs(3), || seen.load(Ordering::SeqCst) == 100));
        assert!(manager.deregister(&pipeline).unwrap());
        assert!(!manager.deregister(&pipeline).unwrap());
        manager.dispose().unwrap();
    }

    #[test]
    fn re_registering_replaces_the_pipeline() {
        let manager = TpcThreadManager::<u32>::new(config(10));
        manager.initialize().unwrap();
        let pipeline: Arc<dyn EventPipeline<u32>> = Arc::new(SimplePipeline::new(
            vec![Arc::new(DefaultQueue::new()) as Arc<dyn Source<u32>>],
            Arc::new(Count(Arc::new(AtomicUsize::new(0)))),
        ));
        manager.register(Arc::clone(&pipeline)).unwrap();
        manager.register(Arc::clone(&pipeline)).unwrap();
        assert_eq!(manager.pipeline_count(), 1);
        manager.dispose().unwrap();
    }
}
