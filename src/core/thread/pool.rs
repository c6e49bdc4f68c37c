//! A bounded pool of detached worker threads fed by a flume channel.
//!
//! `min_workers` threads live for the pool's lifetime. Extra threads are
//! spawned on submission when nobody is idle, up to `max_workers`, and
//! retire after `keep_alive` without work.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use super::panic_message;
use crate::core::error::LifecycleError;
use crate::metrics;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of [`WorkerPool::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// Every worker is busy and the backlog is full; the job was dropped.
    Saturated,
}

struct PoolInner {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    min_workers: usize,
    max_workers: usize,
    keep_alive: Duration,
    live: Mutex<usize>,
    terminated: Condvar,
    idle: AtomicUsize,
    next_id: AtomicUsize,
    abort: AtomicBool,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// A zero `keep_alive` keeps extra workers forever.
    pub fn new(
        name: impl Into<String>,
        min_workers: usize,
        max_workers: usize,
        keep_alive: Duration,
    ) -> Result<Self, LifecycleError> {
        if max_workers == 0 || min_workers > max_workers {
            return Err(LifecycleError::InvalidConfig(format!(
                "worker pool bounds {min_workers}..={max_workers} are empty"
            )));
        }
        let (sender, receiver) = flume::bounded(max_workers);
        let pool = Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                sender: Mutex::new(Some(sender)),
                receiver,
                min_workers,
                max_workers,
                keep_alive,
                live: Mutex::new(0),
                terminated: Condvar::new(),
                idle: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                abort: AtomicBool::new(false),
            }),
        };
        for _ in 0..min_workers {
            pool.spawn_worker()?;
        }
        Ok(pool)
    }

    pub fn execute(&self, job: Job) -> Result<Submission, LifecycleError> {
        let sent = match &*self.inner.sender.lock() {
            Some(sender) => sender.try_send(job),
            None => return Err(LifecycleError::Disposed),
        };
        match sent {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Ok(Submission::Saturated),
            Err(TrySendError::Disconnected(_)) => return Err(LifecycleError::Disposed),
        }

        if self.inner.idle.load(Ordering::Acquire) == 0 && self.live_workers() < self.inner.max_workers {
            if let Err(e) = self.spawn_worker() {
                // the job stays queued for the workers we have
                warn!(pool = %self.inner.name, error = %e, "could not grow worker pool");
            }
        }
        Ok(Submission::Queued)
    }

    pub fn live_workers(&self) -> usize {
        *self.inner.live.lock()
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    fn spawn_worker(&self) -> Result<(), LifecycleError> {
        {
            let mut live = self.inner.live.lock();
            if *live >= self.inner.max_workers {
                return Ok(());
            }
            *live += 1;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{id}", self.inner.name))
            .spawn(move || worker_loop(inner));
        match spawned {
            Ok(_detached) => {
                metrics::inc_workers_spawned(1);
                trace!(pool = %self.inner.name, id, "worker spawned");
                Ok(())
            }
            Err(e) => {
                self.inner.worker_exited();
                Err(LifecycleError::Spawn(e))
            }
        }
    }

    /// Stops accepting jobs and waits up to `wait` for the workers to
    /// exit. Without `force` queued jobs still run; with it they are
    /// discarded and workers exit after their current job.
    ///
    /// Returns `false` if workers were still alive when `wait` ran out.
    pub fn shutdown(&self, force: bool, wait: Duration) -> bool {
        if force {
            self.inner.abort.store(true, Ordering::Release);
            let discarded = self.inner.receiver.drain().count();
            if discarded > 0 {
                debug!(pool = %self.inner.name, discarded, "discarded queued jobs");
            }
        }
        // dropping the only sender disconnects idle workers
        self.inner.sender.lock().take();

        let deadline = Instant::now() + wait;
        let mut live = self.inner.live.lock();
        while *live > 0 {
            if self.inner.terminated.wait_until(&mut live, deadline).timed_out() {
                return *live == 0;
            }
        }
        true
    }
}

impl PoolInner {
    fn worker_exited(&self) {
        let mut live = self.live.lock();
        *live = live.saturating_sub(1);
        self.terminated.notify_all();
    }

    /// Retires the calling worker unless that would go below the core size.
    fn try_retire(&self) -> bool {
        let mut live = self.live.lock();
        if *live <= self.min_workers {
            return false;
        }
        *live -= 1;
        self.terminated.notify_all();
        true
    }

    fn next_job(&self) -> Result<Job, RecvTimeoutError> {
        self.idle.fetch_add(1, Ordering::AcqRel);
        let job = if self.keep_alive.is_zero() {
            self.receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            self.receiver.recv_timeout(self.keep_alive)
        };
        self.idle.fetch_sub(1, Ordering::AcqRel);
        job
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        if inner.abort.load(Ordering::Acquire) {
            break;
        }
        match inner.next_job() {
            Ok(job) => {
                if inner.abort.load(Ordering::Acquire) {
                    break;
                }
                if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                    error!(
                        pool = %inner.name,
                        panic = %panic_message(payload.as_ref()),
                        "job panicked"
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if inner.try_retire() {
                    metrics::inc_workers_retired(1);
                    trace!(pool = %inner.name, "idle worker retired");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    inner.worker_exited();
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::new("test-pool", 2, 4, Duration::ZERO).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            assert_eq!(
                pool.execute(Box::new(move || tx.send(i).unwrap())).unwrap(),
                Submission::Queued
            );
        }
        let mut got: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert!(pool.shutdown(false, Duration::from_secs(2)));
        assert_eq!(pool.live_workers(), 0);
    }

    #[test]
    fn rejects_jobs_after_shutdown() {
        let pool = WorkerPool::new("test-pool", 1, 1, Duration::ZERO).unwrap();
        assert!(pool.shutdown(false, Duration::from_secs(1)));
        assert!(matches!(
            pool.execute(Box::new(|| {})),
            Err(LifecycleError::Disposed)
        ));
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let pool = WorkerPool::new("test-pool", 1, 1, Duration::ZERO).unwrap();
        pool.execute(Box::new(|| panic!("job failure"))).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || tx.send(()).unwrap())).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert_eq!(pool.live_workers(), 1);
        pool.shutdown(true, Duration::from_secs(1));
    }

    #[test]
    fn extra_workers_retire_after_keep_alive() {
        let pool = WorkerPool::new("test-pool", 1, 3, Duration::from_millis(50)).unwrap();
        let (release_tx, release_rx) = flume::unbounded::<()>();
        for _ in 0..3 {
            let release_rx = release_rx.clone();
            pool.execute(Box::new(move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(2));
            }))
            .unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        assert!(pool.live_workers() > 1);
        assert!(pool.live_workers() <= 3);

        drop(release_tx);
        let deadline = Instant::now() + Duration::from_secs(3);
        while pool.live_workers() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.live_workers(), 1);
        pool.shutdown(false, Duration::from_secs(1));
    }

    #[test]
    fn forced_shutdown_discards_the_backlog() {
        let pool = WorkerPool::new("test-pool", 1, 1, Duration::ZERO).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel();
        pool.execute(Box::new(move || {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(100));
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let counter = Arc::clone(&ran);
        pool.execute(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        assert!(pool.shutdown(true, Duration::from_secs(2)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
