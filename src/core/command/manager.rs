//! The command dispatcher.
//!
//! A [`CommandManager`] owns an inbox queue and is itself an
//! [`EventPipeline`]: register it with a thread manager and every drained
//! batch is classified and executed here. Delayed and repeated commands
//! wait in a pending list that is scanned once after every batch, so their
//! timing resolution is the polling interval of whatever drives the
//! manager.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::{
    Command, CommandFailureHandler, Event, NullCommandFailureHandler, Repetition, Scheduled,
    Signal, SignalHandler, SignalHandlerRegistry,
};
use crate::core::error::{LifecycleError, SinkError};
use crate::core::pipeline::{EventHandler, EventPipeline};
use crate::core::predicate::{EnqueuePredicate, QueueState};
use crate::core::queue::{DefaultQueue, Occupancy, Sink, Source};
use crate::core::thread::panic_message;
use crate::metrics;

/// Inbox admission: closed for good once the manager stops, otherwise
/// defers to an optional inner predicate.
#[derive(Debug)]
struct InboxGate {
    open: AtomicBool,
    inner: Option<Arc<dyn EnqueuePredicate>>,
}

impl InboxGate {
    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl EnqueuePredicate for InboxGate {
    fn accept(&self, count: usize, state: &QueueState) -> bool {
        self.is_open() && self.inner.as_ref().map_or(true, |p| p.accept(count, state))
    }
}

/// A parked delayed or repeated command.
struct DelayedCommandInfo {
    command: Box<dyn Command>,
    next_run_time: Instant,
    num_executions: u32,
    repeat: Option<Repetition>,
}

impl DelayedCommandInfo {
    fn new(scheduled: Scheduled) -> Self {
        Self {
            command: scheduled.command,
            next_run_time: Instant::now() + scheduled.delay,
            num_executions: 0,
            repeat: scheduled.repeat,
        }
    }

    fn repeatable(&self) -> bool {
        self.repeat.is_some()
    }

    /// Computes the next run after an execution; `false` when finished.
    fn reschedule(&mut self, now: Instant) -> bool {
        match self.repeat {
            Some(Repetition { interval, count })
                if count == 0 || self.num_executions < count =>
            {
                self.next_run_time = now + interval;
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Disposing,
}

struct Dispatcher {
    inbox: Arc<DefaultQueue<Event>>,
    gate: Arc<InboxGate>,
    signals: SignalHandlerRegistry,
    failure_handler: RwLock<Arc<dyn CommandFailureHandler>>,
    delayed: Mutex<VecDeque<DelayedCommandInfo>>,
    /// Set by dispose; guarded by the `delayed` lock.
    retired: AtomicBool,
}

impl Dispatcher {
    fn classify(&self, event: Event, phase: Phase) {
        match event {
            Event::Command(command) => self.execute(&*command),
            Event::Scheduled(scheduled) => match phase {
                Phase::Running => {
                    trace!(command = scheduled.command.name(), delay = ?scheduled.delay, "parking delayed command");
                    let mut delayed = self.delayed.lock();
                    if self.retired.load(Ordering::Acquire) {
                        drop(delayed);
                        self.execute(&*scheduled.command);
                    } else {
                        delayed.push_back(DelayedCommandInfo::new(scheduled));
                    }
                }
                // disposal does not wait for delays
                Phase::Disposing => self.execute(&*scheduled.command),
            },
            Event::Signal(signal) => self.broadcast(&*signal),
            Event::Opaque(_) => trace!("dropping unrecognized inbox item"),
        }
    }

    fn broadcast(&self, signal: &dyn Signal) {
        let handled = self.signals.dispatch(signal);
        trace!(handled, "signal dispatched");
    }

    fn execute(&self, command: &dyn Command) {
        let outcome = catch_unwind(AssertUnwindSafe(|| command.execute())).unwrap_or_else(|payload| {
            Err(anyhow!("command panicked: {}", panic_message(payload.as_ref())))
        });

        let error = match outcome {
            Ok(()) => {
                metrics::inc_commands_executed(1);
                return;
            }
            Err(error) => error,
        };

        metrics::inc_command_failures(1);
        warn!(command = command.name(), error = %error, "command failed");
        let handler = Arc::clone(&*self.failure_handler.read());
        if handler.handle_command_failure(command, &error) {
            self.stop();
        }
    }

    /// Closes the inbox and discards whatever it still buffers, atomically
    /// with respect to producers.
    fn stop(&self) {
        let discarded = self.inbox.seal_and_drain(|| self.gate.close());
        warn!(
            discarded = discarded.len(),
            "command manager stopped accepting work"
        );
    }

    /// Runs every due pending command once, oldest registration first.
    fn run_due(&self) {
        let pending = std::mem::take(&mut *self.delayed.lock());
        if pending.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut keep = VecDeque::with_capacity(pending.len());
        for mut info in pending {
            if info.next_run_time > now {
                keep.push_back(info);
                continue;
            }
            self.execute(&*info.command);
            metrics::inc_delayed_executed(1);
            info.num_executions = info.num_executions.saturating_add(1);
            if info.reschedule(Instant::now()) {
                keep.push_back(info);
            } else {
                trace!(
                    command = info.command.name(),
                    runs = info.num_executions,
                    repeatable = info.repeatable(),
                    "delayed command finished"
                );
            }
        }

        // commands parked while we were executing go after the survivors
        let mut delayed = self.delayed.lock();
        if self.retired.load(Ordering::Acquire) {
            return;
        }
        keep.append(&mut delayed);
        *delayed = keep;
    }
}

impl EventHandler<Event> for Dispatcher {
    fn handle_event(&self, event: Event) {
        self.classify(event, Phase::Running);
    }

    fn handle_events(&self, events: Vec<Event>) {
        for event in events {
            self.classify(event, Phase::Running);
        }
        self.run_due();
    }
}

/// Executes commands, schedules delayed and repeated ones, and broadcasts
/// signals.
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use sedaq::{CommandManager, Event, EventPipeline, TpcConfig, TpcThreadManager, ThreadManager};
///
/// let manager = Arc::new(CommandManager::new());
/// let threads = TpcThreadManager::new(TpcConfig::default());
/// threads.initialize()?;
/// threads.register(manager.clone() as Arc<dyn EventPipeline<Event>>)?;
///
/// manager.command_sink().enqueue(Event::after(Duration::from_secs(1), || -> anyhow::Result<()> {
///     println!("one second later");
///     Ok(())
/// }))?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct CommandManager {
    dispatcher: Arc<Dispatcher>,
    disposed: AtomicBool,
}

impl Default for CommandManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandManager {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Adds an admission policy (threshold, rate limit) to the inbox.
    pub fn with_predicate(predicate: Arc<dyn EnqueuePredicate>) -> Self {
        Self::build(Some(predicate))
    }

    fn build(inner: Option<Arc<dyn EnqueuePredicate>>) -> Self {
        let gate = Arc::new(InboxGate {
            open: AtomicBool::new(true),
            inner,
        });
        let inbox = Arc::new(DefaultQueue::with_predicate(
            Arc::clone(&gate) as Arc<dyn EnqueuePredicate>
        ));
        Self {
            dispatcher: Arc::new(Dispatcher {
                inbox,
                gate,
                signals: SignalHandlerRegistry::new(),
                failure_handler: RwLock::new(NullCommandFailureHandler::shared()),
                delayed: Mutex::new(VecDeque::new()),
                retired: AtomicBool::new(false),
            }),
            disposed: AtomicBool::new(false),
        }
    }

    /// Where producers submit work.
    pub fn command_sink(&self) -> Arc<dyn Sink<Event>> {
        Arc::clone(&self.dispatcher.inbox) as Arc<dyn Sink<Event>>
    }

    /// Shorthand for `command_sink().enqueue(event)`.
    pub fn submit(&self, event: Event) -> Result<(), SinkError> {
        self.dispatcher.inbox.enqueue(event)
    }

    pub fn set_dequeue_timeout(&self, timeout: Duration) {
        self.dispatcher.inbox.set_timeout(timeout);
    }

    pub fn set_command_failure_handler(&self, handler: Arc<dyn CommandFailureHandler>) {
        *self.dispatcher.failure_handler.write() = handler;
    }

    pub fn command_failure_handler(&self) -> Arc<dyn CommandFailureHandler> {
        Arc::clone(&*self.dispatcher.failure_handler.read())
    }

    pub fn register_signal_handler<S: Signal>(&self, handler: Arc<dyn SignalHandler>) -> bool {
        self.dispatcher.signals.register::<S>(handler)
    }

    pub fn deregister_signal_handler<S: Signal>(&self, handler: &Arc<dyn SignalHandler>) -> bool {
        self.dispatcher.signals.deregister::<S>(handler)
    }

    /// `false` once a failure handler asked to stop, or after disposal.
    pub fn is_accepting(&self) -> bool {
        self.dispatcher.gate.is_open()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of delayed or repeated commands waiting to run.
    pub fn pending_delayed(&self) -> usize {
        self.dispatcher.delayed.lock().len()
    }

    pub fn inbox_size(&self) -> usize {
        self.dispatcher.inbox.size()
    }

    /// Closes the inbox and runs everything still buffered in it once,
    /// delayed commands included. Commands already parked waiting for
    /// their delay are dropped.
    pub fn dispose(&self) -> Result<(), LifecycleError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(LifecycleError::Disposed);
        }

        let dispatcher = &self.dispatcher;
        let remaining = dispatcher.inbox.seal_and_drain(|| dispatcher.gate.close());
        let drained = remaining.len();
        for event in remaining {
            dispatcher.classify(event, Phase::Disposing);
        }

        let abandoned = {
            let mut delayed = dispatcher.delayed.lock();
            dispatcher.retired.store(true, Ordering::Release);
            let n = delayed.len();
            delayed.clear();
            n
        };
        if abandoned > 0 {
            debug!(abandoned, "dropping delayed commands that were not yet due");
        }
        info!(drained, "command manager disposed");
        Ok(())
    }
}

impl EventPipeline<Event> for CommandManager {
    fn sources(&self) -> Vec<Arc<dyn Source<Event>>> {
        vec![Arc::clone(&self.dispatcher.inbox) as Arc<dyn Source<Event>>]
    }

    fn event_handler(&self) -> Arc<dyn EventHandler<Event>> {
        Arc::clone(&self.dispatcher) as Arc<dyn EventHandler<Event>>
    }
}
