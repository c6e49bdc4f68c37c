//! Units of work understood by the [`CommandManager`].
//!
//! Everything pushed into a manager's inbox is an [`Event`]:
//!
//! - [`Event::Command`]: executed as soon as a worker drains it.
//! - [`Event::Scheduled`]: parked and executed once its delay elapses,
//!   optionally repeating.
//! - [`Event::Signal`]: broadcast to every handler registered for the
//!   signal's concrete type.
//! - [`Event::Opaque`]: anything else. Dropped on dispatch.

pub mod manager;
pub mod signals;

pub use manager::CommandManager;
pub use signals::{SignalHandler, SignalHandlerRegistry};

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::error;

/// A unit of work. Failures are reported to the manager's
/// [`CommandFailureHandler`] and never reach the worker running it.
pub trait Command: Send + Sync {
    fn execute(&self) -> anyhow::Result<()>;

    /// Label used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<F> Command for F
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self) -> anyhow::Result<()> {
        self()
    }

    fn name(&self) -> &'static str {
        "closure"
    }
}

/// A command that runs once, `delay_interval` after it is drained.
pub trait DelayedCommand: Command {
    fn delay_interval(&self) -> Duration;
}

/// A delayed command that keeps running every `repeat_interval`.
pub trait RepeatedCommand: DelayedCommand {
    fn repeat_interval(&self) -> Duration;

    /// Total number of runs; `0` repeats until the manager is disposed.
    fn number_of_repeats(&self) -> u32;
}

/// Upcast helper so signals can be inspected by concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Broadcast marker. Handlers subscribe per concrete signal type.
pub trait Signal: AsAny + Send + Sync + 'static {}

impl dyn Signal {
    pub fn signal_type(&self) -> TypeId {
        self.as_any().type_id()
    }

    pub fn is<S: Signal>(&self) -> bool {
        self.signal_type() == TypeId::of::<S>()
    }

    pub fn downcast_ref<S: Signal>(&self) -> Option<&S> {
        self.as_any().downcast_ref::<S>()
    }
}

impl fmt::Debug for dyn Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("type", &self.signal_type())
            .finish()
    }
}

/// Repetition settings of a scheduled command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repetition {
    pub interval: Duration,
    /// `0` means forever.
    pub count: u32,
}

/// A command waiting for its delay, with optional repetition.
pub struct Scheduled {
    pub(crate) command: Box<dyn Command>,
    pub(crate) delay: Duration,
    pub(crate) repeat: Option<Repetition>,
}

impl Scheduled {
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn repetition(&self) -> Option<Repetition> {
        self.repeat
    }

    pub fn command(&self) -> &dyn Command {
        &*self.command
    }
}

/// An item travelling through a [`CommandManager`] inbox.
pub enum Event {
    Command(Box<dyn Command>),
    Scheduled(Scheduled),
    Signal(Arc<dyn Signal>),
    Opaque(Box<dyn Any + Send>),
}

impl Event {
    pub fn command<C: Command + 'static>(command: C) -> Self {
        Event::Command(Box::new(command))
    }

    pub fn delayed<C: DelayedCommand + 'static>(command: C) -> Self {
        let delay = command.delay_interval();
        Event::Scheduled(Scheduled {
            command: Box::new(command),
            delay,
            repeat: None,
        })
    }

    pub fn repeated<C: RepeatedCommand + 'static>(command: C) -> Self {
        let delay = command.delay_interval();
        let repeat = Repetition {
            interval: command.repeat_interval(),
            count: command.number_of_repeats(),
        };
        Event::Scheduled(Scheduled {
            command: Box::new(command),
            delay,
            repeat: Some(repeat),
        })
    }

    /// Runs `command` once after `delay`.
    pub fn after<C: Command + 'static>(delay: Duration, command: C) -> Self {
        Event::Scheduled(Scheduled {
            command: Box::new(command),
            delay,
            repeat: None,
        })
    }

    /// Runs `command` after `delay`, then every `interval`, `count` times
    /// in total (`0` = forever).
    pub fn every<C: Command + 'static>(
        delay: Duration,
        interval: Duration,
        count: u32,
        command: C,
    ) -> Self {
        Event::Scheduled(Scheduled {
            command: Box::new(command),
            delay,
            repeat: Some(Repetition { interval, count }),
        })
    }

    pub fn signal<S: Signal>(signal: S) -> Self {
        Event::Signal(Arc::new(signal))
    }

    pub fn opaque<V: Any + Send>(value: V) -> Self {
        Event::Opaque(Box::new(value))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Command(_) => "command",
            Event::Scheduled(s) if s.repeat.is_some() => "repeated",
            Event::Scheduled(_) => "delayed",
            Event::Signal(_) => "signal",
            Event::Opaque(_) => "opaque",
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Command(c) => f.debug_tuple("Command").field(&c.name()).finish(),
            Event::Scheduled(s) => f
                .debug_struct("Scheduled")
                .field("command", &s.command.name())
                .field("delay", &s.delay)
                .field("repeat", &s.repeat)
                .finish(),
            Event::Signal(s) => f.debug_tuple("Signal").field(s).finish(),
            Event::Opaque(_) => f.write_str("Opaque"),
        }
    }
}

/// Decides what happens after a command fails.
pub trait CommandFailureHandler: Send + Sync {
    /// Returns `true` to stop the manager from accepting further work.
    fn handle_command_failure(&self, command: &dyn Command, error: &anyhow::Error) -> bool;
}

/// Swallows failures and keeps going.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCommandFailureHandler;

static NULL_FAILURE_HANDLER: Lazy<Arc<dyn CommandFailureHandler>> =
    Lazy::new(|| Arc::new(NullCommandFailureHandler));

impl NullCommandFailureHandler {
    pub fn shared() -> Arc<dyn CommandFailureHandler> {
        Arc::clone(&NULL_FAILURE_HANDLER)
    }
}

impl CommandFailureHandler for NullCommandFailureHandler {
    fn handle_command_failure(&self, _command: &dyn Command, _error: &anyhow::Error) -> bool {
        false
    }
}

/// Halts the manager on the first failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct StopOnFailure;

impl CommandFailureHandler for StopOnFailure {
    fn handle_command_failure(&self, command: &dyn Command, error: &anyhow::Error) -> bool {
        error!(command = command.name(), error = %error, "command failed; stopping command manager");
        true
    }
}
