//! sedaq – staged event-driven queues, command dispatch and thread managers.
//!
//! This crate exports
//!  * `core`    – queues, admission predicates, the command manager and the
//!    thread managers that drive pipelines
//!  * `config`  – TOML-driven runtime configuration
//!  * `logging` – tracing subscriber setup
//!  * `metrics` – process-wide counters
//!
//! A typical embedding creates a [`CommandManager`], registers it with a
//! [`TpcThreadManager`] and pushes [`Event`]s into its command sink.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config};
pub use core::command::{
    Command, CommandFailureHandler, CommandManager, DelayedCommand, Event,
    NullCommandFailureHandler, RepeatedCommand, Signal, SignalHandler, StopOnFailure,
};
pub use core::error::{LifecycleError, SinkError};
pub use core::pipeline::{EventHandler, EventPipeline, SimplePipeline};
pub use core::predicate::{
    EnqueuePredicate, NullEnqueuePredicate, RateLimitingPredicate, ThresholdEnqueuePredicate,
};
pub use core::queue::{DefaultQueue, FixedSizeQueue, Queue, Sink, Source};
pub use core::thread::{TpcConfig, TpcThreadManager, ThreadManager, TpspConfig, TpspThreadManager};
