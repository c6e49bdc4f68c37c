pub mod command;
pub mod error;
pub mod multicast;
pub mod pipeline;
pub mod predicate;
pub mod queue;
pub mod thread;
