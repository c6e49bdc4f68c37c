//! Thread managers: who runs the pipelines and on which threads.
//!
//! - [`TpcThreadManager`]: one shared pool; a control thread wakes every
//!   `sleep_time` and submits a drain task per registered pipeline.
//! - [`TpspThreadManager`]: every source gets its own small pool that grows
//!   and shrinks with the source's depth.

pub mod pool;
pub mod tpc;
pub mod tpsp;

pub use pool::{Submission, WorkerPool};
pub use tpc::{TpcConfig, TpcThreadManager};
pub use tpsp::{ElasticController, TpspConfig, TpspThreadManager};

use std::any::Any;
use std::sync::Arc;

use crate::core::error::LifecycleError;
use crate::core::pipeline::EventPipeline;

/// Owns worker threads and schedules registered pipelines on them.
///
/// Pipelines are identified by their `Arc` allocation; registering the
/// same pipeline again replaces the previous registration.
pub trait ThreadManager<T>: Send + Sync {
    fn register(&self, pipeline: Arc<dyn EventPipeline<T>>) -> Result<(), LifecycleError>;

    /// Returns whether the pipeline was registered.
    fn deregister(&self, pipeline: &Arc<dyn EventPipeline<T>>) -> Result<bool, LifecycleError>;

    fn deregister_all(&self) -> Result<(), LifecycleError>;

    /// Stops every worker. A second call fails with
    /// [`LifecycleError::Disposed`].
    fn dispose(&self) -> Result<(), LifecycleError>;
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");

        let code = 7;
        let payload = std::panic::catch_unwind(|| panic!("code {code}")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(3u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
