use thiserror::Error;

/// Errors raised by a [`Sink`](crate::core::queue::Sink) when accepting work.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The enqueue predicate (or the physical capacity) refused the elements.
    #[error("not enough room to enqueue {requested} element(s)")]
    Full { requested: usize },

    /// `commit` or `abort` was called on an already finished prepared enqueue.
    #[error("this prepared enqueue has already been processed")]
    AlreadyProcessed,
}

impl SinkError {
    #[inline]
    pub fn full(requested: usize) -> Self {
        SinkError::Full { requested }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, SinkError::Full { .. })
    }
}

/// Misuse of a thread manager or dispatcher lifecycle.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("thread manager must be initialized first")]
    NotInitialized,

    #[error("thread manager is already initialized")]
    AlreadyInitialized,

    #[error("component has already been disposed")]
    Disposed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
