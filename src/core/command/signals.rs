use std::any::TypeId;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, trace};

use super::Signal;
use crate::core::thread::panic_message;
use crate::metrics;

/// Receives broadcast signals of the types it was registered for.
pub trait SignalHandler: Send + Sync {
    fn handle_signal(&self, signal: &dyn Signal);
}

fn same_handler(a: &Arc<dyn SignalHandler>, b: &Arc<dyn SignalHandler>) -> bool {
    // compare data pointers only; vtable addresses are not unique
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Handlers keyed by the concrete type of the signal they listen for.
///
/// Each type keeps its handlers in registration order. Registering the
/// same handler twice for one type is a no-op, and removing the last
/// handler of a type removes the entry.
#[derive(Default)]
pub struct SignalHandlerRegistry {
    handlers: DashMap<TypeId, Vec<Arc<dyn SignalHandler>>>,
}

impl SignalHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `handler` was already registered for `S`.
    pub fn register<S: Signal>(&self, handler: Arc<dyn SignalHandler>) -> bool {
        self.register_type(TypeId::of::<S>(), handler)
    }

    pub fn register_type(&self, signal_type: TypeId, handler: Arc<dyn SignalHandler>) -> bool {
        let mut entry = self.handlers.entry(signal_type).or_default();
        if entry.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        entry.push(handler);
        true
    }

    /// Returns `false` if `handler` was not registered for `S`.
    pub fn deregister<S: Signal>(&self, handler: &Arc<dyn SignalHandler>) -> bool {
        self.deregister_type(TypeId::of::<S>(), handler)
    }

    pub fn deregister_type(&self, signal_type: TypeId, handler: &Arc<dyn SignalHandler>) -> bool {
        let removed = match self.handlers.get_mut(&signal_type) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|h| !same_handler(h, handler));
                before != entry.len()
            }
            None => false,
        };
        self.handlers
            .remove_if(&signal_type, |_, handlers| handlers.is_empty());
        removed
    }

    pub fn handler_count<S: Signal>(&self) -> usize {
        self.handlers
            .get(&TypeId::of::<S>())
            .map_or(0, |entry| entry.len())
    }

    /// Number of signal types with at least one handler.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Invokes every handler registered for the signal's concrete type, in
    /// registration order. A panicking handler is logged and skipped.
    /// Returns how many handlers ran.
    pub fn dispatch(&self, signal: &dyn Signal) -> usize {
        let signal_type = signal.signal_type();
        // snapshot so handlers may (de)register without deadlocking the map
        let handlers = match self.handlers.get(&signal_type) {
            Some(entry) => entry.value().clone(),
            None => {
                trace!(?signal_type, "no handler for signal");
                return 0;
            }
        };
        for handler in &handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.handle_signal(signal))) {
                error!(
                    ?signal_type,
                    panic = %panic_message(payload.as_ref()),
                    "signal handler panicked"
                );
            }
        }
        metrics::inc_signals_dispatched(1);
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    struct Started;
    impl Signal for Started {}

    struct Stopped;
    impl Signal for Stopped {}

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl SignalHandler for Recorder {
        fn handle_signal(&self, _signal: &dyn Signal) {
            self.log.lock().push(self.label);
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl SignalHandler for Counter {
        fn handle_signal(&self, signal: &dyn Signal) {
            assert!(signal.is::<Started>());
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatches_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = SignalHandlerRegistry::new();
        for label in ["first", "second", "third"] {
            let handler: Arc<dyn SignalHandler> = Arc::new(Recorder {
                label,
                log: Arc::clone(&log),
            });
            assert!(registry.register::<Started>(handler));
        }
        assert_eq!(registry.dispatch(&Started), 3);
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn registration_is_idempotent_per_type() {
        let registry = SignalHandlerRegistry::new();
        let counter = Arc::new(Counter::default());
        let handler: Arc<dyn SignalHandler> = counter.clone();

        assert!(registry.register::<Started>(Arc::clone(&handler)));
        assert!(!registry.register::<Started>(Arc::clone(&handler)));
        assert_eq!(registry.handler_count::<Started>(), 1);

        registry.dispatch(&Started);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removing_last_handler_removes_the_type() {
        let registry = SignalHandlerRegistry::new();
        let handler: Arc<dyn SignalHandler> = Arc::new(Counter::default());
        registry.register::<Started>(Arc::clone(&handler));
        assert_eq!(registry.len(), 1);

        assert!(!registry.deregister::<Stopped>(&handler));
        assert!(registry.deregister::<Started>(&handler));
        assert!(!registry.deregister::<Started>(&handler));
        assert!(registry.is_empty());
    }

    struct Exploding;

    impl SignalHandler for Exploding {
        fn handle_signal(&self, _signal: &dyn Signal) {
            panic!("handler bug");
        }
    }

    #[test]
    fn panicking_handler_does_not_starve_later_ones() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = SignalHandlerRegistry::new();
        registry.register::<Started>(Arc::new(Exploding));
        registry.register::<Started>(Arc::new(Recorder {
            label: "after",
            log: Arc::clone(&log),
        }));

        assert_eq!(registry.dispatch(&Started), 2);
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[test]
    fn unknown_signal_is_a_no_op() {
        let registry = SignalHandlerRegistry::new();
        registry.register::<Started>(Arc::new(Counter::default()));
        assert_eq!(registry.dispatch(&Stopped), 0);
    }
}
