//! Run event model and synchronous subscriber fan-out.
//!
//! Events are delivered to every current subscriber, in subscription order, on
//! the emitting task. A panicking handler is logged and skipped; it never
//! reaches the run loop.

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

use super::run::{Run, Step};

/// Identifies a subscription for later removal.
pub type SubscriptionId = u64;

/// Progress events emitted by a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A step is about to call the backend.
    StepStarting { run_id: String, step_number: usize },

    /// A step has been recorded.
    StepComplete { run_id: String, step: Step },

    /// The run reached a terminal status.
    RunComplete { run_id: String, run: Box<Run> },
}

impl RunEvent {
    /// Run this event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            Self::StepStarting { run_id, .. }
            | Self::StepComplete { run_id, .. }
            | Self::RunComplete { run_id, .. } => run_id,
        }
    }
}

/// A run event re-emitted by a fan-out coordinator, tagged with its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedRunEvent {
    /// Subtask id or comparison slot label.
    pub source_id: String,
    /// The underlying event.
    pub event: RunEvent,
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Observer list with handler isolation.
pub struct EventBus<E> {
    handlers: Mutex<Vec<(SubscriptionId, Handler<E>)>>,
    next_id: AtomicU64,
}

impl<E> EventBus<E> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self { handlers: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    /// Register a handler.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `event` to every subscriber.
    pub fn emit(&self, event: &E) {
        // Snapshot so handlers may subscribe/unsubscribe without deadlocking.
        let handlers: Vec<(SubscriptionId, Handler<E>)> = self.lock().clone();
        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(subscription = id, "Event handler panicked; continuing");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Handler<E>)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("subscribers", &self.subscriber_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn starting(n: usize) -> RunEvent {
        RunEvent::StepStarting { run_id: "run-1".into(), step_number: n }
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_: &RunEvent| seen.lock().unwrap().push(tag));
        }

        bus.emit(&starting(1));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        bus.subscribe(|_: &RunEvent| panic!("bad subscriber"));
        let counter = Arc::clone(&count);
        bus.subscribe(move |_: &RunEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&starting(1));
        bus.emit(&starting(2));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let id = bus.subscribe(move |_: &RunEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&starting(1));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&starting(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_run_id_accessor() {
        assert_eq!(starting(3).run_id(), "run-1");
    }
}
