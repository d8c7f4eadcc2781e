//! Receive subscriber registry
//!
//! Maps subscriber IDs to callbacks and fans received frames out to them.
//! The registry lock only guards the subscriber list; callbacks run without
//! it, so a callback may add or remove subscribers (itself included) while a
//! dispatch is in progress.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{trace, warn};

use crate::frame::{Frame, Timestamp};

/// What a subscriber wants after handling a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Keep receiving
    Continue,
    /// Remove this subscriber once the current dispatch pass completes
    Unsubscribe,
}

/// Handle returned by [`SubscriberRegistry::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Callback = Box<dyn FnMut(&Frame, Timestamp) -> Continuation + Send>;

struct Subscriber {
    id: SubscriberId,
    /// Cleared on removal so a pass that already took its snapshot skips it
    active: AtomicBool,
    callback: Mutex<Callback>,
}

/// Thread-safe set of receive callbacks
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback
    pub fn add<F>(&self, callback: F) -> SubscriberId
    where
        F: FnMut(&Frame, Timestamp) -> Continuation + Send + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Arc::new(Subscriber {
            id,
            active: AtomicBool::new(true),
            callback: Mutex::new(Box::new(callback)),
        });
        self.lock().push(subscriber);
        trace!("Subscriber {} added", id);
        id
    }

    /// Remove a callback
    ///
    /// Returns `false` if the ID is not registered. A subscriber removed
    /// while a dispatch is running is not invoked by that dispatch unless its
    /// callback has already started.
    pub fn remove(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        match subscribers.iter().rposition(|s| s.id == id) {
            Some(index) => {
                let subscriber = subscribers.remove(index);
                subscriber.active.store(false, Ordering::Release);
                trace!("Subscriber {} removed", id);
                true
            }
            None => false,
        }
    }

    /// Remove every callback
    pub fn clear(&self) {
        let mut subscribers = self.lock();
        for subscriber in subscribers.drain(..) {
            subscriber.active.store(false, Ordering::Release);
        }
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no callback is registered
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Check if a callback is registered
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.lock().iter().any(|s| s.id == id)
    }

    /// Deliver a frame to every subscriber, latest-added first
    ///
    /// Subscribers returning `Continuation::Unsubscribe` are removed after the
    /// whole pass. A panicking callback is logged and skipped; the remaining
    /// callbacks still run. Returns the number of callbacks invoked.
    pub fn dispatch(&self, frame: &Frame, timestamp: Timestamp) -> usize {
        let snapshot: Vec<Arc<Subscriber>> = self.lock().clone();

        let mut invoked = 0;
        let mut unsubscribed = Vec::new();
        for subscriber in snapshot.iter().rev() {
            if !subscriber.active.load(Ordering::Acquire) {
                continue;
            }

            let mut callback = subscriber
                .callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            invoked += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| (*callback)(frame, timestamp))) {
                Ok(Continuation::Continue) => {}
                Ok(Continuation::Unsubscribe) => unsubscribed.push(subscriber.id),
                Err(_) => warn!("Subscriber {} panicked while handling {:?}", subscriber.id, frame),
            }
        }

        for id in unsubscribed {
            self.remove(id);
        }
        invoked
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Subscriber>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("len", &self.len())
            .finish()
    }
}
