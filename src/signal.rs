//! Listener lists for router lifecycle notifications.
//!
//! A [`Signal`] is a set of handlers that run when the signal is emitted. Every
//! subscription returns a [`Subscription`] token that removes the handler again.
//!
//! Semantics:
//! - Handlers are invoked outside the internal lock, so a handler may subscribe, emit, or close
//!   a router without deadlocking.
//! - Nothing is replayed: a handler subscribed after an emission only sees later emissions.
//! - [`Signal::emit_once`] drains the listener list before firing; use it for one-shot events
//!   such as a router closing or a trace going inactive.
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use waypoint::Signal;
//!
//! let signal = Signal::<u32>::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//! let seen_clone = seen.clone();
//! let sub = signal.subscribe(move |n| {
//!     seen_clone.fetch_add(*n as usize, Ordering::SeqCst);
//! });
//! signal.emit(&2);
//! sub.unsubscribe();
//! signal.emit(&5);
//! assert_eq!(seen.load(Ordering::SeqCst), 2);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

impl<T> Listeners<T> {
    fn new() -> Self {
        Self { next_id: 0, handlers: Vec::new() }
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<T: 'static> Detach for Mutex<Listeners<T>> {
    fn detach(&self, id: u64) {
        let mut guard = self.lock().unwrap_or_else(PoisonError::into_inner);
        guard.handlers.retain(|(existing, _)| *existing != id);
    }
}

/// A set of handlers notified with a `&T` payload.
pub struct Signal<T> {
    listeners: Arc<Mutex<Listeners<T>>>,
}

impl<T: 'static> Signal<T> {
    /// Create a signal with no listeners.
    pub fn new() -> Self {
        Self { listeners: Arc::new(Mutex::new(Listeners::new())) }
    }

    fn lock(&self) -> MutexGuard<'_, Listeners<T>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler; the returned token removes it.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut guard = self.lock();
        let id = guard.next_id;
        guard.next_id += 1;
        guard.handlers.push((id, Arc::new(handler)));
        drop(guard);

        let listeners: Arc<dyn Detach> = self.listeners.clone();
        Subscription { id, listeners: Arc::downgrade(&listeners) }
    }

    /// Notify every current listener, in subscription order.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Handler<T>> =
            self.lock().handlers.iter().map(|(_, handler)| handler.clone()).collect();
        for handler in snapshot {
            handler(value);
        }
    }

    /// Remove every listener, then notify them. Later subscribers see nothing.
    pub fn emit_once(&self, value: &T) {
        let drained = std::mem::take(&mut self.lock().handlers);
        for (_, handler) in drained {
            handler(value);
        }
    }

    /// Number of registered handlers.
    pub fn listener_count(&self) -> usize {
        self.lock().handlers.len()
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.listeners.lock().map(|g| g.handlers.len()).unwrap_or(0);
        f.debug_struct("Signal").field("listeners", &count).finish()
    }
}

/// Token returned by [`Signal::subscribe`]; call [`Subscription::unsubscribe`] to detach.
///
/// Dropping the token leaves the handler registered.
#[must_use = "dropping a subscription keeps the handler registered; keep it to unsubscribe later"]
pub struct Subscription {
    id: u64,
    listeners: Weak<dyn Detach>,
}

impl Subscription {
    /// Remove the handler. Safe to call repeatedly and after the signal is gone.
    pub fn unsubscribe(&self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.detach(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&u32) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = count.clone();
        (count, move |_: &u32| {
            clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn emit_reaches_every_listener() {
        let signal = Signal::new();
        let (a, handler_a) = counter();
        let (b, handler_b) = counter();
        let _sa = signal.subscribe(handler_a);
        let _sb = signal.subscribe(handler_b);

        signal.emit(&1);
        signal.emit(&2);

        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let signal = Signal::new();
        let (count, handler) = counter();
        let sub = signal.subscribe(handler);
        sub.unsubscribe();
        sub.unsubscribe();
        signal.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn emit_once_drains_and_does_not_replay() {
        let signal = Signal::new();
        let (early, handler) = counter();
        let _sub = signal.subscribe(handler);
        signal.emit_once(&1);
        signal.emit_once(&1);
        assert_eq!(early.load(Ordering::SeqCst), 1);

        let (late, handler) = counter();
        let _late = signal.subscribe(handler);
        assert_eq!(late.load(Ordering::SeqCst), 0, "late subscribers get nothing retroactively");
    }

    #[test]
    fn handler_may_reenter_the_signal() {
        let signal = Arc::new(Signal::<u32>::new());
        let inner = signal.clone();
        let nested = Arc::new(AtomicUsize::new(0));
        let nested_clone = nested.clone();
        let _sub = signal.subscribe(move |n| {
            if *n == 0 {
                let nested = nested_clone.clone();
                let _ = inner.subscribe(move |_| {
                    nested.fetch_add(1, Ordering::SeqCst);
                });
                inner.emit(&1);
            }
        });
        signal.emit(&0);
        assert_eq!(nested.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_after_signal_dropped_is_harmless() {
        let signal = Signal::<u32>::new();
        let sub = signal.subscribe(|_| {});
        drop(signal);
        sub.unsubscribe();
    }
}
