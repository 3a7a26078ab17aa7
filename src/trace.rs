//! Per-call context.
//!
//! A [`Trace`] travels with a call through every routing layer. Routers read its id and
//! listen for it going inactive (the caller gave up, or a deadline passed); they never
//! create or deactivate traces themselves.

use crate::signal::{Signal, Subscription};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(Uuid);

impl TraceId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for TraceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct TraceInner {
    id: TraceId,
    active: AtomicBool,
    inactive: Signal<TraceId>,
}

/// Call context. Clones share the same activity state.
#[derive(Clone)]
pub struct Trace {
    inner: Arc<TraceInner>,
}

impl Trace {
    /// Start a new active trace with a random id.
    pub fn new() -> Self {
        Self::with_id(TraceId::random())
    }

    /// Start a new active trace with a caller-chosen id.
    pub fn with_id(id: TraceId) -> Self {
        Self {
            inner: Arc::new(TraceInner {
                id,
                active: AtomicBool::new(true),
                inactive: Signal::new(),
            }),
        }
    }

    /// Identifier of this call.
    pub fn id(&self) -> TraceId {
        self.inner.id
    }

    /// `false` once the call has been abandoned.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Mark the call abandoned. Inactivity handlers run once, on the first call only.
    pub fn deactivate(&self) {
        if self.inner.active.swap(false, Ordering::AcqRel) {
            self.inner.inactive.emit_once(&self.inner.id);
        }
    }

    /// Deactivate after `timeout` on the tokio timer. Requires a running runtime.
    pub fn deactivate_after(&self, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let trace = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            trace.deactivate();
        })
    }

    /// Run `handler` once when the call goes inactive.
    ///
    /// Nothing fires for a trace that is already inactive; check [`Trace::is_active`] first.
    pub fn on_inactive<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TraceId) + Send + Sync + 'static,
    {
        self.inner.inactive.subscribe(handler)
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace").field("id", &self.id()).field("active", &self.is_active()).finish()
    }
}
