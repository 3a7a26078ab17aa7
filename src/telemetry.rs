//! Route lifecycle events and the sinks that consume them.
//!
//! Self-refreshing routers emit a [`RouteEvent`] each time a route goes up or down, a call
//! is queued, or a refresh attempt fails, backs off, or gives up. Events flow to any
//! `tower::Service<RouteEvent>` attached with
//! [`SelfRefreshingRouter::attach_sink`](crate::SelfRefreshingRouter::attach_sink).
//!
//! ```rust
//! use waypoint::telemetry::{MemorySink, RouteEvent};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(RouteEvent::Queued { depth: 1 }).await.unwrap();
//! assert_eq!(sink.events(), vec![RouteEvent::Queued { depth: 1 }]);
//! # }
//! ```

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Something happened to a self-refreshing route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
    /// A delegate router was installed.
    Up {
        /// Provider-supplied description of the route.
        context: Option<String>,
    },
    /// The delegate router closed or was torn down.
    Down { context: Option<String> },
    /// A call was parked while the route was down.
    Queued {
        /// Parked calls including this one.
        depth: usize,
    },
    /// The refresh loop is waiting before its next attempt.
    Backoff { attempt: usize, delay: Duration },
    /// A provider attempt failed.
    RefreshFailed { attempt: usize, error: String },
    /// The refresh policy gave up; the route stays down.
    Exhausted { attempts: usize },
    /// The self-refreshing router was closed.
    Closed,
}

impl fmt::Display for RouteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteEvent::Up { context } => {
                write!(f, "Route::Up({})", context.as_deref().unwrap_or("-"))
            }
            RouteEvent::Down { context } => {
                write!(f, "Route::Down({})", context.as_deref().unwrap_or("-"))
            }
            RouteEvent::Queued { depth } => write!(f, "Route::Queued(depth={})", depth),
            RouteEvent::Backoff { attempt, delay } => {
                write!(f, "Route::Backoff(attempt={}, delay={:?})", attempt, delay)
            }
            RouteEvent::RefreshFailed { attempt, error } => {
                write!(f, "Route::RefreshFailed(attempt={}, error={})", attempt, error)
            }
            RouteEvent::Exhausted { attempts } => {
                write!(f, "Route::Exhausted(attempts={})", attempts)
            }
            RouteEvent::Closed => write!(f, "Route::Closed"),
        }
    }
}

type SinkFuture = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// A `tower::Service` that consumes route events.
pub trait TelemetrySink:
    Service<RouteEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver one event, honoring `poll_ready`. Sink errors are dropped.
pub async fn emit_best_effort<S>(sink: S, event: RouteEvent)
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<RouteEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: RouteEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event at INFO through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<RouteEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RouteEvent) -> Self::Future {
        tracing::info!(event = %event, "route_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps events in memory, evicting the oldest past its capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RouteEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink holding up to 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of stored events, oldest first.
    pub fn events(&self) -> Vec<RouteEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<RouteEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RouteEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Broadcasts events to every subscribed receiver.
///
/// Slow receivers miss events once the buffer fills; sends with no receivers count as drops.
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: Arc<tokio::sync::broadcast::Sender<RouteEvent>>,
    dropped: Arc<AtomicU64>,
}

impl StreamingSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender: Arc::new(sender), dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Receive every event sent after this call.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RouteEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events sent while nobody was listening.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<RouteEvent> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RouteEvent) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for StreamingSink {
    type SinkError = Infallible;
}
