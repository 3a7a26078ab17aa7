//! Self-refreshing routers: keep a route open across upstream failures.
//!
//! A [`SelfRefreshingRouter`] forwards calls to a delegate router obtained from a
//! [`RouterProvider`]. When the delegate closes, the router parks new calls, asks the provider
//! for a fresh delegate under a [`RetryPolicy`], and replays the parked calls (oldest first)
//! once one is installed.
//!
//! States:
//! - **Active**: a delegate is installed; calls go straight to it. Right after a refresh the
//!   queued calls are flushed one at a time, each after the previous one reached the delegate;
//!   calls arriving during the flush queue behind it.
//! - **Refreshing**: no delegate; calls are queued and the refresh loop is running (or has
//!   given up, see [`SelfRefreshingRouter::is_exhausted`]).
//! - **Closed**: terminal; queued and new calls resolve with
//!   [`RouteError::RouterClosed`](crate::RouteError::RouterClosed).
//!
//! Invariants:
//! - At most one refresh loop runs at a time.
//! - A queued call whose trace goes inactive is dropped from the queue and never resolves.
//! - The refresh schedule restarts from its first step after every successful refresh.
//! - Exhausting the refresh policy reports one [`RefreshError::Exhausted`] and leaves the
//!   router refreshing without further attempts until it is closed.
//!
//! ```rust
//! use waypoint::{
//!     BoxError, Channel, OpenedRouter, Request, Response, RouteError, RouteState, Router,
//!     SelfRefreshingRouter, RetryPolicy, ServiceDescriptor, Trace,
//! };
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Channel for Echo {
//!     async fn call(&self, _trace: &Trace, request: Request) -> Result<Response, RouteError> {
//!         Ok(request.into_payload())
//!     }
//! }
//!
//! fn connect() -> Result<OpenedRouter, BoxError> {
//!     let service = ServiceDescriptor::new("inventory").shared();
//!     Ok(Router::for_channel(Echo, vec![service])?.into())
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let router = SelfRefreshingRouter::new(
//!     connect().unwrap(),
//!     || async { connect() },
//!     RetryPolicy::refresh_default(),
//! )
//! .unwrap();
//! assert_eq!(router.state(), RouteState::Active);
//!
//! let service = router.services()[0].clone();
//! let reply = router.call(&Trace::new(), Request::new(service, b"hi".to_vec())).await;
//! assert_eq!(reply.unwrap(), b"hi".to_vec());
//! # }
//! ```

use crate::backoff::{BackoffStep, BackoffTimer};
use crate::error::{BoxError, ConfigError, RefreshError, RouteError};
use crate::retry::RetryPolicy;
use crate::router::{Dispatch, Route, Router, WeakRouter};
use crate::service::ServiceDescriptor;
use crate::signal::{Signal, Subscription};
use crate::telemetry::{emit_best_effort, RouteEvent, TelemetrySink};
use crate::trace::{Trace, TraceId};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// A router handed out by a [`RouterProvider`], with an optional description of the route.
#[derive(Debug, Clone)]
pub struct OpenedRouter {
    pub router: Router,
    /// Free-form route description (peer address, region, ...), reported on up/down.
    pub context: Option<String>,
}

impl OpenedRouter {
    pub fn new(router: Router) -> Self {
        Self { router, context: None }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl From<Router> for OpenedRouter {
    fn from(router: Router) -> Self {
        Self::new(router)
    }
}

/// Source of fresh delegate routers.
#[async_trait]
pub trait RouterProvider: Send + Sync {
    /// Open a new route.
    async fn open(&self) -> Result<OpenedRouter, BoxError>;
}

#[async_trait]
impl<F, Fut> RouterProvider for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OpenedRouter, BoxError>> + Send + 'static,
{
    async fn open(&self) -> Result<OpenedRouter, BoxError> {
        (self)().await
    }
}

/// Observable state of a [`SelfRefreshingRouter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Active,
    Refreshing,
    Closed,
}

/// Retry policies for [`SelfRefreshingRouter::open`].
#[derive(Debug, Clone)]
pub struct SelfRefreshingOptions {
    open: RetryPolicy,
    refresh: RetryPolicy,
}

impl SelfRefreshingOptions {
    /// [`RetryPolicy::open_default`] for the first route, [`RetryPolicy::refresh_default`]
    /// for every refresh.
    pub fn new() -> Self {
        Self { open: RetryPolicy::open_default(), refresh: RetryPolicy::refresh_default() }
    }

    /// Policy for opening the first route.
    pub fn with_open(mut self, policy: RetryPolicy) -> Self {
        self.open = policy;
        self
    }

    /// Policy for each refresh cycle.
    pub fn with_refresh(mut self, policy: RetryPolicy) -> Self {
        self.refresh = policy;
        self
    }
}

impl Default for SelfRefreshingOptions {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) enum Resume {
    /// Dispatch again.
    Retry,
    /// Send to `delegate` as part of a flush; acknowledge once the call reached it.
    Replay { delegate: Router, ack: oneshot::Sender<()> },
    Fail(RouteError),
}

/// A call waiting for a route.
pub(crate) struct Parked {
    resume: Option<oneshot::Receiver<Resume>>,
    inactivity: Option<Subscription>,
    handle: Option<PendingHandle>,
}

impl Parked {
    /// A call that will never be resumed.
    fn abandoned() -> Self {
        Self { resume: None, inactivity: None, handle: None }
    }

    /// Wait for a resume decision. Never completes if the call is dropped from the queue.
    pub(crate) async fn wait(mut self) -> Resume {
        let outcome = match self.resume.as_mut() {
            Some(rx) => rx.await.ok(),
            None => None,
        };
        match outcome {
            Some(resume) => resume,
            None => std::future::pending().await,
        }
    }
}

impl Drop for Parked {
    fn drop(&mut self) {
        if let Some(inactivity) = &self.inactivity {
            inactivity.unsubscribe();
        }
        if let Some(handle) = &self.handle {
            handle.forget();
        }
    }
}

/// Handle to one queued call, passed to [`SelfRefreshingRouter::on_queue`] handlers.
#[derive(Clone, Debug)]
pub struct PendingHandle {
    seq: u64,
    trace: TraceId,
    refresher: Weak<Refresher>,
}

impl PendingHandle {
    /// Trace of the queued call.
    pub fn trace_id(&self) -> TraceId {
        self.trace
    }

    /// `true` while the call is still queued.
    pub fn is_pending(&self) -> bool {
        self.refresher
            .upgrade()
            .is_some_and(|refresher| refresher.lock_pending().calls.contains_key(&self.seq))
    }

    /// Dispatch the call again now. It queues again if the route is still down.
    ///
    /// Returns `false` if the call already left the queue.
    pub fn retry(&self) -> bool {
        self.resume(Resume::Retry)
    }

    /// Resolve the call with `error` instead of waiting.
    ///
    /// Returns `false` if the call already left the queue.
    pub fn fail(&self, error: RouteError) -> bool {
        self.resume(Resume::Fail(error))
    }

    fn resume(&self, resume: Resume) -> bool {
        match self.refresher.upgrade().and_then(|refresher| refresher.take_pending(self.seq)) {
            Some(call) => call.resume.send(resume).is_ok(),
            None => false,
        }
    }

    fn forget(&self) {
        if let Some(refresher) = self.refresher.upgrade() {
            refresher.take_pending(self.seq);
        }
    }
}

/// Notification that a call was queued while the route is down.
#[derive(Clone, Debug)]
pub struct QueuedCall {
    depth: usize,
    handle: PendingHandle,
}

impl QueuedCall {
    /// Queued calls, including this one.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn handle(&self) -> &PendingHandle {
        &self.handle
    }
}

struct PendingCall {
    trace: TraceId,
    resume: oneshot::Sender<Resume>,
}

#[derive(Default)]
struct PendingCalls {
    next_seq: u64,
    calls: BTreeMap<u64, PendingCall>,
}

struct Delegate {
    router: Router,
    context: Option<String>,
    generation: u64,
    subscription: Subscription,
}

struct Refresher {
    this: OnceLock<WeakRouter>,
    provider: Arc<dyn RouterProvider>,
    policy: RetryPolicy,
    runtime: Handle,
    active: ArcSwapOption<Delegate>,
    pending: Mutex<PendingCalls>,
    timer: Mutex<BackoffTimer>,
    last_failure: Mutex<Option<SharedError>>,
    generation: AtomicU64,
    attempts: AtomicUsize,
    refreshing: AtomicBool,
    flushing: AtomicBool,
    exhausted: AtomicBool,
    on_up: Signal<Option<String>>,
    on_down: Signal<Option<String>>,
    on_error: Signal<RefreshError>,
    on_queue: Signal<QueuedCall>,
    on_event: Signal<RouteEvent>,
}

impl Refresher {
    fn lock_pending(&self) -> MutexGuard<'_, PendingCalls> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timer(&self) -> MutexGuard<'_, BackoffTimer> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_last_failure(&self) -> MutexGuard<'_, Option<SharedError>> {
        self.last_failure.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Closed, or every handle to the router is gone.
    fn is_closed(&self) -> bool {
        match self.this.get().and_then(WeakRouter::upgrade) {
            Some(router) => router.is_closed(),
            None => true,
        }
    }

    fn take_pending(&self, seq: u64) -> Option<PendingCall> {
        self.lock_pending().calls.remove(&seq)
    }

    fn resolve(self: &Arc<Self>, trace: &Trace) -> Route {
        if let Some(delegate) = self.active.load_full() {
            if delegate.router.is_closed() {
                // Closed before its close listener ran; treat the route as lost now.
                self.delegate_lost(delegate.generation);
            } else if !self.flushing.load(Ordering::SeqCst) {
                return Route::Delegate(delegate.router.clone());
            }
        }

        if !trace.is_active() {
            debug!(trace = %trace.id(), "Route refreshing; inactive call dropped");
            return Route::Park(Parked::abandoned());
        }

        let (resume, seq, depth) = {
            let mut pending = self.lock_pending();
            if self.is_closed() {
                return Route::Reject(RouteError::RouterClosed);
            }
            // While a flush runs, new calls line up behind the queued ones.
            if !self.flushing.load(Ordering::SeqCst) {
                if let Some(delegate) = self.active.load_full() {
                    return Route::Delegate(delegate.router.clone());
                }
            }
            let seq = pending.next_seq;
            pending.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            pending.calls.insert(seq, PendingCall { trace: trace.id(), resume: tx });
            (rx, seq, pending.calls.len())
        };

        let weak = Arc::downgrade(self);
        let inactivity = trace.on_inactive(move |id| {
            if let Some(refresher) = weak.upgrade() {
                if refresher.take_pending(seq).is_some() {
                    debug!(trace = %id, "Route refreshing; abandoned call dequeued");
                }
            }
        });
        let handle = PendingHandle { seq, trace: trace.id(), refresher: Arc::downgrade(self) };

        if !trace.is_active() {
            // Went inactive between the check and the subscription.
            self.take_pending(seq);
            return Route::Park(Parked {
                resume: Some(resume),
                inactivity: Some(inactivity),
                handle: None,
            });
        }

        debug!(depth, trace = %trace.id(), "Route refreshing → call queued");
        self.on_queue.emit(&QueuedCall { depth, handle: handle.clone() });
        self.on_event.emit(&RouteEvent::Queued { depth });
        Route::Park(Parked {
            resume: Some(resume),
            inactivity: Some(inactivity),
            handle: Some(handle),
        })
    }

    /// Install `opened` as the delegate. Returns the delegate and the number of queued calls
    /// waiting for it, or `None` if the router closed first.
    fn install(self: &Arc<Self>, opened: OpenedRouter) -> Option<(Arc<Delegate>, usize)> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let subscription = opened.router.on_close(move || {
            if let Some(refresher) = weak.upgrade() {
                refresher.delegate_lost(generation);
            }
        });
        let delegate = Arc::new(Delegate {
            router: opened.router,
            context: opened.context,
            generation,
            subscription,
        });

        let queued = {
            let pending = self.lock_pending();
            if self.is_closed() {
                None
            } else {
                let queued = pending.calls.len();
                self.flushing.store(queued > 0, Ordering::SeqCst);
                self.active.store(Some(delegate.clone()));
                self.refreshing.store(false, Ordering::SeqCst);
                Some(queued)
            }
        };

        match queued {
            Some(queued) => Some((delegate, queued)),
            None => {
                debug!(context = ?delegate.context, "Route opened after close; discarding");
                delegate.subscription.unsubscribe();
                delegate.router.close();
                None
            }
        }
    }

    /// Install a refreshed delegate. `None` if it is already gone.
    fn activate(self: &Arc<Self>, opened: OpenedRouter) -> Option<Arc<Delegate>> {
        self.attempts.store(0, Ordering::SeqCst);
        self.lock_timer().reset();
        *self.lock_last_failure() = None;

        let (delegate, queued) = self.install(opened)?;
        if delegate.router.is_closed() {
            self.delegate_lost(delegate.generation);
            return None;
        }
        info!(context = ?delegate.context, queued, "Route refreshed → active");
        self.emit_up(&delegate.context);
        Some(delegate)
    }

    /// Replay queued calls one at a time, oldest first, each only after the previous one
    /// reached the delegate. Stops early once `delegate` is no longer the active one.
    async fn flush(&self, delegate: &Delegate) {
        let mut replayed = 0usize;
        loop {
            let next = {
                let mut pending = self.lock_pending();
                match self.active.load_full() {
                    Some(current) if current.generation == delegate.generation => {}
                    _ => break,
                }
                match pending.calls.pop_first() {
                    Some((_, call)) => call,
                    None => {
                        self.flushing.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            };
            let (ack, reached) = oneshot::channel();
            let replay = Resume::Replay { delegate: delegate.router.clone(), ack };
            if next.resume.send(replay).is_ok() {
                // Err means the caller went away before dispatching; move on either way.
                let _ = reached.await;
                replayed += 1;
            }
        }
        if replayed > 0 {
            debug!(replayed, "Route flushed queued calls");
        }
    }

    /// Catch a delegate that closed before its close listener was attached.
    fn check_delegate(self: &Arc<Self>, delegate: &Delegate) {
        if delegate.router.is_closed() {
            self.delegate_lost(delegate.generation);
        }
    }

    fn delegate_lost(self: &Arc<Self>, generation: u64) {
        let lost = {
            let _pending = self.lock_pending();
            match self.active.load_full() {
                Some(current) if current.generation == generation => {
                    self.active.store(None);
                    current
                }
                _ => return,
            }
        };
        warn!(context = ?lost.context, "Route lost → refreshing");
        self.emit_down(&lost.context);
        if !self.is_closed() {
            self.start_refresh();
        }
    }

    fn start_refresh(self: &Arc<Self>) {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }
        let refresher = self.clone();
        self.runtime.spawn(async move { refresher.refresh().await });
    }

    async fn refresh(self: Arc<Self>) {
        loop {
            if self.is_closed() {
                break;
            }
            let step = self.lock_timer().next_step();
            let attempt = match step {
                BackoffStep::Exhausted { attempts } => {
                    self.exhaust(attempts);
                    return;
                }
                BackoffStep::Wait { attempt, delay } => {
                    if !delay.is_zero() {
                        debug!(attempt, delay = ?delay, "Route refresh backing off");
                        self.on_event.emit(&RouteEvent::Backoff { attempt, delay });
                        self.policy.sleep(delay).await;
                        if self.is_closed() {
                            break;
                        }
                    }
                    attempt
                }
            };

            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.provider.open().await {
                Ok(opened) => {
                    if let Some(delegate) = self.activate(opened) {
                        self.flush(&delegate).await;
                    }
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Route refresh attempt failed");
                    let error = e.to_string();
                    self.on_event.emit(&RouteEvent::RefreshFailed { attempt, error });
                    *self.lock_last_failure() = Some(Arc::from(e));
                }
            }
        }
        self.refreshing.store(false, Ordering::SeqCst);
    }

    fn exhaust(&self, attempts: usize) {
        let last = self.lock_last_failure().clone();
        error!(attempts, "Route refresh exhausted; staying down");
        self.exhausted.store(true, Ordering::SeqCst);
        self.on_error.emit(&RefreshError::Exhausted { attempts, last });
        self.on_event.emit(&RouteEvent::Exhausted { attempts });
    }

    fn shutdown(&self) {
        let (delegate, drained) = {
            let mut pending = self.lock_pending();
            (self.active.swap(None), std::mem::take(&mut pending.calls))
        };
        if let Some(delegate) = delegate {
            delegate.subscription.unsubscribe();
            delegate.router.close();
            self.emit_down(&delegate.context);
        }
        if !drained.is_empty() {
            debug!(queued = drained.len(), "Route closed; releasing queued calls");
        }
        // Resumed calls re-check the closed flag and fail with RouterClosed.
        for call in drained.into_values() {
            let _ = call.resume.send(Resume::Retry);
        }
        self.on_event.emit(&RouteEvent::Closed);
    }

    fn emit_up(&self, context: &Option<String>) {
        self.on_up.emit(context);
        self.on_event.emit(&RouteEvent::Up { context: context.clone() });
    }

    fn emit_down(&self, context: &Option<String>) {
        self.on_down.emit(context);
        self.on_event.emit(&RouteEvent::Down { context: context.clone() });
    }
}

struct RefreshDispatch {
    refresher: Arc<Refresher>,
}

impl Dispatch for RefreshDispatch {
    fn resolve(&self, trace: &Trace, _service: &ServiceDescriptor) -> Route {
        self.refresher.resolve(trace)
    }

    fn closing(&self) {
        self.refresher.shutdown();
    }

    fn kind(&self) -> &'static str {
        "self-refreshing"
    }
}

/// Router that replaces its delegate whenever the delegate closes.
///
/// Dereferences to [`Router`]; clones share the same route.
#[derive(Clone)]
pub struct SelfRefreshingRouter {
    router: Router,
    refresher: Arc<Refresher>,
}

impl SelfRefreshingRouter {
    /// Start active with `initial` as the delegate; refresh from `provider` under `policy`.
    ///
    /// The router serves `initial`'s services. Must be called inside a tokio runtime.
    pub fn new<P>(
        initial: impl Into<OpenedRouter>,
        provider: P,
        policy: RetryPolicy,
    ) -> Result<Self, ConfigError>
    where
        P: RouterProvider + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| ConfigError::MissingRuntime)?;
        let initial = initial.into();
        let services = initial.router.services().to_vec();
        let refresher = Arc::new(Refresher {
            this: OnceLock::new(),
            provider: Arc::new(provider),
            timer: Mutex::new(policy.timer()),
            policy,
            runtime,
            active: ArcSwapOption::empty(),
            pending: Mutex::new(PendingCalls::default()),
            last_failure: Mutex::new(None),
            generation: AtomicU64::new(0),
            attempts: AtomicUsize::new(0),
            refreshing: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            on_up: Signal::new(),
            on_down: Signal::new(),
            on_error: Signal::new(),
            on_queue: Signal::new(),
            on_event: Signal::new(),
        });
        let dispatch = RefreshDispatch { refresher: refresher.clone() };
        let router = Router::from_dispatch(services, Box::new(dispatch));
        let _ = refresher.this.set(router.downgrade());

        if let Some((delegate, _)) = refresher.install(initial) {
            info!(
                context = ?delegate.context,
                services = router.services().len(),
                "Route opened → active"
            );
            refresher.check_delegate(&delegate);
        }
        Ok(Self { router, refresher })
    }

    /// Open the first route with `options`' open policy, then refresh with its refresh policy.
    pub async fn open<P>(provider: P, options: SelfRefreshingOptions) -> Result<Self, RefreshError>
    where
        P: RouterProvider + 'static,
    {
        let initial = match options.open.execute(|| provider.open()).await {
            Ok(opened) => opened,
            Err(exhausted) => {
                let attempts = exhausted.attempts();
                let last: Option<SharedError> = exhausted.into_last().map(Arc::from);
                error!(attempts, "Route open exhausted");
                return Err(RefreshError::Exhausted { attempts, last });
            }
        };
        Ok(Self::new(initial, provider, options.refresh)?)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn into_router(self) -> Router {
        self.router
    }

    pub fn state(&self) -> RouteState {
        if self.router.is_closed() {
            RouteState::Closed
        } else if self.refresher.active.load().is_some() {
            RouteState::Active
        } else {
            RouteState::Refreshing
        }
    }

    /// Current delegate, if the route is up.
    pub fn active(&self) -> Option<Router> {
        self.refresher.active.load_full().map(|delegate| delegate.router.clone())
    }

    /// Context of the current delegate.
    pub fn context(&self) -> Option<String> {
        self.refresher.active.load_full().and_then(|delegate| delegate.context.clone())
    }

    /// Calls waiting for a route.
    pub fn pending_calls(&self) -> usize {
        self.refresher.lock_pending().calls.len()
    }

    /// Traces of the waiting calls, oldest first.
    pub fn pending_traces(&self) -> Vec<TraceId> {
        self.refresher.lock_pending().calls.values().map(|call| call.trace).collect()
    }

    /// Provider attempts since the last successful refresh.
    pub fn refresh_attempts(&self) -> usize {
        self.refresher.attempts.load(Ordering::SeqCst)
    }

    /// `true` once the refresh policy gave up.
    pub fn is_exhausted(&self) -> bool {
        self.refresher.exhausted.load(Ordering::SeqCst)
    }

    /// Run `handler` each time a delegate is installed by a refresh.
    pub fn on_up<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.refresher.on_up.subscribe(move |context| handler(context.as_deref()))
    }

    /// Run `handler` each time the delegate is lost or torn down.
    pub fn on_down<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.refresher.on_down.subscribe(move |context| handler(context.as_deref()))
    }

    /// Run `handler` when the refresh policy gives up.
    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RefreshError) + Send + Sync + 'static,
    {
        self.refresher.on_error.subscribe(handler)
    }

    /// Run `handler` for every call queued while the route is down.
    pub fn on_queue<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&QueuedCall) + Send + Sync + 'static,
    {
        self.refresher.on_queue.subscribe(handler)
    }

    /// Run `handler` for every [`RouteEvent`].
    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RouteEvent) + Send + Sync + 'static,
    {
        self.refresher.on_event.subscribe(handler)
    }

    /// Forward every [`RouteEvent`] to `sink` on the router's runtime.
    pub fn attach_sink<S>(&self, sink: S) -> Subscription
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        let runtime = self.refresher.runtime.clone();
        self.on_event(move |event| {
            runtime.spawn(emit_best_effort(sink.clone(), event.clone()));
        })
    }
}

impl Deref for SelfRefreshingRouter {
    type Target = Router;

    fn deref(&self) -> &Router {
        &self.router
    }
}

impl From<SelfRefreshingRouter> for Router {
    fn from(router: SelfRefreshingRouter) -> Self {
        router.router
    }
}

impl fmt::Debug for SelfRefreshingRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfRefreshingRouter")
            .field("state", &self.state())
            .field("context", &self.context())
            .field("pending", &self.pending_calls())
            .field("attempts", &self.refresh_attempts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::channel::{Channel, Request, Response};
    use crate::jitter::Jitter;
    use crate::sleeper::TrackingSleeper;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Channel for Echo {
        async fn call(&self, _trace: &Trace, request: Request) -> Result<Response, RouteError> {
            Ok(request.into_payload())
        }
    }

    fn service() -> Arc<ServiceDescriptor> {
        ServiceDescriptor::new("inventory").shared()
    }

    fn leaf() -> Router {
        Router::for_channel(Echo, vec![service()]).unwrap()
    }

    #[derive(Default)]
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<Router, String>>>,
        opened: AtomicUsize,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<Router, String>>) -> Self {
            Self { outcomes: Mutex::new(outcomes.into()), opened: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl RouterProvider for Scripted {
        async fn open(&self) -> Result<OpenedRouter, BoxError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let next = self.outcomes.lock().unwrap().pop_front();
            match next {
                Some(Ok(router)) => Ok(router.into()),
                Some(Err(msg)) => Err(msg.into()),
                None => Err("no more routes".into()),
            }
        }
    }

    fn instant_policy(attempts: usize) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(attempts)
            .backoff(Backoff::constant(Duration::from_millis(10)))
            .with_jitter(Jitter::None)
            .with_sleeper(TrackingSleeper::new())
            .build()
            .unwrap()
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn new_requires_a_runtime() {
        let err = SelfRefreshingRouter::new(leaf(), Scripted::default(), instant_policy(1))
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingRuntime);
    }

    #[tokio::test]
    async fn starts_active_and_forwards() {
        let router =
            SelfRefreshingRouter::new(leaf(), Scripted::default(), instant_policy(1)).unwrap();
        assert_eq!(router.state(), RouteState::Active);
        let out = router.call(&Trace::new(), Request::new(service(), b"x".to_vec())).await;
        assert_eq!(out.unwrap(), b"x".to_vec());
    }

    #[tokio::test]
    async fn delegate_close_triggers_refresh() {
        let first = leaf();
        let provider = Arc::new(Scripted::new(vec![Ok(leaf())]));
        let provider_clone = provider.clone();
        let router = SelfRefreshingRouter::new(
            first.clone(),
            move || {
                let provider = provider_clone.clone();
                async move { provider.open().await }
            },
            instant_policy(3),
        )
        .unwrap();

        first.close();
        settle().await;

        assert_eq!(router.state(), RouteState::Active);
        assert_eq!(provider.opened.load(Ordering::SeqCst), 1);
        assert!(!router.active().unwrap().ptr_eq(&first));
        assert_eq!(router.refresh_attempts(), 0);
    }

    #[tokio::test]
    async fn repeated_loss_runs_a_single_refresh() {
        let first = leaf();
        let provider = Arc::new(Scripted::new(vec![Ok(leaf()), Ok(leaf())]));
        let provider_clone = provider.clone();
        let router = SelfRefreshingRouter::new(
            first.clone(),
            move || {
                let provider = provider_clone.clone();
                async move { provider.open().await }
            },
            instant_policy(3),
        )
        .unwrap();
        let generation = router.refresher.active.load_full().unwrap().generation;

        first.close();
        router.refresher.delegate_lost(generation);
        router.refresher.start_refresh();
        router.refresher.start_refresh();
        settle().await;

        assert_eq!(router.state(), RouteState::Active);
        assert_eq!(provider.opened.load(Ordering::SeqCst), 1);
        assert_eq!(provider.outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closing_an_old_delegate_after_refresh_is_ignored() {
        let first = leaf();
        let second = leaf();
        let provider = Scripted::new(vec![Ok(second.clone())]);
        let router = SelfRefreshingRouter::new(first.clone(), provider, instant_policy(3)).unwrap();

        first.close();
        settle().await;
        assert!(router.active().unwrap().ptr_eq(&second));

        first.close();
        settle().await;
        assert!(router.active().unwrap().ptr_eq(&second));
    }

    #[tokio::test]
    async fn close_tears_down_delegate() {
        let first = leaf();
        let router =
            SelfRefreshingRouter::new(first.clone(), Scripted::default(), instant_policy(1))
                .unwrap();
        router.close();
        assert_eq!(router.state(), RouteState::Closed);
        assert!(first.is_closed());
        assert!(router.active().is_none());
    }

    #[tokio::test]
    async fn exhausted_refresh_stays_down() {
        let first = leaf();
        let provider = Scripted::new(vec![Err("refused".into()), Err("refused".into())]);
        let router = SelfRefreshingRouter::new(first.clone(), provider, instant_policy(2)).unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_clone = errors.clone();
        let _sub = router.on_error(move |err| errors_clone.lock().unwrap().push(err.to_string()));

        first.close();
        settle().await;

        assert_eq!(router.state(), RouteState::Refreshing);
        assert!(router.is_exhausted());
        assert_eq!(router.refresh_attempts(), 2);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("exhausted refresh attempts"));
        assert!(errors[0].contains("refused"));
    }
}
