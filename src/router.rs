//! Routers: channels that know which services they serve and can be closed.
//!
//! Every router shares one guarded call path. A call first checks the closed flag, then asks
//! the router's dispatch strategy where it should go:
//!
//! - **forward** to a leaf channel,
//! - **delegate** to another router (which applies its own guard),
//! - **reject** with a routing error,
//! - **park** until a route comes back (self-refreshing routers only).
//!
//! A parked call loops back through the guard when resumed, so a call resumed after the router
//! closed resolves with [`RouteError::RouterClosed`]. The loop is iterative; resuming never
//! recurses.
//!
//! Constructors:
//! - [`Router::new`]: forward everything to one channel.
//! - [`Router::for_channel`]: forward only calls for the listed services.
//! - [`Router::for_routers`]: aggregate routers behind one routing table.
//! - [`Router::for_servers`]: one router per server, aggregated when more than one.
//!
//! ```rust
//! use std::sync::Arc;
//! use waypoint::{Channel, Request, Response, RouteError, Router, ServiceDescriptor, Trace};
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
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let foo = ServiceDescriptor::new("foo").shared();
//! let bar = ServiceDescriptor::new("bar").shared();
//! let a = Router::for_channel(Echo, vec![foo.clone()]).unwrap();
//! let b = Router::for_channel(Echo, vec![bar.clone()]).unwrap();
//! let aggregate = Router::for_routers(vec![a, b.clone()]).unwrap();
//!
//! let reply = aggregate.call(&Trace::new(), Request::new(foo.clone(), b"ping".to_vec())).await;
//! assert_eq!(reply.unwrap(), b"ping".to_vec());
//!
//! b.close(); // closing any downstream closes the aggregate
//! let err = aggregate.call(&Trace::new(), Request::new(foo, Vec::new())).await.unwrap_err();
//! assert!(err.is_router_closed());
//! # });
//! ```

use crate::channel::{Channel, Request, Response};
use crate::error::{ConfigError, RouteError};
use crate::refresh::{Parked, Resume};
use crate::service::{Server, ServiceDescriptor};
use crate::signal::{Signal, Subscription};
use crate::trace::Trace;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::Poll;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Where a call goes next.
pub(crate) enum Route {
    Forward(Arc<dyn Channel>),
    Delegate(Router),
    Reject(RouteError),
    Park(Parked),
}

/// Variant-specific half of a router.
pub(crate) trait Dispatch: Send + Sync {
    /// Decide where a call for `service` goes. Runs synchronously and never blocks.
    fn resolve(&self, trace: &Trace, service: &ServiceDescriptor) -> Route;

    /// Runs once, after the closed flag is set and before close listeners fire.
    fn closing(&self) {}

    /// Short label for logs.
    fn kind(&self) -> &'static str;
}

struct RouterInner {
    services: Vec<Arc<ServiceDescriptor>>,
    closed: AtomicBool,
    on_close: Signal<()>,
    dispatch: Box<dyn Dispatch>,
}

/// A channel over a fixed set of services, with an irreversible close.
///
/// Clones are handles to the same router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

/// Non-owning router handle.
#[derive(Clone)]
pub struct WeakRouter {
    inner: Weak<RouterInner>,
}

impl WeakRouter {
    /// The router, if any handle to it is still alive.
    pub fn upgrade(&self) -> Option<Router> {
        self.inner.upgrade().map(|inner| Router { inner })
    }
}

impl fmt::Debug for WeakRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRouter").field("alive", &(self.inner.strong_count() > 0)).finish()
    }
}

fn validate(services: &[Arc<ServiceDescriptor>]) -> Result<(), ConfigError> {
    if services.is_empty() {
        return Err(ConfigError::NoServices);
    }
    if services.iter().any(|svc| svc.name().is_empty()) {
        return Err(ConfigError::EmptyServiceName);
    }
    Ok(())
}

impl Router {
    /// Forward every call for any service to `channel`.
    pub fn new<C>(services: Vec<Arc<ServiceDescriptor>>, channel: C) -> Result<Self, ConfigError>
    where
        C: Channel + 'static,
    {
        validate(&services)?;
        Ok(Self::from_dispatch(services, Box::new(Direct { channel: Arc::new(channel) })))
    }

    pub(crate) fn from_dispatch(
        services: Vec<Arc<ServiceDescriptor>>,
        dispatch: Box<dyn Dispatch>,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                services,
                closed: AtomicBool::new(false),
                on_close: Signal::new(),
                dispatch,
            }),
        }
    }

    /// Forward calls whose service name or aliases match one of `services`; reject the rest
    /// with [`RouteError::ServiceNotFound`].
    pub fn for_channel<C>(
        channel: C,
        services: Vec<Arc<ServiceDescriptor>>,
    ) -> Result<Self, ConfigError>
    where
        C: Channel + 'static,
    {
        Self::for_shared_channel(Arc::new(channel), services)
    }

    fn for_shared_channel(
        channel: Arc<dyn Channel>,
        services: Vec<Arc<ServiceDescriptor>>,
    ) -> Result<Self, ConfigError> {
        validate(&services)?;
        let names = services.iter().map(|svc| svc.name().to_string()).collect();
        Ok(Self::from_dispatch(services, Box::new(ServiceFilter { channel, names })))
    }

    /// Aggregate `routers` behind one routing table.
    ///
    /// Every downstream service's name and alias keys must be claimed by a single downstream;
    /// a name claimed by two different routers fails with [`ConfigError::DuplicateService`].
    /// The aggregate closes as soon as any downstream closes. Closing the aggregate does not
    /// close its downstreams.
    pub fn for_routers(routers: Vec<Router>) -> Result<DispatchingRouter, ConfigError> {
        if routers.is_empty() {
            return Err(ConfigError::NoRouters);
        }

        let mut table: HashMap<String, usize> = HashMap::new();
        for (idx, router) in routers.iter().enumerate() {
            for svc in router.services() {
                for name in svc.routing_names() {
                    match table.get(name) {
                        Some(&owner) if owner != idx => {
                            return Err(ConfigError::DuplicateService { name: name.to_string() });
                        }
                        Some(_) => {}
                        None => {
                            table.insert(name.to_string(), idx);
                        }
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        let services: Vec<Arc<ServiceDescriptor>> = routers
            .iter()
            .flat_map(|router| router.services().iter().cloned())
            .filter(|svc| seen.insert(svc.name().to_string()))
            .collect();

        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let dispatch = RoutingTable {
            table,
            downstream: routers.clone(),
            subscriptions: subscriptions.clone(),
        };
        let router = Self::from_dispatch(services, Box::new(dispatch));

        let upstream = router.downgrade();
        let subs: Vec<Subscription> = routers
            .iter()
            .map(|downstream| {
                let upstream = upstream.clone();
                downstream.on_close(move || {
                    if let Some(aggregate) = upstream.upgrade() {
                        aggregate.close();
                    }
                })
            })
            .collect();
        *subscriptions.lock().unwrap_or_else(PoisonError::into_inner) = subs;

        if router.is_closed() || routers.iter().any(Router::is_closed) {
            router.close();
            detach_all(&subscriptions);
        }

        debug!(downstream = routers.len(), services = %router.describe(), "Router aggregated");
        Ok(DispatchingRouter { router, downstream: routers })
    }

    /// Build one router per server; aggregate them when there is more than one.
    pub fn for_servers(servers: Vec<Server>) -> Result<Self, ConfigError> {
        if servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        let mut routers = servers
            .into_iter()
            .map(|server| {
                Self::for_shared_channel(server.channel().clone(), vec![server.service().clone()])
            })
            .collect::<Result<Vec<_>, _>>()?;
        if routers.len() == 1 {
            if let Some(only) = routers.pop() {
                return Ok(only);
            }
        }
        Ok(Self::for_routers(routers)?.into_router())
    }

    /// Services reachable through this router.
    pub fn services(&self) -> &[Arc<ServiceDescriptor>] {
        &self.inner.services
    }

    /// `true` once [`Router::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the router. Idempotent; only the first call notifies close listeners.
    ///
    /// Safe to call from anywhere, including from inside a close handler or while calls
    /// are in flight.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(services = %self.describe(), kind = self.inner.dispatch.kind(), "Router → closed");
        self.inner.dispatch.closing();
        self.inner.on_close.emit_once(&());
    }

    /// Run `handler` once when the router closes. Nothing fires for an already-closed router.
    pub fn on_close<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.on_close.subscribe(move |_| handler())
    }

    /// Route one call. Resolves with [`RouteError::RouterClosed`] once the router is closed.
    pub fn call<'a>(
        &'a self,
        trace: &'a Trace,
        request: Request,
    ) -> BoxFuture<'a, Result<Response, RouteError>> {
        Box::pin(async move {
            loop {
                if self.is_closed() {
                    return Err(RouteError::RouterClosed);
                }
                match self.inner.dispatch.resolve(trace, request.service()) {
                    Route::Forward(channel) => return channel.call(trace, request).await,
                    Route::Delegate(router) => return router.call(trace, request).await,
                    Route::Reject(err) => {
                        debug!(
                            service = %request.service(),
                            trace = %trace.id(),
                            error = %err,
                            "Router rejected call"
                        );
                        return Err(err);
                    }
                    Route::Park(parked) => match parked.wait().await {
                        Resume::Retry => {}
                        Resume::Replay { delegate, ack } => {
                            if self.is_closed() {
                                return Err(RouteError::RouterClosed);
                            }
                            if !delegate.is_closed() {
                                return handoff(delegate.call(trace, request), ack).await;
                            }
                            // Lost again before the replay; dispatch queues it anew.
                        }
                        Resume::Fail(err) => return Err(err),
                    },
                }
            }
        })
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakRouter {
        WeakRouter { inner: Arc::downgrade(&self.inner) }
    }

    /// `true` if both handles point at the same router.
    pub fn ptr_eq(&self, other: &Router) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn describe(&self) -> String {
        self.inner.services.iter().map(|svc| svc.name()).collect::<Vec<_>>().join(",")
    }
}

/// Poll a replayed call until it has reached its channel, acknowledge, then finish it.
///
/// The flush waits for each acknowledgement before replaying the next queued call.
async fn handoff<F>(mut call: F, ack: oneshot::Sender<()>) -> F::Output
where
    F: Future + Unpin,
{
    let first = futures::poll!(&mut call);
    let _ = ack.send(());
    match first {
        Poll::Ready(out) => out,
        Poll::Pending => call.await,
    }
}

#[async_trait]
impl Channel for Router {
    async fn call(&self, trace: &Trace, request: Request) -> Result<Response, RouteError> {
        Router::call(self, trace, request).await
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("kind", &self.inner.dispatch.kind())
            .field("services", &self.describe())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Aggregate built by [`Router::for_routers`]; keeps its downstream routers for inspection.
#[derive(Clone, Debug)]
pub struct DispatchingRouter {
    router: Router,
    downstream: Vec<Router>,
}

impl DispatchingRouter {
    /// Routers this aggregate dispatches to, in construction order.
    pub fn downstream(&self) -> &[Router] {
        &self.downstream
    }

    /// The aggregate as a plain router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn into_router(self) -> Router {
        self.router
    }
}

impl Deref for DispatchingRouter {
    type Target = Router;

    fn deref(&self) -> &Router {
        &self.router
    }
}

impl From<DispatchingRouter> for Router {
    fn from(aggregate: DispatchingRouter) -> Self {
        aggregate.router
    }
}

struct Direct {
    channel: Arc<dyn Channel>,
}

impl Dispatch for Direct {
    fn resolve(&self, _trace: &Trace, _service: &ServiceDescriptor) -> Route {
        Route::Forward(self.channel.clone())
    }

    fn kind(&self) -> &'static str {
        "direct"
    }
}

struct ServiceFilter {
    channel: Arc<dyn Channel>,
    names: HashSet<String>,
}

impl Dispatch for ServiceFilter {
    fn resolve(&self, _trace: &Trace, service: &ServiceDescriptor) -> Route {
        if service.routing_names().into_iter().any(|name| self.names.contains(name)) {
            Route::Forward(self.channel.clone())
        } else {
            Route::Reject(RouteError::ServiceNotFound { service: service.name().to_string() })
        }
    }

    fn kind(&self) -> &'static str {
        "channel"
    }
}

struct RoutingTable {
    table: HashMap<String, usize>,
    downstream: Vec<Router>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl Dispatch for RoutingTable {
    fn resolve(&self, _trace: &Trace, service: &ServiceDescriptor) -> Route {
        // Check every routing name; an ambiguous match must win over the first hit.
        let mut target: Option<usize> = None;
        let mut ambiguous = false;
        let mut matched: Vec<String> = Vec::new();
        for name in service.routing_names() {
            if let Some(&idx) = self.table.get(name) {
                matched.push(name.to_string());
                match target {
                    None => target = Some(idx),
                    Some(existing) if existing != idx => ambiguous = true,
                    Some(_) => {}
                }
            }
        }

        if ambiguous {
            return Route::Reject(RouteError::AmbiguousService {
                service: service.name().to_string(),
                names: matched,
            });
        }
        match target {
            Some(idx) => Route::Delegate(self.downstream[idx].clone()),
            None => {
                Route::Reject(RouteError::ServiceNotFound { service: service.name().to_string() })
            }
        }
    }

    fn closing(&self) {
        detach_all(&self.subscriptions);
    }

    fn kind(&self) -> &'static str {
        "dispatching"
    }
}

fn detach_all(subscriptions: &Mutex<Vec<Subscription>>) {
    let subs = std::mem::take(&mut *subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
    for sub in subs {
        sub.unsubscribe();
    }
}
