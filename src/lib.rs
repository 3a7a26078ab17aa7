#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Waypoint
//!
//! Service-aware RPC routing for async Rust: routers that dispatch calls by service name,
//! aggregate other routers, and keep a route alive across upstream failures.
//!
//! ## Features
//!
//! - **Routers** over any [`Channel`], filtered by service name and aliases
//! - **Aggregation** of many routers behind one routing table, with duplicate and
//!   ambiguity detection
//! - **Close cascade**: an aggregate closes when any of its downstream routers closes
//! - **Self-refreshing routers** that queue calls while a route is down and replay them in
//!   order once a provider hands out a new one
//! - **Retry policies** with constant, linear, exponential, and fibonacci backoff and jitter
//! - **Telemetry** as `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use waypoint::{
//!     Channel, Request, Response, RouteError, Router, Server, ServiceDescriptor, Trace,
//! };
//!
//! struct Upper;
//!
//! #[async_trait::async_trait]
//! impl Channel for Upper {
//!     async fn call(&self, _trace: &Trace, request: Request) -> Result<Response, RouteError> {
//!         Ok(request.payload().to_ascii_uppercase())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let users = ServiceDescriptor::new("users").shared();
//!     let orders = ServiceDescriptor::new("orders").shared();
//!     let router = Router::for_servers(vec![
//!         Server::new(users.clone(), Upper),
//!         Server::new(orders, Upper),
//!     ])
//!     .unwrap();
//!
//!     let reply = router.call(&Trace::new(), Request::new(users, b"hi".to_vec())).await;
//!     assert_eq!(reply.unwrap(), b"HI".to_vec());
//! }
//! ```

pub mod backoff;
pub mod channel;
pub mod error;
pub mod jitter;
pub mod prelude;
pub mod refresh;
pub mod retry;
pub mod router;
pub mod service;
pub mod signal;
pub mod sleeper;
pub mod telemetry;
pub mod trace;

// Re-exports
pub use backoff::{Backoff, BackoffError, BackoffStep, BackoffTimer, MAX_BACKOFF};
pub use channel::{Channel, ChannelService, Request, Response, ServiceChannel};
pub use error::{BoxError, ConfigError, RefreshError, RetryExhausted, RouteError};
pub use jitter::Jitter;
pub use refresh::{
    OpenedRouter, PendingHandle, QueuedCall, RouteState, RouterProvider, SelfRefreshingOptions,
    SelfRefreshingRouter,
};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use router::{DispatchingRouter, Router, WeakRouter};
pub use service::{Server, ServiceDescriptor};
pub use signal::{Signal, Subscription};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{LogSink, MemorySink, NullSink, RouteEvent, StreamingSink, TelemetrySink};
pub use trace::{Trace, TraceId};
