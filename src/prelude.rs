//! Convenient re-exports for common Waypoint types.
pub use crate::{
    backoff::{Backoff, BackoffError, MAX_BACKOFF},
    channel::{Channel, Request, Response},
    error::{BoxError, ConfigError, RefreshError, RouteError},
    jitter::Jitter,
    refresh::{
        OpenedRouter, RouteState, RouterProvider, SelfRefreshingOptions, SelfRefreshingRouter,
    },
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    router::{DispatchingRouter, Router},
    service::{Server, ServiceDescriptor},
    signal::Subscription,
    trace::Trace,
};
