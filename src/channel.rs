//! Call sinks.
//!
//! A [`Channel`] accepts a call and resolves it exactly once with a response or a
//! [`RouteError`]. Routers are channels themselves, so routing layers nest freely.
//!
//! Two adapters connect channels to tower:
//! - [`ServiceChannel`] turns any `tower::Service<Request>` into a leaf channel.
//! - [`ChannelService`] exposes a channel (usually a [`crate::Router`]) as a
//!   `tower::Service<(Trace, Request)>` so it can sit under tower middleware.

use crate::error::{BoxError, RouteError};
use crate::service::ServiceDescriptor;
use crate::trace::Trace;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::ServiceExt;

/// Opaque response payload.
pub type Response = Vec<u8>;

/// A call addressed to a service. Routers read the service and forward the request unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    service: Arc<ServiceDescriptor>,
    payload: Vec<u8>,
}

impl Request {
    /// Address `payload` to `service`.
    pub fn new(service: Arc<ServiceDescriptor>, payload: impl Into<Vec<u8>>) -> Self {
        Self { service, payload: payload.into() }
    }

    /// Service the caller believes it is invoking.
    pub fn service(&self) -> &Arc<ServiceDescriptor> {
        &self.service
    }

    /// Encoded call body.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take the encoded call body.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// An addressable asynchronous call sink.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send one call. The returned future resolves exactly once.
    async fn call(&self, trace: &Trace, request: Request) -> Result<Response, RouteError>;
}

#[async_trait]
impl<C> Channel for Arc<C>
where
    C: Channel + ?Sized,
{
    async fn call(&self, trace: &Trace, request: Request) -> Result<Response, RouteError> {
        (**self).call(trace, request).await
    }
}

/// Leaf channel backed by a tower service.
#[derive(Clone, Debug)]
pub struct ServiceChannel<S> {
    inner: S,
}

impl<S> ServiceChannel<S> {
    /// Wrap a tower service.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> Channel for ServiceChannel<S>
where
    S: tower_service::Service<Request, Response = Response> + Clone + Send + Sync + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    async fn call(&self, _trace: &Trace, request: Request) -> Result<Response, RouteError> {
        self.inner.clone().oneshot(request).await.map_err(RouteError::transport)
    }
}

/// Tower view of a channel.
pub struct ChannelService<C: ?Sized> {
    channel: Arc<C>,
}

impl<C> ChannelService<C> {
    /// Expose `channel` as a tower service.
    pub fn new(channel: C) -> Self {
        Self { channel: Arc::new(channel) }
    }
}

impl<C: ?Sized> ChannelService<C> {
    /// Expose an already shared channel.
    pub fn from_arc(channel: Arc<C>) -> Self {
        Self { channel }
    }
}

impl<C: ?Sized> Clone for ChannelService<C> {
    fn clone(&self) -> Self {
        Self { channel: self.channel.clone() }
    }
}

impl<C> tower_service::Service<(Trace, Request)> for ChannelService<C>
where
    C: Channel + ?Sized + 'static,
{
    type Response = Response;
    type Error = RouteError;
    type Future = BoxFuture<'static, Result<Response, RouteError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, (trace, request): (Trace, Request)) -> Self::Future {
        let channel = self.channel.clone();
        Box::pin(async move { channel.call(&trace, request).await })
    }
}
