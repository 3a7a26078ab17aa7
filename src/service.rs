//! Service descriptors and servers.
//!
//! A [`ServiceDescriptor`] names a service and the alternate names it can be addressed by.
//! Routers only read descriptors; they are shared as `Arc<ServiceDescriptor>`.

use crate::channel::{Channel, Request, Response, ServiceChannel};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identity of a routable service: a canonical name plus alias keys.
///
/// Only the alias keys take part in routing; the mapped value records the canonical name the
/// alias stands for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    name: String,
    aliases: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    /// Describe a service without aliases.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), aliases: BTreeMap::new() }
    }

    /// Add an alternate routing key that stands for `canonical`.
    pub fn with_alias(mut self, alias: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), canonical.into());
        self
    }

    /// Canonical service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Alias → canonical-name mapping.
    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }

    /// Every name this service can be routed by: its own name first, then alias keys.
    pub fn routing_names(&self) -> Vec<&str> {
        let mut names = Vec::with_capacity(1 + self.aliases.len());
        names.push(self.name.as_str());
        for alias in self.aliases.keys() {
            if alias != &self.name {
                names.push(alias.as_str());
            }
        }
        names
    }

    /// Wrap into an `Arc` for sharing between routers and requests.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A transport endpoint: one channel exposing exactly one service.
#[derive(Clone)]
pub struct Server {
    service: Arc<ServiceDescriptor>,
    channel: Arc<dyn Channel>,
}

impl Server {
    /// Pair a channel with the service it serves.
    pub fn new<C>(service: Arc<ServiceDescriptor>, channel: C) -> Self
    where
        C: Channel + 'static,
    {
        Self { service, channel: Arc::new(channel) }
    }

    /// Serve `service` with a tower service as the transport.
    pub fn from_service<S>(service: Arc<ServiceDescriptor>, inner: S) -> Self
    where
        S: tower_service::Service<Request, Response = Response> + Clone + Send + Sync + 'static,
        S::Error: Into<crate::BoxError>,
        S::Future: Send + 'static,
    {
        Self::new(service, ServiceChannel::new(inner))
    }

    /// Service exposed by this server.
    pub fn service(&self) -> &Arc<ServiceDescriptor> {
        &self.service
    }

    /// Channel calls are sent through.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").field("service", &self.service.name).finish()
    }
}
