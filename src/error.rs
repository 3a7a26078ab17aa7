//! Error types for routing, router construction, and route refresh.
use std::fmt;
use std::sync::Arc;

/// Boxed error used at transport and provider boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cap the number of stored failures inside [`RetryExhausted`] to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Per-call routing failure, delivered as the result of a call.
#[derive(Debug, Clone)]
pub enum RouteError {
    /// The router was closed before or while the call was waiting.
    RouterClosed,
    /// No routing name of the requested service is served here.
    ServiceNotFound { service: String },
    /// The request's name and aliases resolve to more than one downstream router.
    AmbiguousService { service: String, names: Vec<String> },
    /// The downstream transport failed the call.
    Transport(Arc<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RouterClosed => write!(f, "router closed"),
            Self::ServiceNotFound { service } => write!(f, "service not found: {}", service),
            Self::AmbiguousService { service, names } => {
                write!(f, "ambiguous service {} (routing names: {})", service, names.join(", "))
            }
            Self::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for RouteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl RouteError {
    /// Wrap a transport failure.
    pub fn transport<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Transport(Arc::from(err.into()))
    }

    /// Check if the call failed because the router is closed.
    pub fn is_router_closed(&self) -> bool {
        matches!(self, Self::RouterClosed)
    }

    /// Check if no downstream serves the requested service.
    pub fn is_service_not_found(&self) -> bool {
        matches!(self, Self::ServiceNotFound { .. })
    }

    /// Check if the requested service matched several downstreams.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::AmbiguousService { .. })
    }

    /// Check if the downstream transport failed.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Name of the service that could not be routed, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::ServiceNotFound { service } | Self::AmbiguousService { service, .. } => {
                Some(service)
            }
            _ => None,
        }
    }

    /// Colliding routing names for an ambiguous request.
    pub fn colliding_names(&self) -> Option<&[String]> {
        match self {
            Self::AmbiguousService { names, .. } => Some(names.as_slice()),
            _ => None,
        }
    }
}

/// Invalid router configuration, reported when the router is built.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A router needs at least one service.
    #[error("router requires at least one service")]
    NoServices,
    /// Service names must be non-empty.
    #[error("service name must not be empty")]
    EmptyServiceName,
    /// An aggregate needs at least one server.
    #[error("at least one server is required")]
    NoServers,
    /// An aggregate needs at least one downstream router.
    #[error("at least one router is required")]
    NoRouters,
    /// Two downstream routers claim the same routing name.
    #[error("duplicate service: {name}")]
    DuplicateService {
        /// Routing name claimed twice.
        name: String,
    },
    /// Self-refreshing routers spawn refresh tasks and must be built inside a tokio runtime.
    #[error("self-refreshing router must be created inside a tokio runtime")]
    MissingRuntime,
}

/// Failure to obtain a route from a provider.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum RefreshError {
    /// The backoff policy gave up.
    #[error("exhausted refresh attempts ({attempts} attempts){}", last_suffix(.last))]
    Exhausted {
        /// Provider attempts made in the failed cycle.
        attempts: usize,
        /// Last provider failure, if one was recorded.
        last: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },
    /// The router could not be built from the opened route.
    #[error("invalid router configuration: {0}")]
    Config(#[from] ConfigError),
}

fn last_suffix(last: &Option<Arc<dyn std::error::Error + Send + Sync>>) -> String {
    match last {
        Some(e) => format!("; last error: {}", e),
        None => String::new(),
    }
}

impl RefreshError {
    /// Check if this error reports exhausted attempts.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// All attempts of a retry policy failed.
#[derive(Debug, Clone)]
pub struct RetryExhausted<E> {
    attempts: usize,
    failures: Arc<Vec<E>>,
}

impl<E> RetryExhausted<E> {
    /// Build while enforcing the `MAX_RETRY_FAILURES` cap by keeping the most recent failures.
    pub fn new(attempts: usize, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            failures.into_iter().rev().take(MAX_RETRY_FAILURES).rev().collect()
        } else {
            failures
        };
        Self { attempts, failures: Arc::new(trimmed) }
    }

    /// Attempts made before giving up.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Recorded failures, oldest first.
    pub fn failures(&self) -> &[E] {
        self.failures.as_slice()
    }

    /// Most recent failure.
    pub fn last(&self) -> Option<&E> {
        self.failures.last()
    }

    /// Take the most recent failure; `None` if none were recorded or the list is shared.
    pub fn into_last(self) -> Option<E> {
        Arc::try_unwrap(self.failures).ok().and_then(|mut failures| failures.pop())
    }
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failures.last() {
            Some(last) => {
                write!(f, "retry exhausted after {} attempts; last error: {}", self.attempts, last)
            }
            None => write!(f, "retry exhausted after {} attempts", self.attempts),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryExhausted<E> {}
