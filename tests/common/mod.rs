#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use waypoint::{
    Backoff, BoxError, Channel, Jitter, OpenedRouter, Request, Response, RetryPolicy, RouteError,
    Router, RouterProvider, ServiceDescriptor, Trace, TraceId, TrackingSleeper,
};

/// One call seen by a [`Recording`] channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub trace: TraceId,
    pub service: String,
    pub payload: Vec<u8>,
}

/// Leaf channel that records calls and answers `<tag>:<payload>`.
#[derive(Clone)]
pub struct Recording {
    tag: &'static str,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Recording {
    pub fn new(tag: &'static str) -> Self {
        Self { tag, seen: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.seen().into_iter().map(|s| s.payload).collect()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Channel for Recording {
    async fn call(&self, trace: &Trace, request: Request) -> Result<Response, RouteError> {
        self.seen.lock().unwrap().push(Seen {
            trace: trace.id(),
            service: request.service().name().to_string(),
            payload: request.payload().to_vec(),
        });
        let mut reply = format!("{}:", self.tag).into_bytes();
        reply.extend_from_slice(request.payload());
        Ok(reply)
    }
}

pub fn svc(name: &str) -> Arc<ServiceDescriptor> {
    ServiceDescriptor::new(name).shared()
}

pub fn request(service: &Arc<ServiceDescriptor>, payload: &[u8]) -> Request {
    Request::new(service.clone(), payload.to_vec())
}

pub fn leaf(channel: &Recording, service: &str) -> Router {
    Router::for_channel(channel.clone(), vec![svc(service)]).unwrap()
}

/// Provider that replays scripted outcomes. Optionally gated: each open waits for a permit.
#[derive(Clone)]
pub struct ScriptedProvider {
    outcomes: Arc<Mutex<VecDeque<Result<OpenedRouter, String>>>>,
    opens: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedProvider {
    pub fn new(outcomes: Vec<Result<OpenedRouter, String>>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.into())),
            opens: Arc::new(AtomicUsize::new(0)),
            gate: None,
        }
    }

    pub fn gated(outcomes: Vec<Result<OpenedRouter, String>>) -> Self {
        Self { gate: Some(Arc::new(Semaphore::new(0))), ..Self::new(outcomes) }
    }

    /// Let `n` more opens through the gate.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RouterProvider for ScriptedProvider {
    async fn open(&self) -> Result<OpenedRouter, BoxError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self.outcomes.lock().unwrap().pop_front();
        match next {
            Some(Ok(opened)) => Ok(opened),
            Some(Err(msg)) => Err(msg.into()),
            None => Err("no route available".into()),
        }
    }
}

pub fn up(router: &Router) -> Result<OpenedRouter, String> {
    Ok(router.clone().into())
}

pub fn down(msg: &str) -> Result<OpenedRouter, String> {
    Err(msg.to_string())
}

/// Retry policy with exact linear delays recorded by `sleeper` instead of slept.
pub fn linear_policy(attempts: usize, sleeper: &TrackingSleeper) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(attempts)
        .backoff(Backoff::linear(Duration::from_millis(10)))
        .with_jitter(Jitter::None)
        .with_sleeper(sleeper.clone())
        .build()
        .unwrap()
}

/// Let spawned refresh tasks and woken callers run.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` on a real clock until it holds; panics after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
