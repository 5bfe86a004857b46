//! Top-level lifecycle events a server listens to (adapted from the
//! teacher's own `event.rs`): connection-level failures, readiness, and
//! uncaught errors surfaced from request handling, distinct from the
//! per-session `connect`/`message`/`disconnect` handlers of §4.4.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::EngineError;

#[derive(Clone, Copy)]
#[non_exhaustive]
pub enum Event<'a> {
    /// A connection to the server failed outside of any single request,
    /// e.g. the client vanished mid-response.
    ConnectionError(&'a EngineError),

    /// The server is ready to accept connections at this address.
    ServerReady(&'a SocketAddr),

    /// A request-handling error that was caught and turned into an HTTP
    /// error response rather than propagated.
    UncaughtError(&'a EngineError),
}

pub(crate) struct EventListener {
    f: Arc<dyn Fn(Event) + Send + Sync + 'static>,
}

impl EventListener {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    pub fn call(&self, event: Event) {
        (self.f)(event)
    }
}

impl Clone for EventListener {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

impl Default for EventListener {
    fn default() -> Self {
        Self::new(|event| match event {
            Event::ConnectionError(error) => tracing::warn!(%error, "connection error"),
            Event::ServerReady(addr) => tracing::info!(%addr, "server ready"),
            Event::UncaughtError(error) => tracing::error!(%error, "uncaught error"),
        })
    }
}
