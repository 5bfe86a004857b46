//! Binds a [`Dispatcher`] to a TCP listener and drives it with `hyper` 1.x,
//! grounded in the teacher's own `app::app::serve` accept loop.

use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, Result};
use crate::event::{Event, EventListener};
use crate::transport::DispatcherService;

/// An embeddable Engine.IO server: a [`Dispatcher`] plus the `hyper`
/// accept loop and the janitor background task.
pub struct Server {
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(config)),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Bind and serve forever, invoking `event_listener` for connection
    /// errors and readiness, the way the teacher's `App::listen` does.
    pub async fn listen<A, F>(self, address: A, event_listener: F) -> Result<()>
    where
        A: ToSocketAddrs,
        F: Fn(Event) + Send + Sync + 'static,
    {
        let tcp_listener = TcpListener::bind(address)
            .await
            .map_err(|e| EngineError::TransportError(e.to_string()))?;
        let event_listener = EventListener::new(event_listener);

        if self.dispatcher.config().monitor_clients {
            tokio::spawn(crate::janitor::run(
                Arc::clone(self.dispatcher.registry()),
                Arc::clone(self.dispatcher.config()),
            ));
        }

        let addr = tcp_listener
            .local_addr()
            .map_err(|e| EngineError::TransportError(e.to_string()))?;
        event_listener.call(Event::ServerReady(&addr));

        let service = DispatcherService::new(Arc::clone(&self.dispatcher))
            .with_event_listener(event_listener.clone());
        serve(tcp_listener, service, event_listener).await
    }
}

async fn serve(
    tcp_listener: TcpListener,
    service: DispatcherService,
    event_listener: EventListener,
) -> Result<()> {
    loop {
        let (stream, peer_addr) = tcp_listener
            .accept()
            .await
            .map_err(|e| EngineError::TransportError(e.to_string()))?;
        let io = TokioIo::new(stream);
        let service = service.with_remote_addr(peer_addr);
        let event_listener = event_listener.clone();

        tokio::spawn(async move {
            let connection = http1::Builder::new()
                .timer(TokioTimer::new())
                .serve_connection(io, &service)
                .with_upgrades();

            if let Err(error) = connection.await {
                let error = EngineError::TransportError(error.to_string());
                event_listener.call(Event::ConnectionError(&error));
            }
        });
    }
}
