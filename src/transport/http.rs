//! The `hyper` 1.x service adapter (§4.5): translates between
//! `http::Request<Incoming>`/`http::Response<Full<Bytes>>` and the core's
//! framework-agnostic [`Environ`]/[`DispatchResponse`].

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::service::Service;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use crate::dispatcher::{DispatchResponse, Dispatched, Dispatcher, Environ};
use crate::error::EngineError;
use crate::event::{Event, EventListener};

/// A `hyper::service::Service` over a single mounted [`Dispatcher`]. Cheap
/// to clone — one clone per accepted connection, matching the teacher's
/// `AppService` pattern.
pub struct DispatcherService {
    dispatcher: Arc<Dispatcher>,
    event_listener: EventListener,
    remote_addr: Option<SocketAddr>,
}

impl DispatcherService {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            event_listener: EventListener::default(),
            remote_addr: None,
        }
    }

    /// Returns a clone that reports request-handling failures to `event_listener`.
    pub(crate) fn with_event_listener(mut self, event_listener: EventListener) -> Self {
        self.event_listener = event_listener;
        self
    }

    /// Returns a clone scoped to one accepted connection's peer address.
    pub fn with_remote_addr(&self, remote_addr: SocketAddr) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            event_listener: self.event_listener.clone(),
            remote_addr: Some(remote_addr),
        }
    }
}

impl Clone for DispatcherService {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            event_listener: self.event_listener.clone(),
            remote_addr: self.remote_addr,
        }
    }
}

impl Service<Request<Incoming>> for DispatcherService {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let dispatcher = Arc::clone(&self.dispatcher);
        let event_listener = self.event_listener.clone();
        let remote_addr = self.remote_addr;

        Box::pin(async move { Ok(respond(dispatcher, event_listener, request, remote_addr).await) })
    }
}

async fn respond(
    dispatcher: Arc<Dispatcher>,
    event_listener: EventListener,
    request: Request<Incoming>,
    remote_addr: Option<SocketAddr>,
) -> Response<Full<Bytes>> {
    let max_body = dispatcher.config().max_http_buffer_size;
    let (parts, incoming) = request.into_parts();

    let body = match Limited::new(incoming, max_body).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "request body too large"),
    };

    let query = parts
        .uri
        .query()
        .map(Environ::parse_query)
        .unwrap_or_default();

    let environ = Environ {
        method: parts.method.clone(),
        path: parts.uri.path().to_owned(),
        query,
        headers: parts.headers.clone(),
        body,
        remote_addr,
    };
    let is_get = environ.method == Method::GET;

    match dispatcher.handle_request(environ).await {
        Ok(Dispatched::Response(response)) => into_hyper_response(response),
        Ok(Dispatched::Upgrade { session, fresh }) => {
            if !is_get {
                return error_response(StatusCode::BAD_REQUEST, "upgrade must be a GET");
            }
            let upgrade_request = Request::from_parts(parts, ());
            match super::ws::upgrade(upgrade_request, session, fresh) {
                Ok(response) => into_hyper_response(response),
                Err(error) => error_response(error.status_code(), &error.to_string()),
            }
        }
        Err(EngineError::Unauthorized(payload)) => {
            tracing::warn!("connect handler rejected the connection");
            into_hyper_response(DispatchResponse::json(
                StatusCode::UNAUTHORIZED,
                &payload.unwrap_or(serde_json::Value::Null),
            ))
        }
        Err(error) => {
            tracing::warn!(error = %error, "request failed");
            event_listener.call(Event::UncaughtError(&error));
            error_response(error.status_code(), &error.to_string())
        }
    }
}

fn into_hyper_response(response: DispatchResponse) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in response.headers {
            headers.insert(name, value);
        }
    }
    builder
        .body(Full::new(response.body))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=UTF-8")
        .body(Full::new(Bytes::from(message.to_owned())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
