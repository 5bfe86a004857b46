//! The Dispatcher (§4.4): the single HTTP entry point, the session
//! registry, and the application-facing `send`/`disconnect`/`on` surface.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{CorsAllowedOrigins, ServerConfig};
use crate::error::{DisconnectReason, EngineError};
use crate::packet::{Data, Packet};
use crate::payload::Payload;
use crate::session::{Session, SessionRegistry, TransportKind};

/// A framework-agnostic view of an inbound request (§4.5 `translateRequest`).
/// The only thing the core ever reads from the embedding HTTP framework.
#[derive(Debug, Clone)]
pub struct Environ {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

impl Environ {
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parse a `foo=bar&baz=qux` query string into the map this type holds.
    pub fn parse_query(raw: &str) -> HashMap<String, String> {
        let mut out = HashMap::new();
        for pair in raw.split('&').filter(|s| !s.is_empty()) {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default();
            let key = percent_encoding::percent_decode_str(key)
                .decode_utf8_lossy()
                .into_owned();
            let value = percent_encoding::percent_decode_str(value)
                .decode_utf8_lossy()
                .into_owned();
            out.insert(key, value);
        }
        out
    }
}

/// The response the dispatcher wants written back, independent of any HTTP
/// library (§4.5 `makeResponse`).
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Bytes,
}

impl DispatchResponse {
    fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: vec![(
                HeaderName::from_static("content-type"),
                HeaderValue::from_static("text/plain; charset=UTF-8"),
            )],
            body: body.into(),
        }
    }

    pub(crate) fn json(status: StatusCode, value: &Value) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self {
            status,
            headers: vec![(
                HeaderName::from_static("content-type"),
                HeaderValue::from_static("application/json"),
            )],
            body: Bytes::from(body),
        }
    }

    fn push_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.push((name, value));
    }
}

/// The outcome of [`Dispatcher::handle_request`]: either a complete
/// response, or a request that the framework-specific transport layer must
/// hand off to the WebSocket upgrade path (§4.3 upgrade steps).
pub enum Dispatched {
    Response(DispatchResponse),
    Upgrade {
        session: Arc<Session>,
        /// True when this is a brand new handshake that arrived over
        /// WebSocket directly (§4.3 step 2); false when it is a probe
        /// upgrade of an existing polling session (§4.3 step 1).
        fresh: bool,
    },
}

type ConnectHandlerFn = Box<dyn Fn(&str, &Environ) -> ConnectResult + Send + Sync>;
type MessageHandlerFn = Box<dyn Fn(&str, &Data) + Send + Sync>;
type DisconnectHandlerFn = Box<dyn Fn(&str, DisconnectReason) + Send + Sync>;

/// What a `connect` handler decided (§4.4 connect event).
pub enum ConnectResult {
    Accept,
    Reject(Option<Value>),
}

/// The three events an application may subscribe to, matching the
/// `{connect, message, disconnect}` set named in §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    Connect,
    Message,
    Disconnect,
}

impl FromStr for EventName {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(Self::Connect),
            "message" => Ok(Self::Message),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(EngineError::UnknownEvent(other.to_owned())),
        }
    }
}

/// Exactly-one-handler-per-event registry (§4.4). Each slot may be filled
/// once; later callers should use the typed `Dispatcher::on_*` methods.
#[derive(Default)]
pub struct Handlers {
    connect: OnceLock<ConnectHandlerFn>,
    message: OnceLock<MessageHandlerFn>,
    disconnect: OnceLock<DisconnectHandlerFn>,
}

impl Handlers {
    pub fn set_connect(&self, f: impl Fn(&str, &Environ) -> ConnectResult + Send + Sync + 'static) {
        let _ = self.connect.set(Box::new(f));
    }

    pub fn set_message(&self, f: impl Fn(&str, &Data) + Send + Sync + 'static) {
        let _ = self.message.set(Box::new(f));
    }

    pub fn set_disconnect(&self, f: impl Fn(&str, DisconnectReason) + Send + Sync + 'static) {
        let _ = self.disconnect.set(Box::new(f));
    }

    pub fn call_connect(&self, sid: &str, environ: &Environ) -> ConnectResult {
        match self.connect.get() {
            Some(f) => f(sid, environ),
            None => ConnectResult::Accept,
        }
    }

    pub fn call_message(&self, sid: &str, data: &Data) {
        if let Some(f) = self.message.get() {
            f(sid, data);
        }
    }

    pub fn call_disconnect(&self, sid: &str, reason: DisconnectReason) {
        if let Some(f) = self.disconnect.get() {
            f(sid, reason);
        }
    }
}

/// The Dispatcher (§4.4): routes HTTP requests, owns the session registry,
/// and is the application's handle onto the running server.
pub struct Dispatcher {
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    handlers: Arc<Handlers>,
}

impl Dispatcher {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            handlers: Arc::new(Handlers::default()),
        }
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn on_connect(&self, f: impl Fn(&str, &Environ) -> ConnectResult + Send + Sync + 'static) {
        self.handlers.set_connect(f);
    }

    pub fn on_message(&self, f: impl Fn(&str, &Data) + Send + Sync + 'static) {
        self.handlers.set_message(f);
    }

    pub fn on_disconnect(&self, f: impl Fn(&str, DisconnectReason) + Send + Sync + 'static) {
        self.handlers.set_disconnect(f);
    }

    /// Validate an event name the way `Server.on` does in the original;
    /// the typed `on_*` methods above are the actual registration surface.
    pub fn on(&self, event: &str) -> Result<EventName, EngineError> {
        event.parse()
    }

    /// A UUID v4 with hyphens stripped, mirroring `Server.generate_id`
    /// (`uuid.uuid4().hex`) in the original implementation.
    pub fn generate_sid(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Programmatic send (§4.4): unknown sid is a soft no-op.
    pub async fn send(&self, sid: &str, packet: Packet) {
        if let Some(session) = self.registry.get(sid) {
            let _ = session.send(packet, false).await;
        }
    }

    /// Programmatic disconnect (§4.4): `None` closes every session and
    /// empties the registry, exactly as `Server.close()` does.
    pub async fn disconnect(&self, sid: Option<&str>) {
        match sid {
            Some(sid) => {
                if let Some(session) = self.registry.get(sid) {
                    session.close(true, false, DisconnectReason::ServerDisconnect).await;
                }
            }
            None => {
                for session in self.registry.all() {
                    session.close(false, true, DisconnectReason::ServerDisconnect).await;
                }
                self.registry.clear();
            }
        }
    }

    /// The single HTTP entry point (§4.4 `handleRequest`).
    pub async fn handle_request(&self, environ: Environ) -> Result<Dispatched, EngineError> {
        if environ.method == Method::OPTIONS {
            return Ok(Dispatched::Response(self.preflight_response(&environ)));
        }

        self.validate_handshake_policy(&environ)?;

        let sid = environ.query_param("sid").map(str::to_owned);
        let transport = environ
            .query_param("transport")
            .unwrap_or("polling")
            .to_owned();

        match (environ.method.clone(), sid) {
            (Method::GET, None) => self.handshake(environ, transport).await,
            (Method::GET, Some(sid)) => self.get_on_session(environ, sid, transport).await,
            (Method::POST, Some(sid)) => self.post_on_session(environ, sid).await,
            (Method::POST, None) => Err(EngineError::BadRequest("POST requires sid".into())),
            _ => Err(EngineError::MethodNotAllowed),
        }
    }

    fn validate_handshake_policy(&self, environ: &Environ) -> Result<(), EngineError> {
        match environ.query_param("EIO") {
            Some("4") => {}
            _ => return Err(EngineError::BadRequest("unsupported or missing EIO version".into())),
        }

        if let Some(transport) = environ.query_param("transport") {
            if !self.config.transports.allows(transport) {
                return Err(EngineError::BadRequest(format!(
                    "transport {transport} is not enabled"
                )));
            }
        }

        if let Some(j) = environ.query_param("j") {
            if j.is_empty() || !j.chars().all(|c| c.is_ascii_digit()) {
                return Err(EngineError::BadRequest("j must be numeric".into()));
            }
        }

        Ok(())
    }

    async fn handshake(&self, environ: Environ, transport: String) -> Result<Dispatched, EngineError> {
        self.reject_mismatched_origin(&environ)?;

        let transport_kind = if transport == "websocket" {
            if !self.is_websocket_upgrade(&environ) {
                return Err(EngineError::BadRequest(
                    "websocket handshake missing Upgrade header".into(),
                ));
            }
            TransportKind::WebSocket
        } else {
            TransportKind::Polling
        };

        let sid = self.generate_sid();
        let session = Session::new(
            sid.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.handlers),
            transport_kind,
        );

        if let ConnectResult::Reject(body) = self.handlers.call_connect(&sid, &environ) {
            warn!(sid, "connect handler rejected the connection");
            // The session never joined the registry and its heartbeat was
            // never started; destroy it without firing `disconnect` (§4.4:
            // a rejected connect destroys the half-open session silently).
            session.destroy_half_open().await;
            return Err(EngineError::Unauthorized(body));
        }

        self.registry.insert(Arc::clone(&session));
        session.start_heartbeat();
        info!(sid, transport = %transport, "handshake accepted");

        if transport_kind == TransportKind::WebSocket {
            return Ok(Dispatched::Upgrade { session, fresh: true });
        }

        session.open().await;
        let packets = session.poll().await?;
        let mut response =
            self.polling_response(&environ, Payload::new(packets), StatusCode::OK);
        if let Some(cookie) = self.cookie_header(&sid) {
            response.push_header(HeaderName::from_static("set-cookie"), cookie);
        }
        self.apply_cors(&environ, &mut response);
        Ok(Dispatched::Response(response))
    }

    async fn get_on_session(
        &self,
        environ: Environ,
        sid: String,
        transport: String,
    ) -> Result<Dispatched, EngineError> {
        let session = self
            .registry
            .get(&sid)
            .ok_or_else(|| EngineError::BadRequest(format!("unknown sid {sid}")))?;

        if transport == "websocket" {
            if !self.config.allow_upgrades {
                return Err(EngineError::BadRequest("upgrades are disabled".into()));
            }
            if !self.is_websocket_upgrade(&environ) {
                return Err(EngineError::BadRequest(
                    "websocket handshake missing Upgrade header".into(),
                ));
            }
            if session.transport().await != TransportKind::Polling {
                return Err(EngineError::BadRequest("transport mismatch".into()));
            }
            session.begin_upgrade().await;
            return Ok(Dispatched::Upgrade { session, fresh: false });
        }

        if session.transport().await != TransportKind::Polling {
            return Err(EngineError::BadRequest("transport mismatch".into()));
        }

        match session.poll().await {
            Ok(packets) => {
                let mut response =
                    self.polling_response(&environ, Payload::new(packets), StatusCode::OK);
                self.apply_cors(&environ, &mut response);
                Ok(Dispatched::Response(response))
            }
            Err(EngineError::QueueEmpty) => {
                session
                    .close(false, true, DisconnectReason::TransportError)
                    .await;
                Err(EngineError::QueueEmpty)
            }
            Err(e) => Err(e),
        }
    }

    async fn post_on_session(&self, environ: Environ, sid: String) -> Result<Dispatched, EngineError> {
        let session = self
            .registry
            .get(&sid)
            .ok_or_else(|| EngineError::BadRequest(format!("unknown sid {sid}")))?;

        if let Some(reason) = session.receive_payload(&environ.body).await? {
            session.close(true, false, reason).await;
        }

        let mut response = DispatchResponse::text(StatusCode::OK, "ok");
        self.apply_cors(&environ, &mut response);
        Ok(Dispatched::Response(response))
    }

    fn is_websocket_upgrade(&self, environ: &Environ) -> bool {
        environ
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Encode a polling response body (§4.2), applying JSONP wrapping when
    /// `j=<digits>` was present and gzip/deflate compression when enabled.
    fn polling_response(&self, environ: &Environ, payload: Payload, status: StatusCode) -> DispatchResponse {
        let (body, content_type) = match environ.query_param("j").and_then(|j| j.parse::<u32>().ok()) {
            Some(index) => (payload.encode_jsonp(index), "text/javascript; charset=UTF-8"),
            None => (payload.encode(), "text/plain; charset=UTF-8"),
        };

        let mut response = DispatchResponse {
            status,
            headers: vec![(
                HeaderName::from_static("content-type"),
                HeaderValue::from_str(content_type).expect("static content types are valid"),
            )],
            body,
        };

        if self.config.compression_enabled && response.body.len() >= self.config.compression_threshold {
            if let Some((encoding, compressed)) =
                self.try_compress(environ, &response.body)
            {
                response.body = compressed;
                response.push_header(
                    HeaderName::from_static("content-encoding"),
                    HeaderValue::from_static(encoding),
                );
            }
        }

        response
    }

    /// Pick the first of gzip/deflate present in `Accept-Encoding` and
    /// compress with it (§4.4 compression policy).
    fn try_compress(&self, environ: &Environ, body: &Bytes) -> Option<(&'static str, Bytes)> {
        use flate2::write::{DeflateEncoder, GzEncoder};
        use flate2::Compression;
        use std::io::Write;

        let accept = environ.header("accept-encoding")?;
        let first = accept.split(',').next()?.trim().to_ascii_lowercase();

        match first.as_str() {
            "gzip" => {
                let mut enc = GzEncoder::new(Vec::new(), Compression::default());
                enc.write_all(body).ok()?;
                Some(("gzip", Bytes::from(enc.finish().ok()?)))
            }
            "deflate" => {
                let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
                enc.write_all(body).ok()?;
                Some(("deflate", Bytes::from(enc.finish().ok()?)))
            }
            _ => None,
        }
    }

    fn cookie_header(&self, sid: &str) -> Option<HeaderValue> {
        let cookie_config = self.config.cookie.as_ref()?;
        let mut cookie = cookie::Cookie::new(cookie_config.name.clone(), sid.to_owned());
        cookie.set_path(cookie_config.path.clone());
        cookie.set_same_site(cookie_config.same_site);
        cookie.set_secure(cookie_config.secure);
        cookie.set_http_only(cookie_config.http_only);
        HeaderValue::from_str(&cookie.to_string()).ok()
    }

    fn apply_cors(&self, environ: &Environ, response: &mut DispatchResponse) {
        if let Some(origin) = self.allowed_origin_header(environ) {
            response.push_header(HeaderName::from_static("access-control-allow-origin"), origin);
            if self.config.cors_credentials {
                response.push_header(
                    HeaderName::from_static("access-control-allow-credentials"),
                    HeaderValue::from_static("true"),
                );
            }
        }
    }

    /// A list/predicate CORS policy rejects the handshake outright (400, no
    /// CORS headers) when the request's `Origin` doesn't match; the `Any`
    /// policy never rejects.
    fn reject_mismatched_origin(&self, environ: &Environ) -> Result<(), EngineError> {
        let rejected = match &self.config.cors_allowed_origins {
            CorsAllowedOrigins::Any => false,
            CorsAllowedOrigins::List(allowed) => match environ.header("origin") {
                Some(origin) => !allowed.iter().any(|a| a == origin),
                None => false,
            },
            CorsAllowedOrigins::Predicate(pred) => match environ.header("origin") {
                Some(origin) => !pred(origin),
                None => false,
            },
        };

        if rejected {
            return Err(EngineError::BadRequest("origin not allowed".into()));
        }
        Ok(())
    }

    fn allowed_origin_header(&self, environ: &Environ) -> Option<HeaderValue> {
        let origin = environ.header("origin");
        match &self.config.cors_allowed_origins {
            CorsAllowedOrigins::Any => origin.and_then(|o| HeaderValue::from_str(o).ok()),
            CorsAllowedOrigins::List(allowed) => origin
                .filter(|o| allowed.iter().any(|a| a == o))
                .and_then(|o| HeaderValue::from_str(o).ok()),
            CorsAllowedOrigins::Predicate(pred) => origin
                .filter(|o| pred(o))
                .and_then(|o| HeaderValue::from_str(o).ok()),
        }
    }

    fn preflight_response(&self, environ: &Environ) -> DispatchResponse {
        let mut response = DispatchResponse {
            status: StatusCode::NO_CONTENT,
            headers: vec![(
                HeaderName::from_static("access-control-allow-methods"),
                HeaderValue::from_static("OPTIONS, GET, POST"),
            )],
            body: Bytes::new(),
        };

        if let Some(requested) = environ.header("access-control-request-headers") {
            if let Ok(value) = HeaderValue::from_str(requested) {
                response.push_header(
                    HeaderName::from_static("access-control-allow-headers"),
                    value,
                );
            }
        }

        self.apply_cors(environ, &mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environ(method: Method, query: &str) -> Environ {
        Environ {
            method,
            path: "/engine.io/".to_owned(),
            query: Environ::parse_query(query),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
        }
    }

    #[test]
    fn parses_event_names() {
        assert_eq!("connect".parse::<EventName>().unwrap(), EventName::Connect);
        assert_eq!("message".parse::<EventName>().unwrap(), EventName::Message);
        assert_eq!(
            "disconnect".parse::<EventName>().unwrap(),
            EventName::Disconnect
        );
        assert!("bogus".parse::<EventName>().is_err());
    }

    #[test]
    fn sid_generation_is_unique() {
        let dispatcher = Dispatcher::new(ServerConfig::default());
        let a = dispatcher.generate_sid();
        let b = dispatcher.generate_sid();
        assert_ne!(a, b);
        assert!(!a.contains('-'));
    }

    #[tokio::test]
    async fn rejects_wrong_eio_version() {
        let dispatcher = Dispatcher::new(ServerConfig::default());
        let req = environ(Method::GET, "EIO=3&transport=polling");
        let err = dispatcher.handle_request(req).await.unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
    }

    #[tokio::test]
    async fn rejects_disabled_transport() {
        let config = ServerConfig {
            transports: crate::config::Transports {
                polling: true,
                websocket: false,
            },
            ..ServerConfig::default()
        };
        let dispatcher = Dispatcher::new(config);
        let req = environ(Method::GET, "EIO=4&transport=websocket");
        let err = dispatcher.handle_request(req).await.unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
    }

    #[tokio::test]
    async fn handshake_over_polling_returns_open_packet() {
        let dispatcher = Dispatcher::new(ServerConfig::default());
        let req = environ(Method::GET, "EIO=4&transport=polling");
        let dispatched = dispatcher.handle_request(req).await.unwrap();
        let response = match dispatched {
            Dispatched::Response(r) => r,
            Dispatched::Upgrade { .. } => panic!("expected a response"),
        };
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.body.starts_with(b"0{"));
        assert_eq!(dispatcher.registry.len(), 1);
    }

    #[tokio::test]
    async fn rejected_connect_yields_401_and_no_session() {
        let dispatcher = Dispatcher::new(ServerConfig::default());
        dispatcher.on_connect(|_sid, _environ| {
            ConnectResult::Reject(Some(serde_json::json!({"error": "nope"})))
        });
        let req = environ(Method::GET, "EIO=4&transport=polling");
        let err = dispatcher.handle_request(req).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert!(matches!(err, EngineError::Unauthorized(Some(_))));
        assert!(dispatcher.registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_sid_is_bad_request() {
        let dispatcher = Dispatcher::new(ServerConfig::default());
        let req = environ(Method::POST, "EIO=4&transport=polling&sid=nope");
        let err = dispatcher.handle_request(req).await.unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
    }

    #[tokio::test]
    async fn mismatched_origin_rejects_handshake_with_no_session() {
        let config = ServerConfig {
            cors_allowed_origins: CorsAllowedOrigins::List(vec!["https://allowed.example".into()]),
            ..ServerConfig::default()
        };
        let dispatcher = Dispatcher::new(config);
        let mut req = environ(Method::GET, "EIO=4&transport=polling");
        req.headers.insert(
            "origin",
            HeaderValue::from_static("https://evil.example"),
        );

        let err = dispatcher.handle_request(req).await.unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
        assert!(dispatcher.registry.is_empty());
    }

    #[tokio::test]
    async fn matching_origin_allows_handshake() {
        let config = ServerConfig {
            cors_allowed_origins: CorsAllowedOrigins::List(vec!["https://allowed.example".into()]),
            ..ServerConfig::default()
        };
        let dispatcher = Dispatcher::new(config);
        let mut req = environ(Method::GET, "EIO=4&transport=polling");
        req.headers.insert(
            "origin",
            HeaderValue::from_static("https://allowed.example"),
        );

        let dispatched = dispatcher.handle_request(req).await.unwrap();
        assert!(matches!(dispatched, Dispatched::Response(_)));
        assert_eq!(dispatcher.registry.len(), 1);
    }

    #[test]
    fn cors_any_echoes_origin() {
        let dispatcher = Dispatcher::new(ServerConfig::default());
        let mut req = environ(Method::GET, "EIO=4");
        req.headers
            .insert("origin", HeaderValue::from_static("https://example.com"));
        let header = dispatcher.allowed_origin_header(&req).unwrap();
        assert_eq!(header, "https://example.com");
    }
}
