//! The crate-wide error taxonomy.
//!
//! [`EngineError`] is the single error type returned by every fallible
//! operation in the crate. Each variant knows the HTTP status it should
//! surface as when it escapes a request handler, matching §7 of the
//! protocol specification.

use http::StatusCode;
use thiserror::Error;

/// The reason a [`Session`](crate::session::Session) was closed.
///
/// Exactly one `disconnect` event fires per session, carrying one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientDisconnect,
    ServerDisconnect,
    PingTimeout,
    TransportError,
    TransportClose,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientDisconnect => "client disconnect",
            Self::ServerDisconnect => "server disconnect",
            Self::PingTimeout => "ping timeout",
            Self::TransportError => "transport error",
            Self::TransportClose => "transport close",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur anywhere in the codec, session, or dispatcher.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A packet or payload could not be decoded from the wire.
    #[error("malformed packet: {0}")]
    Decode(String),

    /// A packet of a recognized-but-invalid shape arrived on an established
    /// session (e.g. an UPGRADE packet outside the upgrade handshake).
    /// Logged and dropped; the session continues.
    #[error("unknown or out-of-place packet type: {0}")]
    UnknownPacket(u8),

    /// A POST body exceeded `maxHTTPBufferSize`.
    #[error("request body of {0} bytes exceeds the configured limit")]
    ContentTooLong(usize),

    /// A long-poll GET timed out waiting for an outbound packet.
    #[error("long-poll timed out waiting for outbound packets")]
    QueueEmpty,

    /// A `send` was attempted on a session that has already closed.
    #[error("session {0} is closed")]
    SocketClosed(String),

    /// The underlying transport (WebSocket) failed.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The handshake or a subsequent request violated the protocol: bad
    /// EIO version, unconfigured transport, unknown sid, transport mismatch.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The `connect` handler rejected the connection.
    #[error("connection rejected")]
    Unauthorized(Option<serde_json::Value>),

    /// An HTTP method this dispatcher does not recognize.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// `Dispatcher::on` was called with an event name outside
    /// `{connect, message, disconnect}`.
    #[error("unknown event name: {0}")]
    UnknownEvent(String),
}

impl EngineError {
    /// The HTTP status this error should surface as, per §6/§7.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Decode(_) => StatusCode::BAD_REQUEST,
            Self::UnknownPacket(_) => StatusCode::OK,
            Self::ContentTooLong(_) => StatusCode::BAD_REQUEST,
            Self::QueueEmpty => StatusCode::BAD_REQUEST,
            Self::SocketClosed(_) => StatusCode::GONE,
            Self::TransportError(_) => StatusCode::BAD_REQUEST,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::UnknownEvent(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
