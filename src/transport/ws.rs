//! The WebSocket transport adapter (§4.5 `webSocketUpgrade`), built on
//! `tokio-tungstenite`/`tungstenite` — the crate the teacher's own
//! `Cargo.toml` declares for this purpose.

use base64::Engine as _;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::{header, Request, StatusCode};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tokio_tungstenite::WebSocketStream;
use tungstenite::protocol::Role;
use tungstenite::Message as WsMessage;

use crate::dispatcher::DispatchResponse;
use crate::error::{DisconnectReason, EngineError};
use crate::packet::{Data, Packet, PacketType};
use crate::session::{ReceiveOutcome, Session};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Probe/UPGRADE frame payload length limit (§4.3 step 1d).
const MAX_UPGRADE_PAYLOAD: usize = 128;

/// The `Sec-WebSocket-Accept` value for a given `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID);
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Validate the handshake headers, answer with `101 Switching Protocols`,
/// and spawn the background task that drives the session once `hyper` hands
/// the raw connection back to us.
pub fn upgrade(
    request: Request<()>,
    session: Arc<Session>,
    fresh: bool,
) -> Result<DispatchResponse, EngineError> {
    let key = request
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| EngineError::BadRequest("missing Sec-WebSocket-Key".into()))?
        .to_owned();

    if let Some(version) = request.headers().get(header::SEC_WEBSOCKET_VERSION) {
        if version.as_bytes() != b"13" {
            return Err(EngineError::BadRequest(format!(
                "unsupported websocket version: {}",
                String::from_utf8_lossy(version.as_bytes())
            )));
        }
    }

    let accept = accept_key(&key);
    let mut request = request;

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut request).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                drive(ws, session, fresh).await;
            }
            Err(error) => {
                tracing::warn!(error = %error, "websocket upgrade failed");
                if !fresh {
                    session.abort_upgrade().await;
                }
            }
        }
    });

    Ok(DispatchResponse {
        status: StatusCode::SWITCHING_PROTOCOLS,
        headers: vec![
            (
                header::CONNECTION,
                http::HeaderValue::from_static("Upgrade"),
            ),
            (
                header::UPGRADE,
                http::HeaderValue::from_static("websocket"),
            ),
            (
                header::SEC_WEBSOCKET_ACCEPT,
                http::HeaderValue::from_str(&accept)
                    .map_err(|_| EngineError::BadRequest("invalid accept key".into()))?,
            ),
        ],
        body: Bytes::new(),
    })
}

fn packet_to_message(packet: &Packet) -> WsMessage {
    if packet.is_binary() {
        WsMessage::Binary(packet.encode_binary().to_vec())
    } else {
        WsMessage::Text(String::from_utf8_lossy(&packet.encode_text()).into_owned())
    }
}

fn message_to_packet(message: WsMessage) -> Result<Packet, EngineError> {
    match message {
        WsMessage::Text(text) => Packet::decode_text(text.as_bytes()),
        WsMessage::Binary(bytes) => Ok(Packet::decode_binary_frame(Bytes::from(bytes))),
        other => Err(EngineError::TransportError(format!(
            "unexpected frame: {other:?}"
        ))),
    }
}

/// Run the probe/upgrade handshake (if not `fresh`) and then the
/// reader/writer loop (§4.3 step 3) until the socket closes.
async fn drive<S>(ws: WebSocketStream<S>, session: Arc<Session>, fresh: bool)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();

    if fresh {
        session.open_over_websocket().await;
    } else {
        let probe_deadline = session.config().ping_timeout;

        let got_probe_ping = match tokio::time::timeout(probe_deadline, stream.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                matches!(
                    Packet::decode_text(text.as_bytes()),
                    Ok(packet) if packet.packet_type() == PacketType::Ping
                        && matches!(packet.data(), Data::Text(d) if d == "probe")
                )
            }
            _ => false,
        };

        if !got_probe_ping {
            session.abort_upgrade().await;
            let _ = sink.close().await;
            return;
        }

        if sink
            .send(packet_to_message(&Packet::pong(Some("probe"))))
            .await
            .is_err()
        {
            session.abort_upgrade().await;
            return;
        }
        let _ = session.send(Packet::noop(), true).await;

        let got_upgrade = match tokio::time::timeout(probe_deadline, stream.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) if text.len() <= MAX_UPGRADE_PAYLOAD => {
                Packet::decode_text(text.as_bytes())
                    .map(|packet| packet.packet_type() == PacketType::Upgrade)
                    .unwrap_or(false)
            }
            _ => false,
        };

        if !got_upgrade {
            session.abort_upgrade().await;
            let _ = sink.close().await;
            return;
        }

        session.complete_upgrade().await;
    }

    let writer_session = Arc::clone(&session);
    let writer = tokio::spawn(async move {
        loop {
            match writer_session.next_outbound().await {
                Some(packet) => {
                    if sink.send(packet_to_message(&packet)).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        let _ = sink.close().await;
    });

    let close_reason = loop {
        let deadline = session.config().ping_interval + session.config().ping_timeout;
        match tokio::time::timeout(deadline, stream.next()).await {
            Ok(Some(Ok(message))) if message.is_close() => break DisconnectReason::ClientDisconnect,
            Ok(Some(Ok(message))) if message.is_ping() || message.is_pong() => continue,
            Ok(Some(Ok(message))) => match message_to_packet(message) {
                Ok(packet) => match session.receive(packet).await {
                    Ok(ReceiveOutcome::Close(reason)) => break reason,
                    Ok(ReceiveOutcome::Continue) => continue,
                    Err(_) => continue,
                },
                Err(_) => break DisconnectReason::TransportError,
            },
            Ok(Some(Err(_))) => break DisconnectReason::TransportError,
            Ok(None) => break DisconnectReason::TransportClose,
            Err(_) => break DisconnectReason::TransportError,
        }
    };

    session.release_writer().await;
    let _ = writer.await;
    session.close(false, true, close_reason).await;
}
