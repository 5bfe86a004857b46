//! The per-client session state machine (§4.3).
//!
//! A [`Session`] is the durable entity behind one `sid`: it owns the
//! outbound queue, the upgrade backlog, the heartbeat, and the transport
//! state. The [`crate::dispatcher::Dispatcher`] owns the session registry;
//! a `Session` never reaches back into it.

mod registry;

pub use registry::SessionRegistry;

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ServerConfig;
use crate::dispatcher::Handlers;
use crate::error::{DisconnectReason, EngineError};
use crate::packet::{Data, Packet, PacketType};

/// Opaque session identifier, treated as a secret bearer token.
pub type Sid = String;

/// Transport currently serving a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Polling,
    WebSocket,
}

/// The session's position in the state machine of §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connected,
    Upgrading,
    Upgraded,
    Closing,
    Closed,
}

/// A sentinel-aware outbound frame: `Some(packet)` or the `⊥` sentinel that
/// tells a writer to exit.
type Frame = Option<Packet>;

struct Inner {
    state: Mutex<SessionState>,
    transport: Mutex<TransportKind>,
    backlog: Mutex<Option<Vec<Packet>>>,
    last_pong: Mutex<Instant>,
    out_tx: mpsc::Sender<Frame>,
    out_rx: Mutex<mpsc::Receiver<Frame>>,
    drained: Notify,
    pong_received: Notify,
    data: Mutex<Map<String, Value>>,
    disconnect_fired: AtomicBool,
}

/// A live Engine.IO session.
pub struct Session {
    sid: Sid,
    config: Arc<ServerConfig>,
    handlers: Arc<Handlers>,
    inner: Inner,
}

/// Outcome of [`Session::receive`] worth surfacing to the caller beyond an
/// error: whether the session wants to close.
pub enum ReceiveOutcome {
    Continue,
    Close(DisconnectReason),
}

const OUT_QUEUE_CAPACITY: usize = 1024;

impl Session {
    pub(crate) fn new(
        sid: Sid,
        config: Arc<ServerConfig>,
        handlers: Arc<Handlers>,
        initial_transport: TransportKind,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_CAPACITY);

        Arc::new(Self {
            sid,
            config,
            handlers,
            inner: Inner {
                state: Mutex::new(SessionState::New),
                transport: Mutex::new(initial_transport),
                backlog: Mutex::new(None),
                last_pong: Mutex::new(Instant::now()),
                out_tx,
                out_rx: Mutex::new(out_rx),
                drained: Notify::new(),
                pong_received: Notify::new(),
                data: Mutex::new(Map::new()),
                disconnect_fired: AtomicBool::new(false),
            },
        })
    }

    /// Start the active heartbeat (§4.3). Deferred until after the `connect`
    /// handler has accepted the session: a rejected connect never reaches
    /// this call, so a half-open session has no background task to abort
    /// and never fires a spurious `disconnect` from a ping timeout.
    pub(crate) fn start_heartbeat(self: &Arc<Self>) {
        tokio::spawn(Self::heartbeat_loop(Arc::clone(self)));
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub async fn state(&self) -> SessionState {
        *self.inner.state.lock().await
    }

    pub async fn transport(&self) -> TransportKind {
        *self.inner.transport.lock().await
    }

    /// The application-owned key/value map; the core never reads this.
    pub async fn data(&self) -> Map<String, Value> {
        self.inner.data.lock().await.clone()
    }

    pub async fn set_data(&self, data: Map<String, Value>) {
        *self.inner.data.lock().await = data;
    }

    /// Build and enqueue this session's single OPEN packet (§4.3
    /// handshake). Called exactly once, immediately after allocation.
    pub(crate) async fn open(&self) {
        {
            let mut state = self.inner.state.lock().await;
            *state = SessionState::Connected;
        }

        let transport = self.transport().await;
        let upgrades = if self.config.allow_upgrades && transport == TransportKind::Polling {
            vec!["websocket"]
        } else {
            vec![]
        };

        let open = Packet::open(serde_json::json!({
            "sid": self.sid,
            "upgrades": upgrades,
            "pingInterval": self.config.ping_interval.as_millis() as u64,
            "pingTimeout": self.config.ping_timeout.as_millis() as u64,
            "maxPayload": self.config.max_http_buffer_size,
        }));

        let _ = self.inner.out_tx.send(Some(open)).await;
    }

    /// Application-origin send (§4.3 send semantics). Enqueues into the
    /// out queue if connected/upgraded and not mid-upgrade; otherwise
    /// buffers into the backlog. `force` bypasses the backlog for
    /// probe-origin control packets.
    pub async fn send(&self, packet: Packet, force: bool) -> Result<(), EngineError> {
        trace!(sid = %self.sid, packet = packet.packet_type().name(), force, "send");
        {
            let state = *self.inner.state.lock().await;
            if state == SessionState::Closed {
                return Err(EngineError::SocketClosed(self.sid.clone()));
            }
        }

        if self.is_idle_timed_out().await {
            self.close(false, true, DisconnectReason::PingTimeout).await;
            return Err(EngineError::SocketClosed(self.sid.clone()));
        }

        let mut backlog = self.inner.backlog.lock().await;
        if let Some(backlog) = backlog.as_mut() {
            if !force {
                backlog.push(packet);
                return Ok(());
            }
        }
        drop(backlog);

        self.inner
            .out_tx
            .send(Some(packet))
            .await
            .map_err(|_| EngineError::SocketClosed(self.sid.clone()))
    }

    async fn is_idle_timed_out(&self) -> bool {
        let last_pong = *self.inner.last_pong.lock().await;
        let deadline =
            self.config.ping_interval + self.config.ping_timeout + self.config.ping_interval_grace;
        last_pong.elapsed() > deadline
    }

    /// Receive semantics (§4.3): dispatch an inbound packet by type.
    pub async fn receive(&self, packet: Packet) -> Result<ReceiveOutcome, EngineError> {
        trace!(sid = %self.sid, packet = packet.packet_type().name(), "receive");
        match packet.packet_type() {
            PacketType::Ping => {
                // Rare legacy client ping: reply PONG with the same data.
                let reply = match packet.data() {
                    Data::Text(text) => Packet::pong(Some(text)),
                    _ => Packet::pong(None),
                };
                self.send(reply, false).await.ok();
                Ok(ReceiveOutcome::Continue)
            }
            PacketType::Pong => {
                *self.inner.last_pong.lock().await = Instant::now();
                self.inner.pong_received.notify_one();
                Ok(ReceiveOutcome::Continue)
            }
            PacketType::Message => {
                self.handlers.call_message(&self.sid, packet.data());
                Ok(ReceiveOutcome::Continue)
            }
            PacketType::Upgrade => {
                // The real upgrade handshake is driven entirely by
                // `transport::ws`'s probe sequence, never through this
                // method; an UPGRADE packet reaching here is out of place.
                let error = EngineError::UnknownPacket(PacketType::Upgrade as u8);
                debug!(sid = %self.sid, %error, "dropping out-of-place packet");
                Ok(ReceiveOutcome::Continue)
            }
            PacketType::Close => Ok(ReceiveOutcome::Close(DisconnectReason::ClientDisconnect)),
            PacketType::Open | PacketType::Noop => Ok(ReceiveOutcome::Continue),
        }
    }

    /// Long-poll GET handler (§4.3): drain whatever is queued, blocking for
    /// the first packet up to `pingInterval + pingTimeout`.
    pub async fn poll(&self) -> Result<Vec<Packet>, EngineError> {
        let deadline = self.config.ping_interval + self.config.ping_timeout;
        let mut rx = self.inner.out_rx.lock().await;

        let first = match tokio::time::timeout(deadline, rx.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(Vec::new()),
            Err(_) => return Err(EngineError::QueueEmpty),
        };

        let Some(first) = first else {
            self.inner.drained.notify_waiters();
            return Ok(Vec::new());
        };

        let mut packets = vec![first];
        loop {
            match rx.try_recv() {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => {
                    self.inner.drained.notify_waiters();
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(packets)
    }

    /// Long-poll POST handler (§4.3): decode a payload and feed each packet
    /// into the receive path. Returns the first close reason encountered,
    /// if any.
    pub async fn receive_payload(
        &self,
        body: &[u8],
    ) -> Result<Option<DisconnectReason>, EngineError> {
        if body.len() > self.config.max_http_buffer_size {
            return Err(EngineError::ContentTooLong(body.len()));
        }

        let payload = crate::payload::Payload::decode(body)?;
        for packet in payload.into_packets() {
            if let ReceiveOutcome::Close(reason) = self.receive(packet).await? {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    /// Begin a websocket upgrade from an established polling session
    /// (§4.3 step 1a): mark UPGRADING, allocate the backlog, and drain the
    /// out queue so the probe exchange isn't interleaved with old traffic.
    pub(crate) async fn begin_upgrade(&self) {
        *self.inner.state.lock().await = SessionState::Upgrading;
        *self.inner.backlog.lock().await = Some(Vec::new());
    }

    /// Complete a successful upgrade (§4.3 step 1e): move backlogged
    /// packets into the out queue in FIFO order, clear the backlog, and
    /// flip to UPGRADED/WEBSOCKET.
    pub(crate) async fn complete_upgrade(&self) {
        let backlogged = self.inner.backlog.lock().await.take().unwrap_or_default();
        for packet in backlogged {
            let _ = self.inner.out_tx.send(Some(packet)).await;
        }
        *self.inner.state.lock().await = SessionState::Upgraded;
        *self.inner.transport.lock().await = TransportKind::WebSocket;
    }

    /// Revert a failed upgrade (§4.3 step 1f): flush anything backlogged
    /// back onto the polling queue and return to CONNECTED.
    pub(crate) async fn abort_upgrade(&self) {
        let backlogged = self.inner.backlog.lock().await.take().unwrap_or_default();
        for packet in backlogged {
            let _ = self.inner.out_tx.send(Some(packet)).await;
        }
        *self.inner.state.lock().await = SessionState::Connected;
    }

    /// Promote a fresh WebSocket handshake straight to UPGRADED (§4.3 step
    /// 2), skipping the probe exchange, then send the OPEN packet.
    pub(crate) async fn open_over_websocket(&self) {
        *self.inner.transport.lock().await = TransportKind::WebSocket;
        self.open().await;
        *self.inner.state.lock().await = SessionState::Upgraded;
    }

    /// Wake a blocked poll/writer so it can exit, without marking the
    /// session CLOSED. Used on shutdown (§5) and when a reader exits.
    pub async fn release_writer(&self) {
        let _ = self.inner.out_tx.send(None).await;
    }

    /// WebSocket writer semantics (§4.3 step 3): wait indefinitely for the
    /// next outbound frame. Returns `None` on the `⊥` sentinel, unlike
    /// [`Session::poll`] which batches and times out for the long-poll GET.
    pub async fn next_outbound(&self) -> Option<Packet> {
        let mut rx = self.inner.out_rx.lock().await;
        match rx.recv().await {
            Some(Some(packet)) => Some(packet),
            _ => {
                self.inner.drained.notify_waiters();
                None
            }
        }
    }

    /// The close protocol (§4.3). Sends CLOSE unless aborting, then either
    /// waits for the queue to drain (`wait`) or closes immediately, and
    /// fires the `disconnect` handler exactly once.
    pub async fn close(&self, wait: bool, abort: bool, reason: DisconnectReason) {
        {
            let mut state = self.inner.state.lock().await;
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closing;
        }

        if !abort {
            let _ = self.inner.out_tx.send(Some(Packet::close())).await;
        }
        let _ = self.inner.out_tx.send(None).await;

        if wait {
            let _ = tokio::time::timeout(self.config.ping_timeout, self.inner.drained.notified())
                .await;
        }

        *self.inner.state.lock().await = SessionState::Closed;

        if !self.inner.disconnect_fired.swap(true, Ordering::SeqCst) {
            debug!(sid = %self.sid, %reason, "session closed");
            self.handlers.call_disconnect(&self.sid, reason);
        }
    }

    /// Tear down a session that never joined the registry and never had its
    /// heartbeat started, because the `connect` handler rejected it (§4.4).
    /// Marks the session CLOSED and suppresses `disconnect` entirely — the
    /// application was never told this sid connected, so it must not be
    /// told it disconnected either.
    pub(crate) async fn destroy_half_open(&self) {
        self.inner.disconnect_fired.store(true, Ordering::SeqCst);
        *self.inner.state.lock().await = SessionState::Closed;
        let _ = self.inner.out_tx.send(None).await;
    }

    /// The active heartbeat: after `pingInterval`, send PING and wait up
    /// to `pingTimeout` for the matching PONG; rearm on receipt, or close
    /// with `PingTimeout` if it never arrives.
    async fn heartbeat_loop(session: Arc<Session>) {
        loop {
            tokio::time::sleep(session.config.ping_interval).await;

            if session.state().await == SessionState::Closed {
                return;
            }

            if session.send(Packet::ping(None), true).await.is_err() {
                return;
            }

            let timeout = session.config.ping_timeout + session.config.ping_interval_grace;
            let got_pong =
                tokio::time::timeout(timeout, session.inner.pong_received.notified()).await;

            if session.state().await == SessionState::Closed {
                return;
            }

            if got_pong.is_err() {
                session
                    .close(false, true, DisconnectReason::PingTimeout)
                    .await;
                return;
            }
        }
    }

    /// Self-check used by the janitor (§4.6): close the session if it has
    /// been idle for longer than `pingInterval + pingTimeout + grace`.
    pub async fn check_idle_and_maybe_close(&self) {
        let last_pong = *self.inner.last_pong.lock().await;
        let deadline =
            self.config.ping_interval + self.config.ping_timeout + self.config.ping_interval_grace;

        if last_pong.elapsed() > deadline && self.state().await != SessionState::Closed {
            self.close(false, true, DisconnectReason::PingTimeout).await;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("sid", &self.sid).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::sync::Arc as StdArc;

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            ping_interval: Duration::from_millis(50),
            ping_timeout: Duration::from_millis(50),
            ..ServerConfig::default()
        })
    }

    #[tokio::test]
    async fn open_enqueues_exactly_one_open_packet() {
        let handlers = StdArc::new(Handlers::default());
        let session = Session::new(
            "sid1".into(),
            test_config(),
            handlers,
            TransportKind::Polling,
        );
        session.open().await;

        let packets = session.poll().await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type(), PacketType::Open);
    }

    #[tokio::test]
    async fn send_then_send_preserves_order() {
        let handlers = StdArc::new(Handlers::default());
        let session = Session::new(
            "sid1".into(),
            test_config(),
            handlers,
            TransportKind::Polling,
        );
        session.open().await;
        session.poll().await.unwrap();

        session.send(Packet::message_text("p1"), false).await.unwrap();
        session.send(Packet::message_text("p2"), false).await.unwrap();

        let packets = session.poll().await.unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].data(), &Data::Text("p1".into()));
        assert_eq!(packets[1].data(), &Data::Text("p2".into()));
    }

    #[tokio::test]
    async fn send_while_upgrading_goes_to_backlog() {
        let handlers = StdArc::new(Handlers::default());
        let session = Session::new(
            "sid1".into(),
            test_config(),
            handlers,
            TransportKind::Polling,
        );
        session.open().await;
        session.poll().await.unwrap();

        session.begin_upgrade().await;
        session.send(Packet::message_text("buffered"), false).await.unwrap();
        session.complete_upgrade().await;

        let packets = session.poll().await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data(), &Data::Text("buffered".into()));
    }

    #[tokio::test]
    async fn aborted_upgrade_delivers_backlog_on_polling_in_order_with_no_duplicates() {
        let handlers = StdArc::new(Handlers::default());
        let session = Session::new(
            "sid1".into(),
            test_config(),
            handlers,
            TransportKind::Polling,
        );
        session.open().await;
        session.poll().await.unwrap();

        session.begin_upgrade().await;
        session.send(Packet::message_text("a"), false).await.unwrap();
        session.send(Packet::message_text("b"), false).await.unwrap();
        session.abort_upgrade().await;

        assert_eq!(session.state().await, SessionState::Connected);
        assert_eq!(session.transport().await, TransportKind::Polling);

        let packets = session.poll().await.unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].data(), &Data::Text("a".into()));
        assert_eq!(packets[1].data(), &Data::Text("b".into()));
    }

    #[tokio::test]
    async fn close_fires_disconnect_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let count = StdArc::new(AtomicUsize::new(0));
        let mut handlers = Handlers::default();
        let count_clone = StdArc::clone(&count);
        handlers.set_disconnect(move |_sid, _reason| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        let handlers = StdArc::new(handlers);

        let session = Session::new(
            "sid1".into(),
            test_config(),
            handlers,
            TransportKind::Polling,
        );
        session.open().await;

        session
            .close(false, false, DisconnectReason::ClientDisconnect)
            .await;
        session
            .close(false, false, DisconnectReason::ClientDisconnect)
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
