//! A server implementation of the Engine.IO v4 transport protocol: the
//! packet/payload codec, the per-client session state machine, and an HTTP
//! + WebSocket dispatcher built on `hyper` and `tokio-tungstenite`.
//!
//! ```no_run
//! use engineio::{ConnectResult, Server, ServerConfig};
//!
//! # async fn run() -> engineio::Result<()> {
//! let server = Server::new(ServerConfig::default());
//!
//! server.dispatcher().on_connect(|_sid, _environ| ConnectResult::Accept);
//! server.dispatcher().on_message(|sid, data| {
//!     println!("{sid}: {data:?}");
//! });
//!
//! server.listen("127.0.0.1:3000", |_event| {}).await
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
mod janitor;
pub mod packet;
pub mod payload;
pub mod session;
pub mod transport;

mod server;

pub use config::ServerConfig;
pub use dispatcher::{ConnectResult, DispatchResponse, Dispatched, Dispatcher, Environ, EventName};
pub use error::{DisconnectReason, EngineError, Result};
pub use event::Event;
pub use packet::{Data, Packet, PacketType};
pub use payload::Payload;
pub use server::Server;
pub use session::{ReceiveOutcome, Session, SessionRegistry, SessionState, Sid, TransportKind};
