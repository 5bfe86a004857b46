//! Transport adapters (§4.5): the only place the crate talks to `hyper` and
//! `tokio-tungstenite` directly. The [`crate::dispatcher::Dispatcher`] and
//! [`crate::session::Session`] never reach into either.

pub mod http;
pub mod ws;

pub use http::DispatcherService;
