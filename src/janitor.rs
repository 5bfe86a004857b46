//! The Janitor (§4.6): a background sweep that closes idle sessions the
//! active heartbeat alone didn't catch, and reaps CLOSED entries from the
//! registry.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::session::SessionRegistry;

/// Iterate the registry every `pingInterval`, asking each session to
/// self-check its idle window, then drop anything that reached CLOSED.
/// A no-op loop when `monitorClients` is disabled (the caller simply
/// doesn't spawn it).
pub async fn run(registry: Arc<SessionRegistry>, config: Arc<ServerConfig>) {
    let mut interval = tokio::time::interval(interval_period(&config));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        for session in registry.all() {
            session.check_idle_and_maybe_close().await;
        }

        registry.remove_closed().await;
    }
}

fn interval_period(config: &ServerConfig) -> Duration {
    config.ping_interval.max(Duration::from_millis(50))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Handlers;
    use crate::session::{Session, TransportKind};
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn sweeps_a_session_idle_past_the_deadline() {
        let config = StdArc::new(ServerConfig {
            ping_interval: Duration::from_millis(20),
            ping_timeout: Duration::from_millis(20),
            ping_interval_grace: Duration::from_millis(5),
            ..ServerConfig::default()
        });
        let registry = StdArc::new(SessionRegistry::new());
        let handlers = StdArc::new(Handlers::default());
        let session = Session::new(
            "sid1".into(),
            StdArc::clone(&config),
            handlers,
            TransportKind::Polling,
        );
        session.open().await;
        registry.insert(StdArc::clone(&session));

        tokio::time::sleep(Duration::from_millis(120)).await;

        for s in registry.all() {
            s.check_idle_and_maybe_close().await;
        }
        registry.remove_closed().await;

        assert!(registry.is_empty());
    }
}
