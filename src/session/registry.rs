//! The Dispatcher-owned session registry (§5): a sharded concurrent map so
//! inserts, lookups, and removals on unrelated sessions never contend.

use dashmap::DashMap;
use std::sync::Arc;

use super::{Session, Sid};

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Sid, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.sid().to_owned(), session);
    }

    pub fn get(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.get(sid).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.remove(sid).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Only CLOSED sessions may be removed from the registry (§4.3
    /// invariant). Drops every entry whose session has reached CLOSED.
    pub async fn remove_closed(&self) {
        let mut closed_sids = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().state().await == super::SessionState::Closed {
                closed_sids.push(entry.key().clone());
            }
        }
        for sid in closed_sids {
            self.sessions.remove(&sid);
        }
    }

    /// Snapshot of every currently-registered session.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}
