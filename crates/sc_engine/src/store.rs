//! SessionStore: the single owner of live session records.
//!
//! All mutation goes through `with_session`, which holds the write lock for
//! the duration of the closure. The closure must not block or await.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

use crate::error::StoreError;
use crate::session::{SecretChatSession, SessionMetadata, SessionSnapshot};

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SecretChatSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions.read().get(session_id).map(|s| s.snapshot())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// Insert or replace. A replaced record has its keys wiped.
    pub fn upsert(&self, session: SecretChatSession) {
        let id = session.session_id.clone();
        let replaced = self.sessions.write().insert(id, session);
        if let Some(mut old) = replaced {
            old.keys.destroy();
        }
    }

    /// Remove a session, zeroizing its keys first. Returns the final metadata
    /// in state `Terminated`.
    pub fn terminate(&self, session_id: &str) -> Result<SessionMetadata, StoreError> {
        let mut session = self
            .sessions
            .write()
            .remove(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        session.terminate();
        info!(
            target: "sc_engine",
            event = "session_terminated",
            session_id = %session_id,
            outgoing_seq = session.outgoing_seq,
            incoming_seq = session.incoming_seq,
        );
        Ok(session.metadata())
    }

    pub fn with_session<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SecretChatSession) -> R,
    ) -> Result<R, StoreError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        Ok(f(session))
    }

    pub fn metadata(&self) -> Vec<SessionMetadata> {
        let mut all: Vec<_> = self.sessions.read().values().map(|s| s.metadata()).collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }

    pub fn find_by_peer(&self, peer_id: &str) -> Vec<SessionSnapshot> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.peer_id == peer_id)
            .map(|s| s.snapshot())
            .collect()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use sc_crypto::{CipherSuite, SessionKey};

    use super::*;
    use crate::session::{Role, SessionState};

    fn session(id: &str, peer: &str, key: u8) -> SecretChatSession {
        SecretChatSession::new(
            id.into(),
            peer.into(),
            Role::Creator,
            CipherSuite::default(),
            SessionKey::from_bytes([key; 32]),
            0,
            Instant::now(),
        )
    }

    #[test]
    fn upsert_get_and_mutate() {
        let store = SessionStore::new();
        store.upsert(session("a", "bob", 1));
        assert_eq!(store.len(), 1);

        store.with_session("a", |s| s.outgoing_seq = 9).unwrap();
        let snap = store.get("a").unwrap();
        assert_eq!(snap.outgoing_seq, 9);
        assert_eq!(snap.peer_id, "bob");
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn upsert_replaces_record() {
        let store = SessionStore::new();
        store.upsert(session("a", "bob", 1));
        let before = store.get("a").unwrap().key_id;
        store.upsert(session("a", "bob", 2));
        assert_ne!(store.get("a").unwrap().key_id, before);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn terminate_returns_final_metadata() {
        let store = SessionStore::new();
        store.upsert(session("a", "bob", 1));
        let meta = store.terminate("a").unwrap();
        assert_eq!(meta.state, SessionState::Terminated);
        assert!(store.get("a").is_none());
        assert!(matches!(store.terminate("a"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn with_session_on_missing_is_not_found() {
        let store = SessionStore::new();
        assert!(store.with_session("nope", |_| ()).is_err());
    }

    #[test]
    fn find_by_peer_filters() {
        let store = SessionStore::new();
        store.upsert(session("a", "bob", 1));
        store.upsert(session("b", "carol", 2));
        store.upsert(session("c", "bob", 3));
        assert_eq!(store.find_by_peer("bob").len(), 2);
        assert_eq!(store.metadata().len(), 3);
    }
}
