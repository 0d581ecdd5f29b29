//! Secret chat session records.
//!
//! A `SecretChatSession` owns its key material through a `KeyRing`. Nothing
//! here is `Clone` or serialisable; readers get a `SessionSnapshot` and
//! persistence gets `SessionMetadata`, neither of which carries a key.

use std::time::Instant;

use chrono::{DateTime, Utc};
use sc_crypto::{kdf::Direction, CipherSuite, KeyFingerprint, KeyId, SessionKey};
use serde::{Deserialize, Serialize};

use crate::rekey::RekeyPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Handshake sent, waiting for the peer's accept
    Requested,
    /// Responder side: key derived, creator has not yet proven it holds it
    Accepted,
    Active,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Sent the handshake request
    Creator,
    Participant,
}

impl Role {
    pub fn outgoing(self) -> Direction {
        match self {
            Role::Creator => Direction::FromCreator,
            Role::Participant => Direction::FromParticipant,
        }
    }

    pub fn incoming(self) -> Direction {
        match self {
            Role::Creator => Direction::FromParticipant,
            Role::Participant => Direction::FromCreator,
        }
    }
}

/// Which key of the ring authenticated a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySlot {
    Current,
    /// The key a rekey initiator just rotated away from
    Previous,
    /// A rekey responder's not yet committed replacement
    Pending,
}

/// Exactly one key encrypts (`current`). `previous` and `pending` exist only
/// during a rotation and are used for decryption only.
#[derive(Debug)]
pub struct KeyRing {
    current: SessionKey,
    previous: Option<SessionKey>,
    pending: Option<SessionKey>,
}

impl KeyRing {
    pub fn new(current: SessionKey) -> Self {
        Self {
            current,
            previous: None,
            pending: None,
        }
    }

    pub fn current(&self) -> &SessionKey {
        &self.current
    }

    pub fn previous(&self) -> Option<&SessionKey> {
        self.previous.as_ref()
    }

    pub fn pending(&self) -> Option<&SessionKey> {
        self.pending.as_ref()
    }

    /// Look up the key a message claims to be encrypted under.
    pub fn select(&self, key_id: KeyId) -> Option<(KeySlot, &SessionKey)> {
        if self.current.key_id() == key_id {
            return Some((KeySlot::Current, &self.current));
        }
        if let Some(key) = self.pending.as_ref().filter(|k| k.key_id() == key_id) {
            return Some((KeySlot::Pending, key));
        }
        self.previous
            .as_ref()
            .filter(|k| k.key_id() == key_id)
            .map(|k| (KeySlot::Previous, k))
    }

    /// Install `next` as current; the outgoing key stays readable as previous.
    pub fn rotate(&mut self, next: SessionKey) {
        let old = std::mem::replace(&mut self.current, next);
        self.previous = Some(old);
    }

    pub fn set_pending(&mut self, key: SessionKey) {
        self.pending = Some(key);
    }

    /// Promote the pending key to current. Returns false if nothing is pending.
    pub fn promote_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(next) => {
                self.rotate(next);
                true
            }
            None => false,
        }
    }

    pub fn drop_previous(&mut self) {
        self.previous = None;
    }

    pub fn drop_pending(&mut self) {
        self.pending = None;
    }

    /// Wipe every key in the ring.
    pub fn destroy(&mut self) {
        self.current.destroy();
        if let Some(k) = self.previous.as_mut() {
            k.destroy();
        }
        if let Some(k) = self.pending.as_mut() {
            k.destroy();
        }
        self.previous = None;
        self.pending = None;
    }

    pub fn is_destroyed(&self) -> bool {
        self.current.is_destroyed() && self.previous.is_none() && self.pending.is_none()
    }
}

#[derive(Debug)]
pub struct SecretChatSession {
    pub session_id: String,
    pub peer_id: String,
    pub role: Role,
    pub suite: CipherSuite,
    pub state: SessionState,
    pub keys: KeyRing,
    /// Last sequence number sent
    pub outgoing_seq: u64,
    /// Last sequence number accepted from the peer
    pub incoming_seq: u64,
    pub created_at: DateTime<Utc>,
    /// Self-destruct timer applied to outgoing messages (0 = off)
    pub ttl_default: u32,
    /// Bumped on every installed replacement key
    pub key_generation: u32,
    pub messages_since_rekey: u64,
    pub key_installed_at: Instant,
    pub integrity_failures: u32,
    pub rekey: RekeyPhase,
    pub rekey_attempts: u32,
    pub rekey_retry_at: Option<Instant>,
}

impl SecretChatSession {
    pub fn new(
        session_id: String,
        peer_id: String,
        role: Role,
        suite: CipherSuite,
        key: SessionKey,
        ttl_default: u32,
        now: Instant,
    ) -> Self {
        let state = match role {
            Role::Creator => SessionState::Active,
            Role::Participant => SessionState::Accepted,
        };
        Self {
            session_id,
            peer_id,
            role,
            suite,
            state,
            keys: KeyRing::new(key),
            outgoing_seq: 0,
            incoming_seq: 0,
            created_at: Utc::now(),
            ttl_default,
            key_generation: 0,
            messages_since_rekey: 0,
            key_installed_at: now,
            integrity_failures: 0,
            rekey: RekeyPhase::Stable,
            rekey_attempts: 0,
            rekey_retry_at: None,
        }
    }

    pub fn fingerprint(&self) -> KeyFingerprint {
        *self.keys.current().fingerprint()
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    /// Bookkeeping after a replacement key became current.
    pub(crate) fn mark_key_installed(&mut self, now: Instant) {
        self.key_generation = self.key_generation.wrapping_add(1);
        self.messages_since_rekey = 0;
        self.key_installed_at = now;
        self.integrity_failures = 0;
        self.rekey_attempts = 0;
        self.rekey_retry_at = None;
    }

    /// Zeroize all key material and mark the record dead.
    pub fn terminate(&mut self) {
        self.keys.destroy();
        self.rekey = RekeyPhase::Stable;
        self.state = SessionState::Terminated;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            peer_id: self.peer_id.clone(),
            role: self.role,
            suite: self.suite,
            state: self.state,
            outgoing_seq: self.outgoing_seq,
            incoming_seq: self.incoming_seq,
            created_at: self.created_at,
            ttl_default: self.ttl_default,
            key_generation: self.key_generation,
            key_id: self.keys.current().key_id(),
            key_fingerprint: self.fingerprint(),
            rekey_in_progress: !matches!(self.rekey, RekeyPhase::Stable),
        }
    }

    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            session_id: self.session_id.clone(),
            peer_id: self.peer_id.clone(),
            state: self.state,
            outgoing_seq: self.outgoing_seq,
            incoming_seq: self.incoming_seq,
            key_fingerprint: self.fingerprint().to_hex(),
        }
    }
}

/// Read-only, key-free view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub peer_id: String,
    pub role: Role,
    pub suite: CipherSuite,
    pub state: SessionState,
    pub outgoing_seq: u64,
    pub incoming_seq: u64,
    pub created_at: DateTime<Utc>,
    pub ttl_default: u32,
    pub key_generation: u32,
    pub key_id: KeyId,
    pub key_fingerprint: KeyFingerprint,
    pub rekey_in_progress: bool,
}

/// The persistable part of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub peer_id: String,
    pub state: SessionState,
    pub outgoing_seq: u64,
    pub incoming_seq: u64,
    /// Hex of the fingerprint of the key current when the record was taken
    pub key_fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> SessionKey {
        SessionKey::from_bytes([b; 32])
    }

    #[test]
    fn ring_selects_by_key_id() {
        let mut ring = KeyRing::new(key(1));
        let first = ring.current().key_id();
        ring.rotate(key(2));
        let second = ring.current().key_id();
        ring.set_pending(key(3));
        let third = ring.pending().unwrap().key_id();

        assert_eq!(ring.select(second).unwrap().0, KeySlot::Current);
        assert_eq!(ring.select(first).unwrap().0, KeySlot::Previous);
        assert_eq!(ring.select(third).unwrap().0, KeySlot::Pending);
        assert!(ring.select(KeyId(42)).is_none());
    }

    #[test]
    fn promote_keeps_old_current_as_previous() {
        let mut ring = KeyRing::new(key(1));
        let old = ring.current().key_id();
        assert!(!ring.promote_pending());
        ring.set_pending(key(2));
        let new = ring.pending().unwrap().key_id();
        assert!(ring.promote_pending());
        assert_eq!(ring.current().key_id(), new);
        assert_eq!(ring.previous().unwrap().key_id(), old);
        assert!(ring.pending().is_none());
    }

    #[test]
    fn terminate_wipes_every_key() {
        let mut session = SecretChatSession::new(
            "s".into(),
            "peer".into(),
            Role::Creator,
            CipherSuite::default(),
            key(1),
            0,
            Instant::now(),
        );
        session.keys.rotate(key(2));
        session.keys.set_pending(key(3));
        session.terminate();
        assert!(session.keys.is_destroyed());
        assert_eq!(session.state, SessionState::Terminated);
    }

    #[test]
    fn roles_use_opposite_directions() {
        assert_eq!(Role::Creator.outgoing(), Role::Participant.incoming());
        assert_eq!(Role::Participant.outgoing(), Role::Creator.incoming());
        assert_ne!(Role::Creator.outgoing(), Role::Creator.incoming());
    }

    #[test]
    fn participant_starts_accepted() {
        let session = SecretChatSession::new(
            "s".into(),
            "peer".into(),
            Role::Participant,
            CipherSuite::Aes256Gcm,
            key(9),
            5,
            Instant::now(),
        );
        assert_eq!(session.state, SessionState::Accepted);
        let meta = session.metadata();
        assert_eq!(meta.key_fingerprint, session.fingerprint().to_hex());
        assert!(!session.snapshot().rekey_in_progress);
    }
}
