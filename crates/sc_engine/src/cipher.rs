//! MessageCipher: per-message encryption under the session key.
//!
//! # Encrypt
//! 1. Reserve the next outgoing seq
//! 2. Fresh 16-byte salt; HKDF(current key, salt, direction || seq) → AEAD key + nonce
//! 3. Pad plaintext to a bucket, seal with the header as associated data
//!
//! # Decrypt
//! 1. Pick the key named by `key_id` (current, previous or pending)
//! 2. Verify the tag; nothing is released on failure
//! 3. Only then check the sequence number
//! 4. Unpad and hand the plaintext back
//!
//! A failure in step 1 or 2 is an `IntegrityFailure` and bumps the session's
//! consecutive failure count. Any authenticated message resets it.

use chrono::{DateTime, Utc};
use sc_crypto::kdf::{derive_message_keys, generate_message_salt};
use sc_proto::codec::{pad_to_bucket, unpad};
use sc_proto::frame::message_aad;
use sc_proto::{EncryptedMessage, PaddingMode};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::CipherError;
use crate::sequence::SequenceTracker;
use crate::session::{KeySlot, SecretChatSession, SessionState};

/// Result of a successful decrypt.
#[derive(Debug)]
pub struct Decrypted {
    pub seq: u64,
    pub plaintext: Zeroizing<Vec<u8>>,
    pub slot: KeySlot,
    pub ttl_seconds: Option<u32>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCipher {
    padding: PaddingMode,
}

impl MessageCipher {
    pub fn new(padding: PaddingMode) -> Self {
        Self { padding }
    }

    pub fn encrypt(
        &self,
        session: &mut SecretChatSession,
        tracker: &SequenceTracker,
        plaintext: &[u8],
        ttl_seconds: Option<u32>,
    ) -> Result<EncryptedMessage, CipherError> {
        if session.is_terminated() {
            return Err(CipherError::SessionTerminated);
        }
        let padded = Zeroizing::new(pad_to_bucket(plaintext, self.padding)?);
        let seq = tracker.next_outgoing(session)?;

        let key = session.keys.current();
        let key_id = key.key_id();
        let salt = generate_message_salt();
        let sent_at = Utc::now();
        let aad = message_aad(&session.session_id, seq, key_id, &sent_at, ttl_seconds);
        let keys = derive_message_keys(key, &salt, seq, session.role.outgoing())?;
        let (ciphertext, mac) = session.suite.seal(&keys, &padded, &aad)?;

        session.messages_since_rekey += 1;
        debug!(
            target: "sc_engine",
            event = "message_encrypted",
            session_id = %session.session_id,
            seq,
            key_id = %key_id,
            len = ciphertext.len(),
        );

        Ok(EncryptedMessage {
            session_id: session.session_id.clone(),
            seq,
            key_id,
            salt,
            ciphertext,
            mac,
            sent_at,
            ttl_seconds,
        })
    }

    pub fn decrypt(
        &self,
        session: &mut SecretChatSession,
        tracker: &SequenceTracker,
        message: &EncryptedMessage,
    ) -> Result<Decrypted, CipherError> {
        if message.session_id != session.session_id {
            return Err(CipherError::WrongSession(message.session_id.clone()));
        }
        if session.is_terminated() {
            return Err(CipherError::SessionTerminated);
        }

        let Some((slot, key)) = session.keys.select(message.key_id) else {
            session.integrity_failures = session.integrity_failures.saturating_add(1);
            return Err(CipherError::IntegrityFailure);
        };
        let keys = derive_message_keys(key, &message.salt, message.seq, session.role.incoming())?;
        let padded = match session.suite.open(
            &keys,
            &message.ciphertext,
            &message.mac,
            &message.associated_data(),
        ) {
            Ok(p) => p,
            Err(_) => {
                session.integrity_failures = session.integrity_failures.saturating_add(1);
                return Err(CipherError::IntegrityFailure);
            }
        };
        session.integrity_failures = 0;

        tracker.accept_incoming(session, message.seq)?;
        let plaintext = Zeroizing::new(unpad(&padded)?);

        session.messages_since_rekey += 1;
        if session.state == SessionState::Accepted {
            session.state = SessionState::Active;
            info!(
                target: "sc_engine",
                event = "session_active",
                session_id = %session.session_id,
            );
        }

        Ok(Decrypted {
            seq: message.seq,
            plaintext,
            slot,
            ttl_seconds: message.ttl_seconds,
            sent_at: message.sent_at,
        })
    }
}
