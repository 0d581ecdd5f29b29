//! Ephemeral X25519 handshake that creates a secret chat.
//!
//! ```text
//! creator                                     participant
//!   begin_handshake ── HandshakeRequest ──▶   accept_handshake
//!                                              (session: Accepted)
//!   complete_handshake ◀── HandshakeAccept ──
//!   (session: Active)
//! ```
//!
//! Both public values and the session id are bound into the key derivation.
//! The accept carries the participant's key id so a mismatch (tampered public
//! value, wrong group) is caught before any message is encrypted.

use std::time::{Duration, Instant};

use sc_crypto::dh::{DhGroup, EphemeralKeyPair};
use sc_crypto::{kdf, CipherSuite, CryptoError};
use sc_proto::{HandshakeAccept, HandshakeRequest};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::destruct::validate_ttl;
use crate::error::KeyExchangeError;
use crate::session::{Role, SecretChatSession};

/// Creator-side state between sending the request and receiving the accept.
/// The DH secret is consumed on completion and wiped on drop otherwise.
#[derive(Debug)]
pub struct KeyExchangeState {
    session_id: String,
    peer_id: String,
    keypair: EphemeralKeyPair,
    suites: Vec<CipherSuite>,
    ttl_default: u32,
    deadline: Instant,
}

impl KeyExchangeState {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn request(&self) -> HandshakeRequest {
        HandshakeRequest {
            session_id: self.session_id.clone(),
            group: self.keypair.group(),
            public_value: self.keypair.public_bytes(),
            suites: self.suites.clone(),
            ttl_default: self.ttl_default,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeyExchange {
    suites: Vec<CipherSuite>,
    timeout: Duration,
    ttl_default: u32,
}

impl KeyExchange {
    pub fn new(suites: Vec<CipherSuite>, timeout: Duration, ttl_default: u32) -> Self {
        Self {
            suites,
            timeout,
            ttl_default,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn begin_handshake(&self, peer_id: &str) -> Result<KeyExchangeState, KeyExchangeError> {
        let deadline = crate::monotonic_now()
            .checked_add(self.timeout)
            .ok_or_else(|| {
                KeyExchangeError::InvalidParameters(format!(
                    "handshake timeout {:?} out of range",
                    self.timeout
                ))
            })?;
        Ok(KeyExchangeState {
            session_id: Uuid::new_v4().to_string(),
            peer_id: peer_id.to_string(),
            keypair: EphemeralKeyPair::generate(),
            suites: self.suites.clone(),
            ttl_default: self.ttl_default,
            deadline,
        })
    }

    /// Participant side: answer a request and install the resulting session
    /// in `Accepted` state.
    pub fn accept_handshake(
        &self,
        peer_id: &str,
        request: &HandshakeRequest,
    ) -> Result<(SecretChatSession, HandshakeAccept), KeyExchangeError> {
        Uuid::parse_str(&request.session_id).map_err(|_| {
            KeyExchangeError::InvalidParameters(format!(
                "malformed session id {:?}",
                request.session_id
            ))
        })?;
        check_group(request.group)?;
        validate_ttl(request.ttl_default)
            .map_err(|e| KeyExchangeError::InvalidParameters(e.to_string()))?;

        let suite = self
            .suites
            .iter()
            .copied()
            .find(|s| request.suites.contains(s))
            .ok_or_else(|| {
                KeyExchangeError::InvalidParameters("no common cipher suite".into())
            })?;

        let keypair = EphemeralKeyPair::generate();
        let own_public = keypair.public_bytes();
        let shared = keypair.agree(&request.public_value).map_err(non_contributory)?;
        let key = kdf::derive_session_key(
            &shared,
            &request.session_id,
            &request.public_value,
            &own_public,
        )?;
        let key_id = key.key_id();

        let session = SecretChatSession::new(
            request.session_id.clone(),
            peer_id.to_string(),
            Role::Participant,
            suite,
            key,
            request.ttl_default,
            crate::monotonic_now(),
        );
        debug!(
            target: "sc_engine",
            event = "handshake_accepted",
            session_id = %session.session_id,
            suite = ?suite,
            key_id = %key_id,
        );

        let accept = HandshakeAccept {
            session_id: request.session_id.clone(),
            group: DhGroup::X25519,
            public_value: own_public,
            suite,
            key_id,
        };
        Ok((session, accept))
    }

    /// Creator side: finish the handshake with the participant's accept.
    pub fn complete_handshake(
        &self,
        state: KeyExchangeState,
        accept: &HandshakeAccept,
    ) -> Result<SecretChatSession, KeyExchangeError> {
        if crate::monotonic_now() > state.deadline {
            return Err(KeyExchangeError::HandshakeTimeout);
        }
        if accept.session_id != state.session_id {
            return Err(KeyExchangeError::InvalidParameters(
                "accept is for a different session".into(),
            ));
        }
        check_group(accept.group)?;
        if !state.suites.contains(&accept.suite) {
            return Err(KeyExchangeError::InvalidParameters(format!(
                "peer selected a suite that was not offered: {:?}",
                accept.suite
            )));
        }

        let KeyExchangeState {
            session_id,
            peer_id,
            keypair,
            ttl_default,
            ..
        } = state;
        let own_public = keypair.public_bytes();
        let shared = keypair.agree(&accept.public_value).map_err(non_contributory)?;
        let key = kdf::derive_session_key(&shared, &session_id, &own_public, &accept.public_value)?;

        if key.key_id() != accept.key_id {
            warn!(
                target: "sc_engine",
                event = "handshake_key_mismatch",
                session_id = %session_id,
                local = %key.key_id(),
                remote = %accept.key_id,
            );
            return Err(KeyExchangeError::InvalidParameters(
                "peer derived a different session key".into(),
            ));
        }

        Ok(SecretChatSession::new(
            session_id,
            peer_id,
            Role::Creator,
            accept.suite,
            key,
            ttl_default,
            crate::monotonic_now(),
        ))
    }
}

fn check_group(group: DhGroup) -> Result<(), KeyExchangeError> {
    match group {
        DhGroup::X25519 => Ok(()),
    }
}

fn non_contributory(err: CryptoError) -> KeyExchangeError {
    match err {
        CryptoError::NonContributory => {
            KeyExchangeError::InvalidParameters("low-order DH public value".into())
        }
        other => KeyExchangeError::Crypto(other),
    }
}
