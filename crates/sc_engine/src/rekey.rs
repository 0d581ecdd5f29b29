//! ReKeyManager: replaces a session key without losing in-flight messages.
//!
//! ```text
//! initiator                                   responder
//!   Stable
//!   request_rekey ──── RekeyRequest ────▶    on_rekey_request
//!   Requested                                  new key held as *pending*
//!                                              Negotiating(Responder)
//!   on_rekey_accepted ◀── RekeyAccept ─────
//!   new key current, old kept as *previous*
//!   Negotiating(Initiator) ── RekeyCommit ─▶  on_rekey_commit
//!                                              pending → current, Stable
//!   first message under new key ◀──────────
//!   previous dropped, Stable
//! ```
//!
//! The replacement key is HKDF(salt = old key, ikm = fresh X25519 output),
//! so only a holder of the old key can reach it. A message decrypted under the
//! pending key counts as an implicit commit.
//!
//! Simultaneous requests: the larger exchange id wins, the other side drops
//! its own request and answers.

use std::time::{Duration, Instant};

use rand::RngCore;
use sc_crypto::dh::EphemeralKeyPair;
use sc_crypto::kdf::derive_rekey;
use sc_crypto::CryptoError;
use sc_proto::{RekeyAbort, RekeyAccept, RekeyCommit, RekeyRequest};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::RekeyPolicy;
use crate::error::RekeyError;
use crate::session::{KeySlot, SecretChatSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RekeyRole {
    Initiator,
    Responder,
}

#[derive(Debug)]
pub enum RekeyPhase {
    Stable,
    /// Request sent; the DH secret waits for the peer's public value
    Requested {
        exchange_id: u64,
        keypair: EphemeralKeyPair,
        started: Instant,
    },
    /// New key derived, waiting for the other side to confirm it
    Negotiating {
        role: RekeyRole,
        exchange_id: u64,
        since: Instant,
    },
}

impl RekeyPhase {
    pub fn exchange_id(&self) -> Option<u64> {
        match self {
            RekeyPhase::Stable => None,
            RekeyPhase::Requested { exchange_id, .. }
            | RekeyPhase::Negotiating { exchange_id, .. } => Some(*exchange_id),
        }
    }
}

/// Why a rekey is being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RekeyTrigger {
    Manual,
    MessageCount,
    KeyAge,
    IntegrityFailures,
    Retry,
}

/// Something `poll` wants the caller to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RekeyAction {
    /// Start a new exchange (`request_rekey`)
    Start(RekeyTrigger),
    /// Our request got no accept in time; the old key stays current
    TimedOut {
        exchange_id: u64,
        attempt: u32,
        retry_in: Duration,
    },
    /// As responder we never saw a commit; the pending key was dropped
    Abandoned { exchange_id: u64 },
}

/// Frames the responder side may produce.
#[derive(Debug)]
pub enum RekeyReply {
    Accept(RekeyAccept),
    Abort(RekeyAbort),
}

#[derive(Debug, Clone, Default)]
pub struct RekeyManager {
    policy: RekeyPolicy,
}

impl RekeyManager {
    pub fn new(policy: RekeyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RekeyPolicy {
        &self.policy
    }

    /// Automatic trigger check; `None` when nothing is due.
    pub fn should_rekey(&self, session: &SecretChatSession, now: Instant) -> Option<RekeyTrigger> {
        if session.integrity_failures >= self.policy.max_integrity_failures {
            return Some(RekeyTrigger::IntegrityFailures);
        }
        if session.messages_since_rekey >= self.policy.after_messages {
            return Some(RekeyTrigger::MessageCount);
        }
        if now.saturating_duration_since(session.key_installed_at) >= self.policy.after() {
            return Some(RekeyTrigger::KeyAge);
        }
        None
    }

    pub fn request_rekey(
        &self,
        session: &mut SecretChatSession,
        trigger: RekeyTrigger,
        now: Instant,
    ) -> Result<RekeyRequest, RekeyError> {
        if session.is_terminated() {
            return Err(RekeyError::SessionTerminated);
        }
        if !matches!(session.rekey, RekeyPhase::Stable) {
            return Err(RekeyError::InProgress);
        }

        let exchange_id = new_exchange_id();
        let keypair = EphemeralKeyPair::generate();
        let public_value = keypair.public_bytes();
        session.rekey = RekeyPhase::Requested {
            exchange_id,
            keypair,
            started: now,
        };
        session.rekey_retry_at = None;

        info!(
            target: "sc_engine",
            event = "rekey_requested",
            session_id = %session.session_id,
            exchange_id = %format_args!("{exchange_id:016x}"),
            trigger = ?trigger,
            generation = session.key_generation,
        );
        Ok(RekeyRequest {
            session_id: session.session_id.clone(),
            exchange_id,
            public_value,
        })
    }

    /// Responder side. `Ok(None)` means the request was ignored (we won a
    /// simultaneous exchange, or it is a duplicate).
    pub fn on_rekey_request(
        &self,
        session: &mut SecretChatSession,
        request: &RekeyRequest,
        now: Instant,
    ) -> Result<Option<RekeyReply>, RekeyError> {
        if session.is_terminated() {
            return Err(RekeyError::SessionTerminated);
        }
        match &session.rekey {
            RekeyPhase::Requested { exchange_id, .. } if *exchange_id > request.exchange_id => {
                info!(
                    target: "sc_engine",
                    event = "rekey_collision_won",
                    session_id = %session.session_id,
                );
                return Ok(None);
            }
            RekeyPhase::Requested { exchange_id, .. } if *exchange_id == request.exchange_id => {
                let exchange_id = *exchange_id;
                session.rekey = RekeyPhase::Stable;
                return Ok(Some(RekeyReply::Abort(RekeyAbort {
                    session_id: session.session_id.clone(),
                    exchange_id,
                    reason: "exchange id collision".into(),
                })));
            }
            RekeyPhase::Requested { .. } => {
                info!(
                    target: "sc_engine",
                    event = "rekey_collision_lost",
                    session_id = %session.session_id,
                );
            }
            RekeyPhase::Negotiating {
                role: RekeyRole::Responder,
                exchange_id,
                ..
            } if *exchange_id == request.exchange_id => return Ok(None),
            _ => {}
        }

        let keypair = EphemeralKeyPair::generate();
        let public_value = keypair.public_bytes();
        let shared = match keypair.agree(&request.public_value) {
            Ok(shared) => shared,
            Err(CryptoError::NonContributory) => {
                warn!(
                    target: "sc_engine",
                    event = "rekey_rejected",
                    session_id = %session.session_id,
                    reason = "low-order public value",
                );
                session.rekey = RekeyPhase::Stable;
                return Ok(Some(RekeyReply::Abort(RekeyAbort {
                    session_id: session.session_id.clone(),
                    exchange_id: request.exchange_id,
                    reason: "invalid public value".into(),
                })));
            }
            Err(e) => return Err(e.into()),
        };
        let next = derive_rekey(&shared, session.keys.current(), request.exchange_id)?;
        let key_id = next.key_id();

        session.keys.set_pending(next);
        session.rekey = RekeyPhase::Negotiating {
            role: RekeyRole::Responder,
            exchange_id: request.exchange_id,
            since: now,
        };

        Ok(Some(RekeyReply::Accept(RekeyAccept {
            session_id: session.session_id.clone(),
            exchange_id: request.exchange_id,
            public_value,
            key_id,
        })))
    }

    /// Initiator side: install the new key and produce the commit.
    pub fn on_rekey_accepted(
        &self,
        session: &mut SecretChatSession,
        accept: &RekeyAccept,
        now: Instant,
    ) -> Result<RekeyCommit, RekeyError> {
        let keypair = match std::mem::replace(&mut session.rekey, RekeyPhase::Stable) {
            RekeyPhase::Requested {
                exchange_id,
                keypair,
                ..
            } if exchange_id == accept.exchange_id => keypair,
            other => {
                session.rekey = other;
                return Err(RekeyError::UnknownExchange(accept.exchange_id));
            }
        };

        let shared = keypair.agree(&accept.public_value).map_err(|e| match e {
            CryptoError::NonContributory => {
                RekeyError::InvalidParameters("low-order public value".into())
            }
            other => RekeyError::Crypto(other),
        })?;
        let next = derive_rekey(&shared, session.keys.current(), accept.exchange_id)?;
        if next.key_id() != accept.key_id {
            return Err(RekeyError::FingerprintMismatch);
        }

        let key_id = next.key_id();
        session.keys.rotate(next);
        session.mark_key_installed(now);
        session.rekey = RekeyPhase::Negotiating {
            role: RekeyRole::Initiator,
            exchange_id: accept.exchange_id,
            since: now,
        };
        info!(
            target: "sc_engine",
            event = "rekey_installed",
            session_id = %session.session_id,
            key_id = %key_id,
            generation = session.key_generation,
        );

        Ok(RekeyCommit {
            session_id: session.session_id.clone(),
            exchange_id: accept.exchange_id,
            key_id,
        })
    }

    /// Responder side: the initiator confirmed; promote the pending key.
    pub fn on_rekey_commit(
        &self,
        session: &mut SecretChatSession,
        commit: &RekeyCommit,
        now: Instant,
    ) -> Result<(), RekeyError> {
        match &session.rekey {
            RekeyPhase::Negotiating {
                role: RekeyRole::Responder,
                exchange_id,
                ..
            } if *exchange_id == commit.exchange_id => {}
            _ => return Err(RekeyError::UnknownExchange(commit.exchange_id)),
        }
        let pending_id = session.keys.pending().map(|k| k.key_id());
        if pending_id != Some(commit.key_id) {
            return Err(RekeyError::FingerprintMismatch);
        }
        self.promote(session, now);
        Ok(())
    }

    pub fn on_rekey_abort(
        &self,
        session: &mut SecretChatSession,
        abort: &RekeyAbort,
        now: Instant,
    ) -> Result<(), RekeyError> {
        if session.rekey.exchange_id() != Some(abort.exchange_id) {
            return Err(RekeyError::UnknownExchange(abort.exchange_id));
        }
        warn!(
            target: "sc_engine",
            event = "rekey_aborted_by_peer",
            session_id = %session.session_id,
            reason = %abort.reason,
        );
        let was_requested = matches!(session.rekey, RekeyPhase::Requested { .. });
        let held_pending = matches!(
            session.rekey,
            RekeyPhase::Negotiating {
                role: RekeyRole::Responder,
                ..
            }
        );
        // An initiator that already installed the new key keeps it.
        session.rekey = RekeyPhase::Stable;
        if was_requested {
            self.schedule_retry(session, now);
        } else if held_pending {
            session.keys.drop_pending();
        }
        Ok(())
    }

    /// Feed back which key slot authenticated an incoming message.
    pub fn on_decrypted(&self, session: &mut SecretChatSession, slot: KeySlot, now: Instant) {
        match slot {
            KeySlot::Pending => {
                if matches!(
                    session.rekey,
                    RekeyPhase::Negotiating {
                        role: RekeyRole::Responder,
                        ..
                    }
                ) {
                    self.promote(session, now);
                }
            }
            KeySlot::Current => {
                if session.keys.previous().is_some() {
                    session.keys.drop_previous();
                }
                if matches!(
                    session.rekey,
                    RekeyPhase::Negotiating {
                        role: RekeyRole::Initiator,
                        ..
                    }
                ) {
                    session.rekey = RekeyPhase::Stable;
                    info!(
                        target: "sc_engine",
                        event = "rekey_confirmed",
                        session_id = %session.session_id,
                        generation = session.key_generation,
                    );
                }
            }
            KeySlot::Previous => {}
        }
    }

    /// Timeouts, retries and automatic triggers.
    pub fn poll(&self, session: &mut SecretChatSession, now: Instant) -> Option<RekeyAction> {
        if session.is_terminated() {
            return None;
        }
        let timeout = self.policy.timeout();
        match &session.rekey {
            RekeyPhase::Requested {
                exchange_id,
                started,
                ..
            } => {
                if now.saturating_duration_since(*started) < timeout {
                    return None;
                }
                let exchange_id = *exchange_id;
                let retry_in = self.schedule_retry(session, now);
                session.rekey = RekeyPhase::Stable;
                Some(RekeyAction::TimedOut {
                    exchange_id,
                    attempt: session.rekey_attempts,
                    retry_in,
                })
            }
            RekeyPhase::Negotiating {
                role,
                exchange_id,
                since,
            } => {
                if now.saturating_duration_since(*since) < timeout {
                    return None;
                }
                let (role, exchange_id) = (*role, *exchange_id);
                session.rekey = RekeyPhase::Stable;
                match role {
                    RekeyRole::Responder => {
                        session.keys.drop_pending();
                        Some(RekeyAction::Abandoned { exchange_id })
                    }
                    // Keep `previous` until the peer sends under the new key.
                    RekeyRole::Initiator => None,
                }
            }
            RekeyPhase::Stable => match session.rekey_retry_at {
                Some(at) if now < at => None,
                Some(_) => {
                    session.rekey_retry_at = None;
                    Some(RekeyAction::Start(RekeyTrigger::Retry))
                }
                None => self.should_rekey(session, now).map(RekeyAction::Start),
            },
        }
    }

    fn promote(&self, session: &mut SecretChatSession, now: Instant) {
        if session.keys.promote_pending() {
            session.mark_key_installed(now);
            session.rekey = RekeyPhase::Stable;
            info!(
                target: "sc_engine",
                event = "rekey_installed",
                session_id = %session.session_id,
                key_id = %session.keys.current().key_id(),
                generation = session.key_generation,
            );
        }
    }

    fn schedule_retry(&self, session: &mut SecretChatSession, now: Instant) -> Duration {
        session.rekey_attempts = session.rekey_attempts.saturating_add(1);
        let retry_in = self.policy.backoff(session.rekey_attempts);
        session.rekey_retry_at = Some(now.checked_add(retry_in).unwrap_or(now));
        retry_in
    }
}

fn new_exchange_id() -> u64 {
    loop {
        let id = rand::rngs::OsRng.next_u64();
        if id != 0 {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::MessageCipher;
    use crate::key_exchange::KeyExchange;
    use crate::sequence::SequenceTracker;
    use sc_crypto::CipherSuite;

    fn pair() -> (SecretChatSession, SecretChatSession) {
        let kx = KeyExchange::new(vec![CipherSuite::default()], Duration::from_secs(30), 0);
        let state = kx.begin_handshake("bob").unwrap();
        let (bob, accept) = kx.accept_handshake("alice", &state.request()).unwrap();
        let alice = kx.complete_handshake(state, &accept).unwrap();
        (alice, bob)
    }

    fn accept_of(reply: Option<RekeyReply>) -> RekeyAccept {
        match reply {
            Some(RekeyReply::Accept(a)) => a,
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[test]
    fn full_exchange_rotates_both_sides() {
        let mgr = RekeyManager::default();
        let (mut alice, mut bob) = pair();
        let now = Instant::now();
        let old = alice.keys.current().key_id();

        let req = mgr.request_rekey(&mut alice, RekeyTrigger::Manual, now).unwrap();
        assert!(matches!(alice.rekey, RekeyPhase::Requested { .. }));
        let accept = accept_of(mgr.on_rekey_request(&mut bob, &req, now).unwrap());
        assert_eq!(bob.keys.current().key_id(), old);

        let commit = mgr.on_rekey_accepted(&mut alice, &accept, now).unwrap();
        assert_eq!(alice.keys.previous().unwrap().key_id(), old);
        mgr.on_rekey_commit(&mut bob, &commit, now).unwrap();

        assert_eq!(alice.fingerprint(), bob.fingerprint());
        assert_ne!(alice.keys.current().key_id(), old);
        assert_eq!(alice.key_generation, 1);
        assert_eq!(bob.key_generation, 1);
        assert!(matches!(bob.rekey, RekeyPhase::Stable));
    }

    #[test]
    fn in_flight_messages_survive_rotation() {
        let mgr = RekeyManager::default();
        let cipher = MessageCipher::default();
        let tracker = SequenceTracker::default();
        let (mut alice, mut bob) = pair();
        let now = Instant::now();

        let req = mgr.request_rekey(&mut alice, RekeyTrigger::Manual, now).unwrap();
        let accept = accept_of(mgr.on_rekey_request(&mut bob, &req, now).unwrap());
        // Bob keeps sending under the old key until he sees the commit.
        let from_bob_old = cipher.encrypt(&mut bob, &tracker, b"old", None).unwrap();
        let _commit = mgr.on_rekey_accepted(&mut alice, &accept, now).unwrap();

        let d = cipher.decrypt(&mut alice, &tracker, &from_bob_old).unwrap();
        assert_eq!(d.slot, KeySlot::Previous);
        mgr.on_decrypted(&mut alice, d.slot, now);

        // Commit lost: Alice's first new-key message is an implicit commit.
        let from_alice_new = cipher.encrypt(&mut alice, &tracker, b"new", None).unwrap();
        let d = cipher.decrypt(&mut bob, &tracker, &from_alice_new).unwrap();
        assert_eq!(d.slot, KeySlot::Pending);
        mgr.on_decrypted(&mut bob, d.slot, now);
        assert_eq!(bob.fingerprint(), alice.fingerprint());

        let reply = cipher.encrypt(&mut bob, &tracker, b"ack", None).unwrap();
        let d = cipher.decrypt(&mut alice, &tracker, &reply).unwrap();
        assert_eq!(d.slot, KeySlot::Current);
        mgr.on_decrypted(&mut alice, d.slot, now);
        assert!(alice.keys.previous().is_none());
        assert!(matches!(alice.rekey, RekeyPhase::Stable));
    }

    #[test]
    fn second_request_while_in_progress() {
        let mgr = RekeyManager::default();
        let (mut alice, _) = pair();
        let now = Instant::now();
        mgr.request_rekey(&mut alice, RekeyTrigger::Manual, now).unwrap();
        assert!(matches!(
            mgr.request_rekey(&mut alice, RekeyTrigger::Manual, now),
            Err(RekeyError::InProgress)
        ));
    }

    #[test]
    fn simultaneous_requests_higher_id_wins() {
        let mgr = RekeyManager::default();
        let (mut alice, mut bob) = pair();
        let now = Instant::now();

        let mut req_a = mgr.request_rekey(&mut alice, RekeyTrigger::Manual, now).unwrap();
        let mut req_b = mgr.request_rekey(&mut bob, RekeyTrigger::Manual, now).unwrap();
        // Force a known winner.
        req_a.exchange_id = u64::MAX;
        if let RekeyPhase::Requested { exchange_id, .. } = &mut alice.rekey {
            *exchange_id = u64::MAX;
        }
        req_b.exchange_id = 1;
        if let RekeyPhase::Requested { exchange_id, .. } = &mut bob.rekey {
            *exchange_id = 1;
        }

        // Alice ignores Bob's losing request; Bob answers Alice's.
        assert!(mgr.on_rekey_request(&mut alice, &req_b, now).unwrap().is_none());
        let accept = accept_of(mgr.on_rekey_request(&mut bob, &req_a, now).unwrap());
        let commit = mgr.on_rekey_accepted(&mut alice, &accept, now).unwrap();
        mgr.on_rekey_commit(&mut bob, &commit, now).unwrap();
        assert_eq!(alice.fingerprint(), bob.fingerprint());
    }

    #[test]
    fn mismatched_accept_is_rejected() {
        let mgr = RekeyManager::default();
        let (mut alice, mut bob) = pair();
        let now = Instant::now();
        let req = mgr.request_rekey(&mut alice, RekeyTrigger::Manual, now).unwrap();
        let mut accept = accept_of(mgr.on_rekey_request(&mut bob, &req, now).unwrap());
        accept.key_id = sc_crypto::KeyId(1);
        let old = alice.keys.current().key_id();
        assert!(matches!(
            mgr.on_rekey_accepted(&mut alice, &accept, now),
            Err(RekeyError::FingerprintMismatch)
        ));
        assert_eq!(alice.keys.current().key_id(), old);
        assert!(matches!(alice.rekey, RekeyPhase::Stable));
    }

    #[test]
    fn unknown_accept_leaves_state_alone() {
        let mgr = RekeyManager::default();
        let (mut alice, mut bob) = pair();
        let now = Instant::now();
        let req = mgr.request_rekey(&mut alice, RekeyTrigger::Manual, now).unwrap();
        let mut accept = accept_of(mgr.on_rekey_request(&mut bob, &req, now).unwrap());
        accept.exchange_id ^= 1;
        assert!(matches!(
            mgr.on_rekey_accepted(&mut alice, &accept, now),
            Err(RekeyError::UnknownExchange(_))
        ));
        assert!(matches!(alice.rekey, RekeyPhase::Requested { .. }));
    }

    #[test]
    fn timeout_keeps_old_key_and_backs_off() {
        let mgr = RekeyManager::default();
        let (mut alice, _) = pair();
        let start = Instant::now();
        let old = alice.keys.current().key_id();

        mgr.request_rekey(&mut alice, RekeyTrigger::Manual, start).unwrap();
        assert_eq!(mgr.poll(&mut alice, start + Duration::from_secs(10)), None);

        let t1 = start + Duration::from_secs(30);
        match mgr.poll(&mut alice, t1) {
            Some(RekeyAction::TimedOut {
                attempt, retry_in, ..
            }) => {
                assert_eq!(attempt, 1);
                assert_eq!(retry_in, Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(alice.keys.current().key_id(), old);
        assert!(matches!(alice.rekey, RekeyPhase::Stable));

        assert_eq!(mgr.poll(&mut alice, t1 + Duration::from_secs(4)), None);
        assert_eq!(
            mgr.poll(&mut alice, t1 + Duration::from_secs(5)),
            Some(RekeyAction::Start(RekeyTrigger::Retry))
        );

        let t2 = t1 + Duration::from_secs(5);
        mgr.request_rekey(&mut alice, RekeyTrigger::Retry, t2).unwrap();
        match mgr.poll(&mut alice, t2 + Duration::from_secs(30)) {
            Some(RekeyAction::TimedOut {
                attempt, retry_in, ..
            }) => {
                assert_eq!(attempt, 2);
                assert_eq!(retry_in, Duration::from_secs(10));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn oversized_backoff_does_not_overflow() {
        let mgr = RekeyManager::new(RekeyPolicy {
            backoff_base_secs: u64::MAX,
            backoff_max_secs: u64::MAX,
            ..Default::default()
        });
        let (mut alice, _) = pair();
        let start = Instant::now();
        mgr.request_rekey(&mut alice, RekeyTrigger::Manual, start).unwrap();

        let t1 = start + Duration::from_secs(30);
        assert!(matches!(
            mgr.poll(&mut alice, t1),
            Some(RekeyAction::TimedOut { .. })
        ));
        assert!(alice.rekey_retry_at.is_some());
    }

    #[test]
    fn responder_abandons_uncommitted_key() {
        let mgr = RekeyManager::default();
        let (mut alice, mut bob) = pair();
        let now = Instant::now();
        let req = mgr.request_rekey(&mut alice, RekeyTrigger::Manual, now).unwrap();
        mgr.on_rekey_request(&mut bob, &req, now).unwrap();
        assert!(bob.keys.pending().is_some());

        let action = mgr.poll(&mut bob, now + Duration::from_secs(31));
        assert_eq!(
            action,
            Some(RekeyAction::Abandoned {
                exchange_id: req.exchange_id
            })
        );
        assert!(bob.keys.pending().is_none());
    }

    #[test]
    fn automatic_triggers() {
        let mgr = RekeyManager::default();
        let (mut alice, _) = pair();
        let now = alice.key_installed_at;
        assert_eq!(mgr.poll(&mut alice, now), None);

        alice.messages_since_rekey = 100;
        assert_eq!(
            mgr.should_rekey(&alice, now),
            Some(RekeyTrigger::MessageCount)
        );
        alice.messages_since_rekey = 0;

        assert_eq!(
            mgr.should_rekey(&alice, now + Duration::from_secs(7 * 24 * 3600)),
            Some(RekeyTrigger::KeyAge)
        );

        alice.integrity_failures = 3;
        assert_eq!(
            mgr.poll(&mut alice, now),
            Some(RekeyAction::Start(RekeyTrigger::IntegrityFailures))
        );
    }

    #[test]
    fn abort_clears_matching_exchange() {
        let mgr = RekeyManager::default();
        let (mut alice, mut bob) = pair();
        let now = Instant::now();
        let req = mgr.request_rekey(&mut alice, RekeyTrigger::Manual, now).unwrap();
        mgr.on_rekey_request(&mut bob, &req, now).unwrap();

        let abort = RekeyAbort {
            session_id: alice.session_id.clone(),
            exchange_id: req.exchange_id,
            reason: "test".into(),
        };
        mgr.on_rekey_abort(&mut bob, &abort, now).unwrap();
        assert!(bob.keys.pending().is_none());
        mgr.on_rekey_abort(&mut alice, &abort, now).unwrap();
        assert!(alice.rekey_retry_at.is_some());

        assert!(matches!(
            mgr.on_rekey_abort(&mut alice, &abort, now),
            Err(RekeyError::UnknownExchange(_))
        ));
    }
}
