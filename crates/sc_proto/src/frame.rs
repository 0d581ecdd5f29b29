//! Frames exchanged between two secret-chat engines.
//!
//! The transport sees only opaque bytes. What it carries, once decoded:
//!   - handshake request / accept (DH public values, suite negotiation)
//!   - encrypted messages
//!   - rekey request / accept / commit / abort
//!   - terminate (peer discarded the chat)
//!
//! Everything except `EncryptedMessage.ciphertext` is visible to anyone on
//! the path. Public values are safe to expose; key ids only name a key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sc_crypto::{dh::DhGroup, CipherSuite, KeyId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    HandshakeRequest(HandshakeRequest),
    HandshakeAccept(HandshakeAccept),
    Message(EncryptedMessage),
    RekeyRequest(RekeyRequest),
    RekeyAccept(RekeyAccept),
    RekeyCommit(RekeyCommit),
    RekeyAbort(RekeyAbort),
    Terminate { session_id: String },
}

impl Frame {
    /// Session the frame belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Frame::HandshakeRequest(f) => &f.session_id,
            Frame::HandshakeAccept(f) => &f.session_id,
            Frame::Message(f) => &f.session_id,
            Frame::RekeyRequest(f) => &f.session_id,
            Frame::RekeyAccept(f) => &f.session_id,
            Frame::RekeyCommit(f) => &f.session_id,
            Frame::RekeyAbort(f) => &f.session_id,
            Frame::Terminate { session_id } => session_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::HandshakeRequest(_) => "handshake_request",
            Frame::HandshakeAccept(_) => "handshake_accept",
            Frame::Message(_) => "message",
            Frame::RekeyRequest(_) => "rekey_request",
            Frame::RekeyAccept(_) => "rekey_accept",
            Frame::RekeyCommit(_) => "rekey_commit",
            Frame::RekeyAbort(_) => "rekey_abort",
            Frame::Terminate { .. } => "terminate",
        }
    }
}

// ── Handshake ────────────────────────────────────────────────────────────────

/// Sent by the creator to open a secret chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub session_id: String,
    pub group: DhGroup,
    /// Creator's ephemeral X25519 public value
    #[serde(with = "crate::b64::array")]
    pub public_value: [u8; 32],
    /// Cipher suites the creator accepts, most preferred first
    pub suites: Vec<CipherSuite>,
    /// Default self-destruct timer for the new chat (0 = off)
    #[serde(default)]
    pub ttl_default: u32,
}

/// Participant's answer; carries the suite it picked and the id of the key it
/// derived so the creator can detect a mismatch before the first message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeAccept {
    pub session_id: String,
    pub group: DhGroup,
    #[serde(with = "crate::b64::array")]
    pub public_value: [u8; 32],
    pub suite: CipherSuite,
    pub key_id: KeyId,
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// An encrypted secret-chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub session_id: String,
    pub seq: u64,
    /// Id of the session key that encrypted this message
    pub key_id: KeyId,
    /// Per-message random salt mixed into the message key derivation
    #[serde(with = "crate::b64::array")]
    pub salt: [u8; 16],
    #[serde(with = "crate::b64")]
    pub ciphertext: Vec<u8>,
    /// Detached AEAD tag over ciphertext + associated data
    #[serde(with = "crate::b64::array")]
    pub mac: [u8; 16],
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u32>,
}

impl EncryptedMessage {
    pub fn associated_data(&self) -> Vec<u8> {
        message_aad(
            &self.session_id,
            self.seq,
            self.key_id,
            &self.sent_at,
            self.ttl_seconds,
        )
    }
}

/// Associated data bound into every message tag: every header field the
/// receiver acts on before or after decryption.
pub fn message_aad(
    session_id: &str,
    seq: u64,
    key_id: KeyId,
    sent_at: &DateTime<Utc>,
    ttl_seconds: Option<u32>,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(session_id.len() + 40);
    aad.extend_from_slice(b"sc-msg-aad-v1\x00");
    aad.extend_from_slice(session_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(&seq.to_be_bytes());
    aad.extend_from_slice(&key_id.0.to_be_bytes());
    aad.extend_from_slice(&sent_at.timestamp_millis().to_be_bytes());
    match ttl_seconds {
        Some(ttl) => {
            aad.push(1);
            aad.extend_from_slice(&ttl.to_be_bytes());
        }
        None => aad.push(0),
    }
    aad
}

// ── Rekey ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekeyRequest {
    pub session_id: String,
    /// Random, nonzero; the larger id wins when both sides request at once
    pub exchange_id: u64,
    #[serde(with = "crate::b64::array")]
    pub public_value: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekeyAccept {
    pub session_id: String,
    pub exchange_id: u64,
    #[serde(with = "crate::b64::array")]
    pub public_value: [u8; 32],
    /// Id of the replacement key the responder derived
    pub key_id: KeyId,
}

/// Sent by the rekey initiator once the new key is installed on its side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekeyCommit {
    pub session_id: String,
    pub exchange_id: u64,
    pub key_id: KeyId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekeyAbort {
    pub session_id: String,
    pub exchange_id: u64,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_internally_tagged() {
        let frame = Frame::Terminate {
            session_id: "abc".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "terminate");
        assert_eq!(json["session_id"], "abc");
        assert_eq!(frame.session_id(), "abc");
    }

    #[test]
    fn aad_binds_ttl_and_seq() {
        let now = Utc::now();
        let a = message_aad("s", 1, KeyId(9), &now, None);
        let b = message_aad("s", 1, KeyId(9), &now, Some(5));
        let c = message_aad("s", 2, KeyId(9), &now, None);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn binary_fields_travel_as_base64() {
        let msg = EncryptedMessage {
            session_id: "s".into(),
            seq: 1,
            key_id: KeyId(1),
            salt: [0xFF; 16],
            ciphertext: vec![1, 2, 3],
            mac: [0u8; 16],
            sent_at: Utc::now(),
            ttl_seconds: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["ciphertext"], "AQID");
        assert!(json.get("ttl_seconds").is_none());
        let back: EncryptedMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}
