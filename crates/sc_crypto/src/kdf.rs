//! Key derivation functions (HKDF-SHA256).
//!
//! `derive_session_key`: DH output of the initial handshake → session key.
//!
//! `derive_rekey`: fresh DH output salted with the outgoing key → next key.
//!   Only a party that holds the old key can reach the new one.
//!
//! `derive_message_keys`: session key + per-message salt + seq + direction →
//!   one-shot AEAD key and nonce.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{error::CryptoError, keys::SessionKey};

pub const MESSAGE_SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;

const SESSION_SALT: &[u8] = b"sc-secret-chat-v1";

/// Which side of the chat produced a message. Both sides share one key, so
/// the direction is mixed into the per-message derivation to keep the two
/// streams apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    FromCreator,
    FromParticipant,
}

impl Direction {
    fn as_byte(self) -> u8 {
        match self {
            Direction::FromCreator => 0x00,
            Direction::FromParticipant => 0x08,
        }
    }
}

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Session key for a freshly completed handshake.
///
/// Both public values are bound into `info` in creator→participant order, so
/// a swapped or replaced value yields a different key on each side.
pub fn derive_session_key(
    shared_secret: &[u8; 32],
    session_id: &str,
    creator_public: &[u8; 32],
    participant_public: &[u8; 32],
) -> Result<SessionKey, CryptoError> {
    let mut info = Vec::with_capacity(16 + session_id.len() + 64);
    info.extend_from_slice(b"sc-session-key\x00");
    info.extend_from_slice(session_id.as_bytes());
    info.push(0);
    info.extend_from_slice(creator_public);
    info.extend_from_slice(participant_public);

    let mut key = Zeroizing::new([0u8; 32]);
    hkdf_expand(shared_secret, Some(SESSION_SALT), &info, &mut key[..])?;
    Ok(SessionKey::from_bytes(*key))
}

/// Replacement key for a rekey exchange.
pub fn derive_rekey(
    shared_secret: &[u8; 32],
    old_key: &SessionKey,
    exchange_id: u64,
) -> Result<SessionKey, CryptoError> {
    let mut info = Vec::with_capacity(24);
    info.extend_from_slice(b"sc-rekey-v1\x00");
    info.extend_from_slice(&exchange_id.to_be_bytes());

    let mut key = Zeroizing::new([0u8; 32]);
    hkdf_expand(shared_secret, Some(&old_key.expose()[..]), &info, &mut key[..])?;
    Ok(SessionKey::from_bytes(*key))
}

/// One-shot AEAD key + nonce for a single message.
pub struct MessageKeys {
    pub key: Zeroizing<[u8; 32]>,
    pub nonce: [u8; NONCE_LEN],
}

pub fn derive_message_keys(
    session_key: &SessionKey,
    salt: &[u8; MESSAGE_SALT_LEN],
    seq: u64,
    direction: Direction,
) -> Result<MessageKeys, CryptoError> {
    let mut info = [0u8; 18];
    info[..8].copy_from_slice(b"sc-msg\x00\x01");
    info[8] = direction.as_byte();
    info[9] = 0;
    info[10..].copy_from_slice(&seq.to_be_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), &session_key.expose()[..]);
    let mut okm = Zeroizing::new([0u8; 32 + NONCE_LEN]);
    hk.expand(&info, &mut okm[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&okm[..32]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&okm[32..]);
    Ok(MessageKeys { key, nonce })
}

/// Fresh random per-message salt.
pub fn generate_message_salt() -> [u8; MESSAGE_SALT_LEN] {
    use rand::RngCore;
    let mut salt = [0u8; MESSAGE_SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_depends_on_public_order() {
        let shared = [4u8; 32];
        let a = derive_session_key(&shared, "s", &[1u8; 32], &[2u8; 32]).unwrap();
        let b = derive_session_key(&shared, "s", &[2u8; 32], &[1u8; 32]).unwrap();
        assert_ne!(a.key_id(), b.key_id());
    }

    #[test]
    fn rekey_depends_on_old_key() {
        let shared = [4u8; 32];
        let old1 = SessionKey::from_bytes([1u8; 32]);
        let old2 = SessionKey::from_bytes([2u8; 32]);
        let n1 = derive_rekey(&shared, &old1, 7).unwrap();
        let n2 = derive_rekey(&shared, &old2, 7).unwrap();
        assert_ne!(n1.key_id(), n2.key_id());
    }

    #[test]
    fn message_keys_separate_directions_and_seqs() {
        let key = SessionKey::from_bytes([8u8; 32]);
        let salt = [0u8; MESSAGE_SALT_LEN];
        let a = derive_message_keys(&key, &salt, 1, Direction::FromCreator).unwrap();
        let b = derive_message_keys(&key, &salt, 1, Direction::FromParticipant).unwrap();
        let c = derive_message_keys(&key, &salt, 2, Direction::FromCreator).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.nonce, c.nonce);
        assert_ne!(*a.key, *b.key);
    }

    #[test]
    fn salts_are_random() {
        assert_ne!(generate_message_salt(), generate_message_salt());
    }
}
