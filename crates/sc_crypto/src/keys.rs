//! Symmetric session key material.
//!
//! A `SessionKey` is the 32-byte secret a secret chat encrypts under. It is
//! deliberately not `Clone` and has no serde impls: the only way to move it
//! is by value, and it is wiped when dropped.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::fingerprint::{KeyFingerprint, KeyId};

pub const SESSION_KEY_LEN: usize = 32;

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; SESSION_KEY_LEN],
    #[zeroize(skip)]
    fingerprint: KeyFingerprint,
}

impl SessionKey {
    /// Take ownership of freshly derived key bytes. The caller's copy should
    /// be a temporary that goes out of scope immediately.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        let fingerprint = KeyFingerprint::of_key(&bytes);
        Self { bytes, fingerprint }
    }

    pub fn fingerprint(&self) -> &KeyFingerprint {
        &self.fingerprint
    }

    pub fn key_id(&self) -> KeyId {
        self.fingerprint.key_id()
    }

    /// Raw key bytes, for the KDF only.
    pub(crate) fn expose(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.bytes
    }

    /// Wipe the key in place. The value stays usable as a zero key, so callers
    /// drop it right after.
    pub fn destroy(&mut self) {
        self.bytes.zeroize();
    }

    pub fn is_destroyed(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("key_id", &self.key_id())
            .field("bytes", &"<redacted>")
            .finish()
    }
}
