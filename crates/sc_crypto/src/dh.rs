//! X25519 ephemeral Diffie-Hellman.
//!
//! References:
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!
//! Every handshake and every rekey uses a fresh `EphemeralKeyPair`. The secret
//! half is consumed by `agree`, so it cannot be reused by construction.
//!
//! Peer public values that land in the small subgroup (all-zero output) are
//! rejected with `CryptoError::NonContributory`.

use std::fmt;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const PUBLIC_KEY_LEN: usize = 32;

/// DH groups the engine can negotiate. Only X25519 today; the tag is carried
/// on the wire so a peer offering anything else is refused explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DhGroup {
    X25519,
}

impl Default for DhGroup {
    fn default() -> Self {
        Self::X25519
    }
}

pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: X25519Public,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub fn group(&self) -> DhGroup {
        DhGroup::X25519
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Consume the secret and compute the shared secret with `peer_public`.
    pub fn agree(
        self,
        peer_public: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let peer = X25519Public::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Parse a public value received from the wire.
pub fn public_from_slice(bytes: &[u8]) -> Result<[u8; PUBLIC_KEY_LEN], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte X25519 public value".into()))
}
