//! Authenticated Encryption with Associated Data
//!
//! The cipher suite is picked once during the handshake and stays fixed for
//! the lifetime of the session.
//!
//! | Suite               | Key | Nonce | Tag |
//! |---------------------|-----|-------|-----|
//! | `XChaCha20Poly1305` | 32  | 24    | 16  |
//! | `Aes256Gcm`         | 32  | 12    | 16  |
//!
//! Tags are detached so the wire message can carry ciphertext and MAC as
//! separate fields. Tag verification runs in constant time inside the AEAD
//! and no plaintext is released on mismatch.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    XChaCha20Poly1305,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{error::CryptoError, kdf::MessageKeys};

pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherSuite {
    XChaCha20Poly1305,
    Aes256Gcm,
}

impl Default for CipherSuite {
    fn default() -> Self {
        Self::XChaCha20Poly1305
    }
}

impl CipherSuite {
    pub fn nonce_len(self) -> usize {
        match self {
            CipherSuite::XChaCha20Poly1305 => 24,
            CipherSuite::Aes256Gcm => 12,
        }
    }

    /// Encrypt `plaintext` under the one-shot message keys.
    /// Returns (ciphertext, tag).
    pub fn seal(
        self,
        keys: &MessageKeys,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; TAG_LEN]), CryptoError> {
        let mut buffer = plaintext.to_vec();
        let nonce = &keys.nonce[..self.nonce_len()];
        let tag = match self {
            CipherSuite::XChaCha20Poly1305 => {
                let cipher = XChaCha20Poly1305::new_from_slice(&keys.key[..])
                    .map_err(|_| CryptoError::AeadEncrypt)?;
                cipher
                    .encrypt_in_place_detached(
                        chacha20poly1305::XNonce::from_slice(nonce),
                        aad,
                        &mut buffer,
                    )
                    .map_err(|_| CryptoError::AeadEncrypt)?
            }
            CipherSuite::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&keys.key[..])
                    .map_err(|_| CryptoError::AeadEncrypt)?;
                cipher
                    .encrypt_in_place_detached(aes_gcm::Nonce::from_slice(nonce), aad, &mut buffer)
                    .map_err(|_| CryptoError::AeadEncrypt)?
            }
        };
        let mut out_tag = [0u8; TAG_LEN];
        out_tag.copy_from_slice(tag.as_slice());
        Ok((buffer, out_tag))
    }

    /// Verify `tag` and decrypt. On a bad tag the buffer is wiped and
    /// `CryptoError::AeadDecrypt` is returned.
    pub fn open(
        self,
        keys: &MessageKeys,
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        let nonce = &keys.nonce[..self.nonce_len()];
        match self {
            CipherSuite::XChaCha20Poly1305 => {
                let cipher = XChaCha20Poly1305::new_from_slice(&keys.key[..])
                    .map_err(|_| CryptoError::AeadDecrypt)?;
                cipher
                    .decrypt_in_place_detached(
                        chacha20poly1305::XNonce::from_slice(nonce),
                        aad,
                        &mut buffer,
                        chacha20poly1305::Tag::from_slice(tag),
                    )
                    .map_err(|_| CryptoError::AeadDecrypt)?;
            }
            CipherSuite::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&keys.key[..])
                    .map_err(|_| CryptoError::AeadDecrypt)?;
                cipher
                    .decrypt_in_place_detached(
                        aes_gcm::Nonce::from_slice(nonce),
                        aad,
                        &mut buffer,
                        aes_gcm::Tag::from_slice(tag),
                    )
                    .map_err(|_| CryptoError::AeadDecrypt)?;
            }
        }
        Ok(buffer)
    }
}
