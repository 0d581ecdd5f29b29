use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch: possible tampering)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("DH output is not contributory (low-order public value)")]
    NonContributory,

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}
