//! sc_crypto: secret chat cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Key types are opaque newtypes: no `Clone`, no `Serialize`, redacted `Debug`.
//!
//! # Module layout
//! - `dh`: X25519 ephemeral key agreement with low-order point rejection
//! - `kdf`: HKDF-SHA256 key schedule (session, rekey, per-message keys)
//! - `aead`: cipher-suite enum over XChaCha20-Poly1305 / AES-256-GCM
//! - `keys`: zeroizing `SessionKey`
//! - `fingerprint`: BLAKE3 key fingerprints, key ids, human-readable renderings
//! - `error`: unified error type

pub mod aead;
pub mod dh;
pub mod error;
pub mod fingerprint;
pub mod kdf;
pub mod keys;

pub use aead::CipherSuite;
pub use error::CryptoError;
pub use fingerprint::{KeyFingerprint, KeyId};
pub use keys::SessionKey;
