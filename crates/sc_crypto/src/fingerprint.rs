//! Key fingerprints.
//!
//! A fingerprint is a BLAKE3 `derive_key` digest of the session key. It is
//! safe to display and persist. Two renderings are offered for out-of-band
//! comparison: grouped hex and a short emoji sequence.
//!
//! The `KeyId` (first 8 bytes, little endian) tags every encrypted message so
//! the receiver can pick the right key during a rotation.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CryptoError;

const FINGERPRINT_CONTEXT: &str = "sc-secret-chat 2024 key fingerprint v1";

/// Emoji table used for the visual rendering. Each emoji is one 64-bit
/// big-endian word of the fingerprint reduced modulo the table length.
const EMOJI: [&str; 64] = [
    "🐶", "🐱", "🐭", "🐹", "🐰", "🦊", "🐻", "🐼", "🐨", "🐯", "🦁", "🐮", "🐷", "🐸", "🐵", "🐔",
    "🐧", "🐦", "🦆", "🦅", "🦉", "🐺", "🐗", "🐴", "🦄", "🐝", "🐛", "🦋", "🐌", "🐞", "🐢", "🐍",
    "🦎", "🐙", "🦑", "🦀", "🐡", "🐠", "🐬", "🐳", "🦈", "🐊", "🐅", "🐆", "🦓", "🦍", "🐘", "🦛",
    "🦏", "🐪", "🦒", "🦘", "🐃", "🐂", "🐄", "🐎", "🐖", "🐏", "🐑", "🦙", "🐐", "🦌", "🐕", "🐈",
];

/// 64-bit identifier of a session key, carried in clear on every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub u64);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyFingerprint([u8; 32]);

impl KeyFingerprint {
    pub fn of_key(key: &[u8; 32]) -> Self {
        Self(blake3::derive_key(FINGERPRINT_CONTEXT, key))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn key_id(&self) -> KeyId {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.0[..8]);
        KeyId(u64::from_le_bytes(id))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("fingerprint must be 32 bytes".into()))?;
        Ok(Self(arr))
    }

    /// Hex in 4-character groups, 8 groups per line.
    pub fn to_hex_groups(&self) -> String {
        let hex = self.to_hex();
        let groups: Vec<&str> = (0..hex.len())
            .step_by(4)
            .map(|i| &hex[i..i + 4])
            .collect();
        groups
            .chunks(8)
            .map(|line| line.join(" "))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Four emoji, each picked from a 64-bit slice of the fingerprint.
    pub fn to_emoji(&self) -> String {
        self.0
            .chunks(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                let idx = (u64::from_be_bytes(word) % EMOJI.len() as u64) as usize;
                EMOJI[idx]
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Constant-time equality, for comparing a fingerprint announced by the
    /// peer with a locally derived one.
    pub fn ct_eq(&self, other: &Self) -> bool {
        let mut diff = 0u8;
        for (x, y) in self.0.iter().zip(other.0.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }
}

impl fmt::Debug for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyFingerprint({})", self.to_hex())
    }
}

impl fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for KeyFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for KeyFingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
