//! Wire codec: envelope framing and plaintext padding.
//!
//! # Envelope
//! Every frame is wrapped as `{"v": 1, "frame": {...}}` and serialised to
//! JSON. A peer speaking a different version is refused with
//! `CodecError::UnsupportedVersion` instead of being misparsed.
//!
//! # Padding
//! Message plaintext is padded INSIDE the AEAD so the path only ever sees
//! bucket-sized ciphertext.
//!
//! Bucket sizes (bytes): 256, 512, 1024, 4096, 16384, 65536
//! Larger plaintexts are sent with just the length prefix.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::frame::Frame;

pub const PROTOCOL_VERSION: u8 = 1;

/// Padding mode for message plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Length prefix only.
    None,
    /// Pad to the next bucket.
    Buckets,
    /// Pad everything to the largest bucket (64KB).
    Maximum,
}

impl Default for PaddingMode {
    fn default() -> Self {
        Self::Buckets
    }
}

const BUCKET_SIZES: &[usize] = &[256, 512, 1024, 4096, 16384, 65536];
const MAX_BUCKET: usize = 65536;
const LEN_PREFIX: usize = 4;

/// Pad plaintext according to `mode`.
///
/// Format: [original_len: u32 LE] [plaintext] [random padding]
pub fn pad_to_bucket(plaintext: &[u8], mode: PaddingMode) -> Result<Vec<u8>, CodecError> {
    let len = u32::try_from(plaintext.len())
        .map_err(|_| CodecError::InvalidPadding("plaintext exceeds 4 GiB".into()))?;
    let needed = LEN_PREFIX + plaintext.len();
    let target = match mode {
        PaddingMode::None => needed,
        PaddingMode::Buckets => BUCKET_SIZES
            .iter()
            .copied()
            .find(|&b| b >= needed)
            .unwrap_or(needed),
        PaddingMode::Maximum => needed.max(MAX_BUCKET),
    };

    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(plaintext);
    // Random fill, not zeros, so compression on the path learns nothing
    let remaining = target - out.len();
    if remaining > 0 {
        let mut padding = vec![0u8; remaining];
        rand::rngs::OsRng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
    }
    Ok(out)
}

/// Strip padding after decryption.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, CodecError> {
    if padded.len() < LEN_PREFIX {
        return Err(CodecError::InvalidPadding("too short for length prefix".into()));
    }
    let len = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if LEN_PREFIX + len > padded.len() {
        return Err(CodecError::InvalidPadding(format!(
            "length prefix {len} exceeds padded data size {}",
            padded.len()
        )));
    }
    Ok(padded[LEN_PREFIX..LEN_PREFIX + len].to_vec())
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    v: u8,
    frame: &'a Frame,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    v: u8,
    frame: serde_json::Value,
}

/// Serialise a frame into the opaque bytes handed to the transport.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(&EnvelopeOut {
        v: PROTOCOL_VERSION,
        frame,
    })?)
}

/// Parse bytes received from the transport. The version is checked before
/// the frame body is interpreted.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let envelope: EnvelopeIn = serde_json::from_slice(bytes)?;
    if envelope.v != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(envelope.v));
    }
    Ok(serde_json::from_value(envelope.frame)?)
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid padding: {0}")]
    InvalidPadding(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_pad_to_smallest_fit() {
        let msg = b"Hello, World!";
        let padded = pad_to_bucket(msg, PaddingMode::Buckets).unwrap();
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad(&padded).unwrap(), msg);

        let big = vec![7u8; 300];
        assert_eq!(pad_to_bucket(&big, PaddingMode::Buckets).unwrap().len(), 512);
    }

    #[test]
    fn none_adds_only_prefix() {
        let msg = b"No padding test";
        let padded = pad_to_bucket(msg, PaddingMode::None).unwrap();
        assert_eq!(padded.len(), 4 + msg.len());
        assert_eq!(unpad(&padded).unwrap(), msg);
    }

    #[test]
    fn maximum_pads_to_largest_bucket() {
        let padded = pad_to_bucket(b"x", PaddingMode::Maximum).unwrap();
        assert_eq!(padded.len(), 65536);
    }

    #[test]
    fn oversized_plaintext_is_not_truncated() {
        let huge = vec![1u8; 70_000];
        let padded = pad_to_bucket(&huge, PaddingMode::Buckets).unwrap();
        assert_eq!(padded.len(), 70_004);
        assert_eq!(unpad(&padded).unwrap().len(), 70_000);
    }

    #[test]
    fn unpad_rejects_lying_prefix() {
        let mut padded = pad_to_bucket(b"abc", PaddingMode::None).unwrap();
        padded[0] = 200;
        assert!(matches!(unpad(&padded), Err(CodecError::InvalidPadding(_))));
        assert!(unpad(&[1, 2]).is_err());
    }

    #[test]
    fn frame_envelope_round_trip() {
        let frame = Frame::Terminate {
            session_id: "sess".into(),
        };
        let bytes = encode_frame(&frame).unwrap();
        let back = decode_frame(&bytes).unwrap();
        assert_eq!(back.session_id(), "sess");
    }

    #[test]
    fn unknown_version_refused() {
        let bytes = br#"{"v":9,"frame":{"type":"terminate","session_id":"x"}}"#;
        assert!(matches!(
            decode_frame(bytes),
            Err(CodecError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        assert!(matches!(
            decode_frame(b"not json"),
            Err(CodecError::Serialization(_))
        ));
    }
}
