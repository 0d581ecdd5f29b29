//! sc_proto: Wire frames, envelopes, and serialisation for secret chats
//!
//! All on-wire frames are serialised to JSON inside a versioned envelope so
//! the format can change without breaking older peers silently.
//!
//! # Modules
//! - `frame`: handshake, message, rekey and terminate frames
//! - `codec`: envelope framing and plaintext padding
//! - `b64`  : serde helpers for binary fields

pub mod b64;
pub mod codec;
pub mod frame;

pub use codec::{decode_frame, encode_frame, CodecError, PaddingMode};
pub use frame::{
    EncryptedMessage, Frame, HandshakeAccept, HandshakeRequest, RekeyAbort, RekeyAccept,
    RekeyCommit, RekeyRequest,
};
