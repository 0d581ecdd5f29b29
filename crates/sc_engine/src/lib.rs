//! sc_engine: secret chat state machine
//!
//! # Components
//! - `key_exchange`: X25519 handshake that creates a session
//! - `store`: `SessionStore`, sole owner of session records
//! - `sequence`: incoming/outgoing sequence numbers
//! - `cipher`: `MessageCipher`, per-message encrypt/decrypt
//! - `rekey`: `RekeyManager`, key rotation without message loss
//! - `destruct`: `SelfDestructScheduler`, TTL timing wheel
//!
//! # Runtime
//! - `engine`: `SecretChatEngine` facade, handshake routing, destruct driver
//! - `actor`: one tokio task per session, commands applied in order
//! - `transport`: `Transport` / `MessageSink` collaborators, in-memory loopback
//! - `persist`: atomic JSON metadata file
//! - `config`: `EngineConfig`

mod actor;
pub mod cipher;
pub mod config;
pub mod destruct;
pub mod engine;
pub mod error;
pub mod key_exchange;
pub mod persist;
pub mod rekey;
pub mod sequence;
pub mod session;
pub mod store;
pub mod transport;

pub use config::EngineConfig;
pub use destruct::{ExpiredMessage, MessageId, SelfDestructScheduler};
pub use engine::{FingerprintView, SecretChatEngine};
pub use error::EngineError;
pub use session::{SessionMetadata, SessionSnapshot, SessionState};
pub use transport::{ChannelSink, MemoryNetwork, MessageSink, SinkEvent, Transport};

/// Monotonic clock that follows tokio's (pausable) test clock when a runtime
/// is present.
pub(crate) fn monotonic_now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}
