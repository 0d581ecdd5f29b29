use sc_crypto::CryptoError;
use sc_proto::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyExchangeError {
    #[error("Handshake timed out waiting for the peer")]
    HandshakeTimeout,

    #[error("Invalid handshake parameters: {0}")]
    InvalidParameters(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("Replayed message: seq {seq} <= last accepted {last}")]
    ReplayedMessage { seq: u64, last: u64 },

    #[error("Sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("Outgoing sequence counter exhausted")]
    Exhausted,
}

#[derive(Debug, Error)]
pub enum CipherError {
    /// Unknown key id, bad tag or tampered header. Deliberately carries no detail.
    #[error("Message failed integrity check")]
    IntegrityFailure,

    #[error("Message belongs to session {0}")]
    WrongSession(String),

    #[error("Session is terminated")]
    SessionTerminated,

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Error)]
pub enum RekeyError {
    #[error("Rekey timed out")]
    RekeyTimeout,

    #[error("A rekey exchange is already in progress")]
    InProgress,

    #[error("No rekey exchange {0:016x} in progress")]
    UnknownExchange(u64),

    #[error("Peer derived a different replacement key")]
    FingerprintMismatch,

    #[error("Exchange superseded by the peer's concurrent request")]
    Superseded,

    #[error("Invalid rekey parameters: {0}")]
    InvalidParameters(String),

    #[error("Session is terminated")]
    SessionTerminated,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Unsupported self-destruct timer: {0}s")]
    InvalidTtl(u32),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Atomic replace failed: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Unsupported metadata file version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Error surface of `SecretChatEngine`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Rekey(#[from] RekeyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Engine is shutting down")]
    ShuttingDown,
}
