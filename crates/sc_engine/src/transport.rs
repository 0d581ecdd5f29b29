//! Collaborator interfaces: the opaque-blob transport below the engine and
//! the message store above it.
//!
//! `MemoryNetwork` is an in-process loopback used by the tests and the CLI
//! demo. `ChannelSink` turns sink callbacks into channel events.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::destruct::ExpiredMessage;
use crate::destruct::MessageId;

/// Moves opaque encrypted frames to a peer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_opaque(&self, peer_id: &str, bytes: Vec<u8>) -> anyhow::Result<()>;
}

/// Why an incoming message was dropped without being delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DiscardReason {
    Replayed { last: u64 },
    SequenceGap { expected: u64 },
    IntegrityFailure,
    Malformed { detail: String },
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardReason::Replayed { last } => write!(f, "replayed (last accepted {last})"),
            DiscardReason::SequenceGap { expected } => write!(f, "gap (expected {expected})"),
            DiscardReason::IntegrityFailure => write!(f, "integrity failure"),
            DiscardReason::Malformed { detail } => write!(f, "malformed: {detail}"),
        }
    }
}

/// The local message store. Callbacks run on engine tasks and must not block.
pub trait MessageSink: Send + Sync + 'static {
    fn on_decrypted(&self, session_id: &str, seq: u64, plaintext: &[u8]);
    fn on_discarded(&self, session_id: &str, seq: u64, reason: DiscardReason);
    /// A self-destruct timer fired; delete the message content.
    fn on_expired(&self, message: &ExpiredMessage);
    fn on_session_terminated(&self, _session_id: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Decrypted {
        session_id: String,
        seq: u64,
        plaintext: Vec<u8>,
    },
    Discarded {
        session_id: String,
        seq: u64,
        reason: DiscardReason,
    },
    Expired(MessageId),
    SessionTerminated {
        session_id: String,
    },
}

/// Forwards sink callbacks over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: SinkEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl MessageSink for ChannelSink {
    fn on_decrypted(&self, session_id: &str, seq: u64, plaintext: &[u8]) {
        self.emit(SinkEvent::Decrypted {
            session_id: session_id.to_string(),
            seq,
            plaintext: plaintext.to_vec(),
        });
    }

    fn on_discarded(&self, session_id: &str, seq: u64, reason: DiscardReason) {
        self.emit(SinkEvent::Discarded {
            session_id: session_id.to_string(),
            seq,
            reason,
        });
    }

    fn on_expired(&self, message: &ExpiredMessage) {
        self.emit(SinkEvent::Expired(message.message_id.clone()));
    }

    fn on_session_terminated(&self, session_id: &str) {
        self.emit(SinkEvent::SessionTerminated {
            session_id: session_id.to_string(),
        });
    }
}

/// Bytes delivered to an endpoint: (sender peer id, payload).
pub type Inbound = (String, Vec<u8>);

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<String, mpsc::UnboundedSender<Inbound>>,
    partitioned: HashSet<String>,
}

/// In-process loopback network. Each endpoint gets a transport and an
/// inbound receiver; delivery order per sender is preserved.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self, peer_id: &str) -> (MemoryTransport, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().endpoints.insert(peer_id.to_string(), tx);
        (
            MemoryTransport {
                network: self.clone(),
                local_id: peer_id.to_string(),
            },
            rx,
        )
    }

    /// While partitioned, everything addressed to `peer_id` is silently lost.
    pub fn set_partitioned(&self, peer_id: &str, partitioned: bool) {
        let mut inner = self.inner.lock();
        if partitioned {
            inner.partitioned.insert(peer_id.to_string());
        } else {
            inner.partitioned.remove(peer_id);
        }
    }

    fn deliver(&self, from: &str, to: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        if inner.partitioned.contains(to) {
            trace!(target: "sc_engine", event = "frame_dropped", from, to);
            return Ok(());
        }
        let tx = inner
            .endpoints
            .get(to)
            .ok_or_else(|| anyhow!("unknown peer {to}"))?;
        tx.send((from.to_string(), bytes))
            .map_err(|_| anyhow!("peer {to} is no longer listening"))
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_id: String,
}

impl MemoryTransport {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_opaque(&self, peer_id: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.network.deliver(&self.local_id, peer_id, bytes)
    }
}
