//! Shared harness: two engines wired through a `MemoryNetwork`.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sc_engine::transport::MemoryTransport;
use sc_engine::{ChannelSink, EngineConfig, MemoryNetwork, SecretChatEngine, SinkEvent, Transport};
use sc_proto::{decode_frame, Frame};
use tokio::sync::mpsc::UnboundedReceiver;

/// Transport that keeps a copy of everything it sends and can be told to
/// fail the next few sends.
#[derive(Clone)]
pub struct RecordingTransport {
    inner: MemoryTransport,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    failures: Arc<AtomicUsize>,
}

impl RecordingTransport {
    pub fn fail_next(&self, sends: usize) {
        self.failures.store(sends, Ordering::SeqCst);
    }

    /// The recorded bytes of the outgoing message with sequence `seq`.
    pub fn message_bytes(&self, seq: u64) -> Option<Vec<u8>> {
        self.sent.lock().iter().find_map(|bytes| match decode_frame(bytes) {
            Ok(Frame::Message(m)) if m.seq == seq => Some(bytes.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_opaque(&self, peer_id: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("link down");
        }
        self.sent.lock().push(bytes.clone());
        self.inner.send_opaque(peer_id, bytes).await
    }
}

pub struct Peer {
    pub id: String,
    pub engine: SecretChatEngine,
    pub events: UnboundedReceiver<SinkEvent>,
    pub wire: RecordingTransport,
}

pub fn peer(net: &MemoryNetwork, id: &str, config: EngineConfig) -> Peer {
    let (transport, inbound) = net.endpoint(id);
    let wire = RecordingTransport {
        inner: transport,
        sent: Arc::new(Mutex::new(Vec::new())),
        failures: Arc::new(AtomicUsize::new(0)),
    };
    let (sink, events) = ChannelSink::new();
    let engine = SecretChatEngine::new(config, Arc::new(wire.clone()), Arc::new(sink))
        .expect("valid engine config");
    engine.spawn_inbound_pump(inbound);
    Peer {
        id: id.to_string(),
        engine,
        events,
        wire,
    }
}

impl Peer {
    pub async fn next_event(&mut self) -> SinkEvent {
        tokio::time::timeout(Duration::from_secs(60), self.events.recv())
            .await
            .expect("timed out waiting for sink event")
            .expect("sink closed")
    }

    /// Next event that is not a self-destruct notification.
    pub async fn next_message_event(&mut self) -> SinkEvent {
        loop {
            match self.next_event().await {
                SinkEvent::Expired(_) => continue,
                other => return other,
            }
        }
    }

    pub fn drain_events(&mut self) -> Vec<SinkEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Poll `cond` every 10ms (on the tokio clock) until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
