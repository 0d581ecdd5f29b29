//! `SecretChatEngine`: the facade the messenger talks to.
//!
//! Owns the shared components, one actor per live session, the pending
//! handshakes, and the self-destruct driver task. Incoming transport bytes
//! enter through `on_opaque_received`; handshake frames are handled here,
//! everything else is routed to the session's actor.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use sc_proto::{decode_frame, encode_frame, Frame, HandshakeAccept, HandshakeRequest};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::actor::{spawn_session_actor, SessionCommand};
use crate::cipher::MessageCipher;
use crate::config::EngineConfig;
use crate::destruct::{MessageId, SelfDestructScheduler};
use crate::error::{EngineError, KeyExchangeError, StoreError};
use crate::key_exchange::{KeyExchange, KeyExchangeState};
use crate::persist;
use crate::rekey::RekeyManager;
use crate::sequence::SequenceTracker;
use crate::session::{SecretChatSession, SessionMetadata, SessionSnapshot};
use crate::store::SessionStore;
use crate::transport::{Inbound, MessageSink, Transport};

struct PendingHandshake {
    state: KeyExchangeState,
    reply: oneshot::Sender<Result<SessionSnapshot, EngineError>>,
}

/// Shared by the facade, the session actors and the destruct driver.
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: SessionStore,
    pub(crate) key_exchange: KeyExchange,
    pub(crate) tracker: SequenceTracker,
    pub(crate) cipher: MessageCipher,
    pub(crate) rekey: RekeyManager,
    pub(crate) destruct: Mutex<SelfDestructScheduler>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) sink: Arc<dyn MessageSink>,
    pub(crate) actors: Mutex<HashMap<String, mpsc::Sender<SessionCommand>>>,
    pending: Mutex<HashMap<String, PendingHandshake>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Fingerprint renderings for out-of-band comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FingerprintView {
    pub session_id: String,
    pub key_id: String,
    pub hex: String,
    pub hex_groups: String,
    pub emoji: String,
    pub key_generation: u32,
}

impl EngineInner {
    fn stop(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(target: "sc_engine", event = "engine_shutdown", sessions = self.store.len());
        self.pending.lock().clear();
        self.actors.lock().clear();
    }
}

/// Held by every user-facing handle; the last one dropped stops the
/// background tasks, which would otherwise keep `EngineInner` alive.
struct ShutdownOnDrop(Arc<EngineInner>);

impl Drop for ShutdownOnDrop {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Cheap to clone. Background tasks (session actors, the self-destruct
/// driver, inbound pumps) run until `shutdown` is called or the last clone
/// is dropped.
#[derive(Clone)]
pub struct SecretChatEngine {
    inner: Arc<EngineInner>,
    /// `None` for the internal handle owned by inbound pumps.
    guard: Option<Arc<ShutdownOnDrop>>,
}

impl SecretChatEngine {
    /// Validate `config`, build the engine and start its self-destruct
    /// driver. Must be called inside a tokio runtime.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        let destruct = SelfDestructScheduler::new(
            config.self_destruct.resolution(),
            config.self_destruct.wheel_slots,
            crate::monotonic_now(),
        );
        let inner = Arc::new(EngineInner {
            store: SessionStore::new(),
            key_exchange: KeyExchange::new(
                config.cipher_suites.clone(),
                config.handshake_timeout(),
                config.default_ttl_secs,
            ),
            tracker: SequenceTracker::new(config.sequence_policy),
            cipher: MessageCipher::new(config.padding),
            rekey: RekeyManager::new(config.rekey.clone()),
            destruct: Mutex::new(destruct),
            transport,
            sink,
            actors: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            shutdown_tx,
            config,
        });
        spawn_destruct_driver(Arc::clone(&inner));
        Ok(Self {
            guard: Some(Arc::new(ShutdownOnDrop(Arc::clone(&inner)))),
            inner,
        })
    }

    fn detached(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            guard: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Open a secret chat with `peer_id`. Resolves once the peer's accept
    /// has been verified, or fails with `HandshakeTimeout`.
    pub async fn handshake(&self, peer_id: &str) -> Result<SessionSnapshot, EngineError> {
        let state = self.inner.key_exchange.begin_handshake(peer_id)?;
        let session_id = state.session_id().to_string();
        let request = state.request();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            session_id.clone(),
            PendingHandshake { state, reply: tx },
        );

        info!(
            target: "sc_engine",
            event = "handshake_started",
            session_id = %session_id,
            peer_id = %peer_id,
        );
        let sent = match encode_frame(&Frame::HandshakeRequest(request)) {
            Ok(bytes) => self
                .inner
                .transport
                .send_opaque(peer_id, bytes)
                .await
                .map_err(|e| EngineError::Transport(e.to_string())),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            self.inner.pending.lock().remove(&session_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.key_exchange.timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::Cancelled),
            Err(_) => {
                self.inner.pending.lock().remove(&session_id);
                warn!(
                    target: "sc_engine",
                    event = "handshake_timeout",
                    session_id = %session_id,
                    peer_id = %peer_id,
                );
                Err(KeyExchangeError::HandshakeTimeout.into())
            }
        }
    }

    /// Entry point for bytes the transport received from `peer_id`.
    pub async fn on_opaque_received(&self, peer_id: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let frame = decode_frame(bytes)?;
        match frame {
            Frame::HandshakeRequest(request) => self.on_handshake_request(peer_id, request).await,
            Frame::HandshakeAccept(accept) => self.on_handshake_accept(peer_id, accept).await,
            other => self.route(peer_id, other).await,
        }
    }

    /// Spawn a task feeding an inbound receiver into `on_opaque_received`.
    pub fn spawn_inbound_pump(&self, mut inbound: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        let engine = self.detached();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = inbound.recv() => {
                        let Some((from, bytes)) = next else { break };
                        if let Err(e) = engine.on_opaque_received(&from, &bytes).await {
                            warn!(
                                target: "sc_engine",
                                event = "inbound_rejected",
                                peer_id = %from,
                                error = %e,
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Encrypt and send; returns the message's sequence number. A message
    /// the transport refuses is queued and resent before newer ones, so
    /// `Ok` means accepted rather than delivered. Fails with
    /// `EngineError::Transport` once the session's outbox is full.
    pub async fn send(
        &self,
        session_id: &str,
        plaintext: &[u8],
        ttl_seconds: Option<u32>,
    ) -> Result<u64, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.command(
            session_id,
            SessionCommand::Send {
                plaintext: Zeroizing::new(plaintext.to_vec()),
                ttl_seconds,
                reply,
            },
        )
        .await?;
        rx.await.map_err(|_| EngineError::Cancelled)?
    }

    /// Start a rekey now. Returns once the request is on the wire; the new
    /// key is installed when the peer answers.
    pub async fn request_rekey(&self, session_id: &str) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.command(session_id, SessionCommand::RequestRekey { reply })
            .await?;
        rx.await.map_err(|_| EngineError::Cancelled)?
    }

    /// Start the self-destruct timer of an incoming message under
    /// `DestructStart::OnRead`. Returns false if it had no pending timer.
    pub async fn mark_read(&self, session_id: &str, seq: u64) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.command(session_id, SessionCommand::MarkRead { seq, reply })
            .await?;
        rx.await.map_err(|_| EngineError::Cancelled)?
    }

    pub async fn set_ttl_default(&self, session_id: &str, ttl_seconds: u32) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.command(session_id, SessionCommand::SetTtl { ttl_seconds, reply })
            .await?;
        rx.await.map_err(|_| EngineError::Cancelled)?
    }

    pub fn cancel_destruct(&self, message_id: &MessageId) -> bool {
        self.inner.destruct.lock().cancel(message_id)
    }

    /// Discard a chat: keys are wiped, the peer is told, timers are dropped.
    /// Cancelling a still-pending handshake yields `Ok(None)`.
    pub async fn terminate(&self, session_id: &str) -> Result<Option<SessionMetadata>, EngineError> {
        let pending = self.inner.pending.lock().remove(session_id);
        if let Some(pending) = pending {
            info!(
                target: "sc_engine",
                event = "handshake_cancelled",
                session_id = %session_id,
                peer_id = %pending.state.peer_id(),
            );
            return Ok(None);
        }
        let (reply, rx) = oneshot::channel();
        self.command(
            session_id,
            SessionCommand::Terminate {
                notify_peer: true,
                reply: Some(reply),
            },
        )
        .await?;
        let metadata = rx.await.map_err(|_| EngineError::Cancelled)??;
        self.inner.actors.lock().remove(session_id);
        Ok(Some(metadata))
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.inner.store.get(session_id)
    }

    pub fn sessions_with(&self, peer_id: &str) -> Vec<SessionSnapshot> {
        self.inner.store.find_by_peer(peer_id)
    }

    pub fn fingerprint(&self, session_id: &str) -> Option<FingerprintView> {
        let snap = self.inner.store.get(session_id)?;
        Some(FingerprintView {
            session_id: snap.session_id,
            key_id: snap.key_id.to_string(),
            hex: snap.key_fingerprint.to_hex(),
            hex_groups: snap.key_fingerprint.to_hex_groups(),
            emoji: snap.key_fingerprint.to_emoji(),
            key_generation: snap.key_generation,
        })
    }

    pub fn metadata(&self) -> Vec<SessionMetadata> {
        self.inner.store.metadata()
    }

    pub fn save_metadata(&self, path: &Path) -> Result<(), EngineError> {
        persist::save_metadata(path, &self.metadata())?;
        Ok(())
    }

    /// Stop all actors, the destruct driver and inbound pumps. Pending
    /// handshakes resolve with `Cancelled`.
    pub fn shutdown(&self) {
        self.inner.stop();
    }

    async fn on_handshake_request(
        &self,
        peer_id: &str,
        request: HandshakeRequest,
    ) -> Result<(), EngineError> {
        if self.inner.store.contains(&request.session_id) {
            warn!(
                target: "sc_engine",
                event = "handshake_duplicate",
                session_id = %request.session_id,
                peer_id = %peer_id,
            );
            return Ok(());
        }
        let (session, accept) = self
            .inner
            .key_exchange
            .accept_handshake(peer_id, &request)?;
        let session_id = session.session_id.clone();
        self.install(session);
        info!(
            target: "sc_engine",
            event = "session_accepted",
            session_id = %session_id,
            peer_id = %peer_id,
        );

        let bytes = encode_frame(&Frame::HandshakeAccept(accept))?;
        self.inner
            .transport
            .send_opaque(peer_id, bytes)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    async fn on_handshake_accept(
        &self,
        peer_id: &str,
        accept: HandshakeAccept,
    ) -> Result<(), EngineError> {
        let pending = {
            let mut map = self.inner.pending.lock();
            match map.get(&accept.session_id) {
                Some(p) if p.state.peer_id() == peer_id => map.remove(&accept.session_id),
                _ => None,
            }
        };
        let Some(PendingHandshake { state, reply }) = pending else {
            // Late or unsolicited; make sure the peer drops its half.
            warn!(
                target: "sc_engine",
                event = "handshake_accept_unexpected",
                session_id = %accept.session_id,
                peer_id = %peer_id,
            );
            let bytes = encode_frame(&Frame::Terminate {
                session_id: accept.session_id.clone(),
            })?;
            let _ = self.inner.transport.send_opaque(peer_id, bytes).await;
            return Ok(());
        };

        match self.inner.key_exchange.complete_handshake(state, &accept) {
            Ok(session) => {
                let snapshot = session.snapshot();
                self.install(session);
                info!(
                    target: "sc_engine",
                    event = "session_established",
                    session_id = %snapshot.session_id,
                    peer_id = %peer_id,
                    key_id = %snapshot.key_id,
                );
                let _ = reply.send(Ok(snapshot));
                Ok(())
            }
            Err(e) => {
                warn!(
                    target: "sc_engine",
                    event = "handshake_failed",
                    session_id = %accept.session_id,
                    error = %e,
                );
                let _ = reply.send(Err(EngineError::KeyExchange(e)));
                Ok(())
            }
        }
    }

    fn install(&self, session: SecretChatSession) {
        let session_id = session.session_id.clone();
        let peer_id = session.peer_id.clone();
        let role = session.role;
        self.inner.store.upsert(session);
        let tx = spawn_session_actor(
            Arc::clone(&self.inner),
            session_id.clone(),
            peer_id,
            role,
            self.inner.shutdown_tx.subscribe(),
        );
        self.inner.actors.lock().insert(session_id, tx);
    }

    async fn route(&self, peer_id: &str, frame: Frame) -> Result<(), EngineError> {
        let session_id = frame.session_id().to_string();
        let owner = self
            .inner
            .store
            .get(&session_id)
            .map(|s| s.peer_id)
            .ok_or_else(|| StoreError::NotFound(session_id.clone()))?;
        if owner != peer_id {
            warn!(
                target: "sc_engine",
                event = "frame_from_wrong_peer",
                session_id = %session_id,
                peer_id = %peer_id,
                kind = frame.kind(),
            );
            return Err(StoreError::NotFound(session_id).into());
        }
        debug!(
            target: "sc_engine",
            event = "frame_routed",
            session_id = %session_id,
            kind = frame.kind(),
        );
        self.command(&session_id, SessionCommand::Inbound(frame)).await
    }

    async fn command(&self, session_id: &str, cmd: SessionCommand) -> Result<(), EngineError> {
        if *self.inner.shutdown_tx.borrow() {
            return Err(EngineError::ShuttingDown);
        }
        let tx = self
            .inner
            .actors
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        tx.send(cmd).await.map_err(|_| EngineError::Cancelled)
    }
}

/// Ticks the self-destruct wheel and reports expired messages to the sink.
fn spawn_destruct_driver(ctx: Arc<EngineInner>) -> JoinHandle<()> {
    let mut shutdown = ctx.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(ctx.config.self_destruct.resolution());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            target: "sc_engine",
            event = "destruct_driver_started",
            resolution_ms = ctx.config.self_destruct.resolution_ms,
        );
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            let expired: Vec<_> = ctx
                .destruct
                .lock()
                .drain_expired(crate::monotonic_now())
                .collect();
            for message in &expired {
                debug!(
                    target: "sc_engine",
                    event = "message_expired",
                    session_id = %message.session_id,
                    seq = message.message_id.seq,
                );
                ctx.sink.on_expired(message);
            }
        }
    })
}
