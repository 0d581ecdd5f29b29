//! Per-session actor.
//!
//! Each live session gets one tokio task consuming a command queue. Commands
//! for a session run strictly in order; different sessions run in parallel.
//! The session record itself stays in the `SessionStore` and is only touched
//! inside short `with_session` closures, never across an `.await`.
//!
//! Encrypted messages leave through an outbox. A message whose transmission
//! fails stays at the front and is resent before anything newer, on the
//! next send or poll tick, so the peer never sees a sequence gap caused by
//! a transport error.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use sc_proto::{encode_frame, EncryptedMessage, Frame, RekeyAbort};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cipher::Decrypted;
use crate::destruct::{validate_ttl, DestructStart, MessageId};
use crate::engine::EngineInner;
use crate::error::{CipherError, EngineError, RekeyError, SequenceError, StoreError};
use crate::rekey::{RekeyAction, RekeyReply, RekeyTrigger};
use crate::session::{Role, SessionMetadata};
use crate::transport::DiscardReason;

pub(crate) const COMMAND_QUEUE_DEPTH: usize = 256;
/// Undelivered messages kept per session before `send` starts refusing.
pub(crate) const OUTBOX_LIMIT: usize = 256;

pub(crate) enum SessionCommand {
    Send {
        plaintext: Zeroizing<Vec<u8>>,
        ttl_seconds: Option<u32>,
        reply: oneshot::Sender<Result<u64, EngineError>>,
    },
    Inbound(Frame),
    RequestRekey {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    MarkRead {
        seq: u64,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    SetTtl {
        ttl_seconds: u32,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Terminate {
        notify_peer: bool,
        reply: Option<oneshot::Sender<Result<SessionMetadata, EngineError>>>,
    },
}

pub(crate) struct SessionActor {
    ctx: Arc<EngineInner>,
    session_id: String,
    peer_id: String,
    role: Role,
    /// Incoming messages with a timer that has not started yet (seq → ttl)
    unread: HashMap<u64, u32>,
    /// Encrypted but not yet handed to the transport, oldest first
    outbox: VecDeque<EncryptedMessage>,
}

pub(crate) fn spawn_session_actor(
    ctx: Arc<EngineInner>,
    session_id: String,
    peer_id: String,
    role: Role,
    shutdown: watch::Receiver<bool>,
) -> mpsc::Sender<SessionCommand> {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let actor = SessionActor {
        ctx,
        session_id,
        peer_id,
        role,
        unread: HashMap::new(),
        outbox: VecDeque::new(),
    };
    tokio::spawn(actor.run(rx, shutdown));
    tx
}

impl SessionActor {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SessionCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut poll = tokio::time::interval(self.ctx.config.rekey.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(target: "sc_engine", event = "actor_started", session_id = %self.session_id);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle(cmd).await {
                        break;
                    }
                    self.poll_rekey().await;
                }
                _ = poll.tick() => {
                    if !self.outbox.is_empty() {
                        if let Err(e) = self.flush_outbox().await {
                            debug!(
                                target: "sc_engine",
                                event = "outbox_retry_failed",
                                session_id = %self.session_id,
                                queued = self.outbox.len(),
                                error = %e,
                            );
                        }
                    }
                    self.poll_rekey().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if !self.ctx.store.contains(&self.session_id) {
                break;
            }
        }

        self.ctx.actors.lock().remove(&self.session_id);
        debug!(target: "sc_engine", event = "actor_stopped", session_id = %self.session_id);
    }

    /// Returns false once the session is gone.
    async fn handle(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Send {
                plaintext,
                ttl_seconds,
                reply,
            } => {
                let result = self.send(&plaintext, ttl_seconds).await;
                let _ = reply.send(result);
            }
            SessionCommand::Inbound(frame) => self.inbound(frame).await,
            SessionCommand::RequestRekey { reply } => {
                let result = self.start_rekey(RekeyTrigger::Manual).await;
                let _ = reply.send(result);
            }
            SessionCommand::MarkRead { seq, reply } => {
                let _ = reply.send(self.mark_read(seq));
            }
            SessionCommand::SetTtl { ttl_seconds, reply } => {
                let result = validate_ttl(ttl_seconds)
                    .map_err(EngineError::from)
                    .and_then(|_| {
                        self.ctx
                            .store
                            .with_session(&self.session_id, |s| s.ttl_default = ttl_seconds)
                            .map_err(EngineError::from)
                    });
                let _ = reply.send(result);
            }
            SessionCommand::Terminate { notify_peer, reply } => {
                let result = self.terminate(notify_peer).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                return false;
            }
        }
        true
    }

    /// Returns the sequence number once the message is encrypted. If the
    /// transport is down the message waits in the outbox.
    async fn send(&mut self, plaintext: &[u8], ttl_seconds: Option<u32>) -> Result<u64, EngineError> {
        if let Some(ttl) = ttl_seconds {
            validate_ttl(ttl)?;
        }
        if self.outbox.len() >= OUTBOX_LIMIT {
            self.flush_outbox().await?;
        }
        let ctx = Arc::clone(&self.ctx);
        let message = ctx.store.with_session(&self.session_id, |s| {
            let ttl = ttl_seconds.or((s.ttl_default > 0).then_some(s.ttl_default));
            ctx.cipher.encrypt(s, &ctx.tracker, plaintext, ttl)
        })??;
        let seq = message.seq;

        // Outgoing timers start on send.
        if let Some(ttl) = message.ttl_seconds.filter(|t| *t > 0) {
            let id = MessageId::new(self.session_id.clone(), seq, self.role.outgoing());
            ctx.destruct
                .lock()
                .schedule(id, &self.session_id, ttl, crate::monotonic_now())?;
        }

        self.outbox.push_back(message);
        if let Err(e) = self.flush_outbox().await {
            warn!(
                target: "sc_engine",
                event = "message_queued",
                session_id = %self.session_id,
                seq,
                queued = self.outbox.len(),
                error = %e,
            );
        }
        Ok(seq)
    }

    /// Transmit queued messages in order; stops at the first failure.
    async fn flush_outbox(&mut self) -> Result<(), EngineError> {
        while let Some(message) = self.outbox.front() {
            let seq = message.seq;
            let bytes = match encode_frame(&Frame::Message(message.clone())) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Cannot succeed on a retry either.
                    self.outbox.pop_front();
                    return Err(e.into());
                }
            };
            self.ctx
                .transport
                .send_opaque(&self.peer_id, bytes)
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            self.outbox.pop_front();
            debug!(target: "sc_engine", event = "message_sent", session_id = %self.session_id, seq);
        }
        Ok(())
    }

    async fn inbound(&mut self, frame: Frame) {
        let now = crate::monotonic_now();
        let ctx = Arc::clone(&self.ctx);
        let kind = frame.kind();
        match frame {
            Frame::Message(message) => self.receive_message(message).await,
            Frame::RekeyRequest(request) => {
                let reply = ctx.store.with_session(&self.session_id, |s| {
                    ctx.rekey.on_rekey_request(s, &request, now)
                });
                match reply {
                    Ok(Ok(Some(RekeyReply::Accept(accept)))) => {
                        let _ = self.transmit_logged(Frame::RekeyAccept(accept)).await;
                    }
                    Ok(Ok(Some(RekeyReply::Abort(abort)))) => {
                        let _ = self.transmit_logged(Frame::RekeyAbort(abort)).await;
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => self.log_rekey_error("rekey_request", &e),
                    Err(_) => {}
                }
            }
            Frame::RekeyAccept(accept) => {
                let result = ctx.store.with_session(&self.session_id, |s| {
                    ctx.rekey.on_rekey_accepted(s, &accept, now)
                });
                match result {
                    Ok(Ok(commit)) => {
                        let _ = self.transmit_logged(Frame::RekeyCommit(commit)).await;
                    }
                    Ok(Err(e)) => {
                        self.log_rekey_error("rekey_accept", &e);
                        if !matches!(e, RekeyError::UnknownExchange(_)) {
                            let abort = RekeyAbort {
                                session_id: self.session_id.clone(),
                                exchange_id: accept.exchange_id,
                                reason: e.to_string(),
                            };
                            let _ = self.transmit_logged(Frame::RekeyAbort(abort)).await;
                        }
                    }
                    Err(_) => {}
                }
            }
            Frame::RekeyCommit(commit) => {
                let result = ctx.store.with_session(&self.session_id, |s| {
                    ctx.rekey.on_rekey_commit(s, &commit, now)
                });
                if let Ok(Err(e)) = result {
                    self.log_rekey_error("rekey_commit", &e);
                }
            }
            Frame::RekeyAbort(abort) => {
                let result = ctx.store.with_session(&self.session_id, |s| {
                    ctx.rekey.on_rekey_abort(s, &abort, now)
                });
                if let Ok(Err(e)) = result {
                    self.log_rekey_error("rekey_abort", &e);
                }
            }
            Frame::Terminate { .. } => {
                info!(
                    target: "sc_engine",
                    event = "peer_terminated",
                    session_id = %self.session_id,
                );
                if let Err(e) = self.terminate(false).await {
                    warn!(
                        target: "sc_engine",
                        event = "terminate_failed",
                        session_id = %self.session_id,
                        error = %e,
                    );
                }
            }
            Frame::HandshakeRequest(_) | Frame::HandshakeAccept(_) => {
                warn!(
                    target: "sc_engine",
                    event = "unexpected_frame",
                    session_id = %self.session_id,
                    kind,
                );
            }
        }
    }

    async fn receive_message(&mut self, message: EncryptedMessage) {
        let now = crate::monotonic_now();
        let ctx = Arc::clone(&self.ctx);
        let seq = message.seq;
        let result = ctx.store.with_session(&self.session_id, |s| {
            let decrypted = ctx.cipher.decrypt(s, &ctx.tracker, &message);
            if let Ok(d) = &decrypted {
                ctx.rekey.on_decrypted(s, d.slot, now);
            }
            (decrypted, s.integrity_failures)
        });
        let Ok((decrypted, failures)) = result else {
            return;
        };

        match decrypted {
            Ok(Decrypted {
                seq,
                plaintext,
                ttl_seconds,
                ..
            }) => {
                ctx.sink.on_decrypted(&self.session_id, seq, &plaintext);
                if let Some(ttl) = ttl_seconds.filter(|t| *t > 0) {
                    match ctx.config.self_destruct.start {
                        DestructStart::OnDelivery => self.start_incoming_timer(seq, ttl),
                        DestructStart::OnRead => {
                            self.unread.insert(seq, ttl);
                        }
                    }
                }
            }
            Err(err) => {
                let reason = match &err {
                    CipherError::Sequence(SequenceError::ReplayedMessage { last, .. }) => {
                        DiscardReason::Replayed { last: *last }
                    }
                    CipherError::Sequence(SequenceError::SequenceGap { expected, .. }) => {
                        DiscardReason::SequenceGap {
                            expected: *expected,
                        }
                    }
                    CipherError::IntegrityFailure => DiscardReason::IntegrityFailure,
                    other => DiscardReason::Malformed {
                        detail: other.to_string(),
                    },
                };
                warn!(
                    target: "sc_engine",
                    event = "message_discarded",
                    session_id = %self.session_id,
                    seq,
                    reason = %reason,
                    integrity_failures = failures,
                );
                ctx.sink.on_discarded(&self.session_id, seq, reason);
            }
        }
    }

    fn mark_read(&mut self, seq: u64) -> Result<bool, EngineError> {
        if !self.ctx.store.contains(&self.session_id) {
            return Err(StoreError::NotFound(self.session_id.clone()).into());
        }
        match self.unread.remove(&seq) {
            Some(ttl) => {
                self.start_incoming_timer(seq, ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn start_incoming_timer(&self, seq: u64, ttl: u32) {
        let id = MessageId::new(self.session_id.clone(), seq, self.role.incoming());
        // The ttl arrived authenticated but may be one we do not offer.
        if let Err(e) = self
            .ctx
            .destruct
            .lock()
            .schedule(id, &self.session_id, ttl, crate::monotonic_now())
        {
            warn!(
                target: "sc_engine",
                event = "self_destruct_rejected",
                session_id = %self.session_id,
                seq,
                error = %e,
            );
        }
    }

    async fn start_rekey(&mut self, trigger: RekeyTrigger) -> Result<(), EngineError> {
        let now = crate::monotonic_now();
        let ctx = Arc::clone(&self.ctx);
        let request = ctx
            .store
            .with_session(&self.session_id, |s| ctx.rekey.request_rekey(s, trigger, now))??;
        self.transmit(Frame::RekeyRequest(request)).await
    }

    async fn poll_rekey(&mut self) {
        let now = crate::monotonic_now();
        let ctx = Arc::clone(&self.ctx);
        let Ok(action) = ctx
            .store
            .with_session(&self.session_id, |s| ctx.rekey.poll(s, now))
        else {
            return;
        };

        match action {
            Some(RekeyAction::Start(trigger)) => {
                if let Err(e) = self.start_rekey(trigger).await {
                    warn!(
                        target: "sc_engine",
                        event = "rekey_start_failed",
                        session_id = %self.session_id,
                        trigger = ?trigger,
                        error = %e,
                    );
                }
            }
            Some(RekeyAction::TimedOut {
                exchange_id,
                attempt,
                retry_in,
            }) => {
                warn!(
                    target: "sc_engine",
                    event = "rekey_timeout",
                    session_id = %self.session_id,
                    error = %RekeyError::RekeyTimeout,
                    attempt,
                    retry_in_secs = retry_in.as_secs(),
                );
                let abort = RekeyAbort {
                    session_id: self.session_id.clone(),
                    exchange_id,
                    reason: "timeout".into(),
                };
                let _ = self.transmit_logged(Frame::RekeyAbort(abort)).await;
            }
            Some(RekeyAction::Abandoned { exchange_id }) => {
                warn!(
                    target: "sc_engine",
                    event = "rekey_abandoned",
                    session_id = %self.session_id,
                    exchange_id = %format_args!("{exchange_id:016x}"),
                );
            }
            None => {}
        }
    }

    async fn terminate(&mut self, notify_peer: bool) -> Result<SessionMetadata, EngineError> {
        let metadata = self.ctx.store.terminate(&self.session_id)?;
        let cancelled = self.ctx.destruct.lock().cancel_session(&self.session_id);
        self.unread.clear();
        let undelivered = self.outbox.len();
        self.outbox.clear();
        if undelivered > 0 {
            warn!(
                target: "sc_engine",
                event = "outbox_discarded",
                session_id = %self.session_id,
                count = undelivered,
            );
        }
        if cancelled > 0 {
            debug!(
                target: "sc_engine",
                event = "self_destruct_cancelled",
                session_id = %self.session_id,
                count = cancelled,
            );
        }
        if notify_peer {
            let frame = Frame::Terminate {
                session_id: self.session_id.clone(),
            };
            let _ = self.transmit_logged(frame).await;
        }
        self.ctx.sink.on_session_terminated(&self.session_id);
        Ok(metadata)
    }

    async fn transmit(&self, frame: Frame) -> Result<(), EngineError> {
        let bytes = encode_frame(&frame)?;
        self.ctx
            .transport
            .send_opaque(&self.peer_id, bytes)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    async fn transmit_logged(&self, frame: Frame) -> Result<(), EngineError> {
        let kind = frame.kind();
        let result = self.transmit(frame).await;
        if let Err(e) = &result {
            warn!(
                target: "sc_engine",
                event = "transmit_failed",
                session_id = %self.session_id,
                kind,
                error = %e,
            );
        }
        result
    }

    fn log_rekey_error(&self, stage: &'static str, err: &RekeyError) {
        warn!(
            target: "sc_engine",
            event = "rekey_error",
            session_id = %self.session_id,
            stage,
            error = %err,
        );
    }
}
