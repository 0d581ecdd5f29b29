//! Timer-driven behaviour, run on tokio's paused clock.
//!
//! Covers:
//!  1. Handshake timeout when the peer never answers
//!  2. Self-destruct of outgoing messages at send + ttl
//!  3. OnRead: incoming timers start at mark_read
//!  4. OnDelivery: incoming timers start at decryption
//!  5. Cancelled and terminated timers never fire
//!  6. Session default TTL and TTL validation
//!  7. Rekey timeout, backoff and successful retry
//!  8. Message-count rekey trigger

mod common;

use std::time::Duration;

use common::{peer, wait_until};
use sc_crypto::kdf::Direction;
use sc_engine::destruct::DestructStart;
use sc_engine::error::{EngineError, KeyExchangeError, SchedulerError};
use sc_engine::{EngineConfig, MemoryNetwork, MessageId, SinkEvent};
use tokio::time::{sleep, Instant};

fn expired(events: &[SinkEvent]) -> Vec<MessageId> {
    events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::Expired(id) => Some(id.clone()),
            _ => None,
        })
        .collect()
}

// ─── Test 1 ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn handshake_times_out_without_answer() {
    let net = MemoryNetwork::new();
    let alice = peer(&net, "alice", EngineConfig::default());
    // Bob exists on the network but nobody processes his inbox.
    let (_bob_transport, _bob_inbox) = net.endpoint("bob");

    let start = Instant::now();
    let err = alice.engine.handshake("bob").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::KeyExchange(KeyExchangeError::HandshakeTimeout)
    ));
    assert!(start.elapsed() >= Duration::from_secs(30));
    assert!(alice.engine.metadata().is_empty());
}

// ─── Test 2 ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn outgoing_message_expires_after_ttl() {
    let net = MemoryNetwork::new();
    let mut alice = peer(&net, "alice", EngineConfig::default());
    let _bob = peer(&net, "bob", EngineConfig::default());

    let sid = alice.engine.handshake("bob").await.unwrap().session_id;
    let start = Instant::now();
    let seq = alice.engine.send(&sid, b"burn", Some(5)).await.unwrap();

    sleep(Duration::from_secs(4)).await;
    assert!(expired(&alice.drain_events()).is_empty());

    let event = alice.next_event().await;
    assert_eq!(
        event,
        SinkEvent::Expired(MessageId::new(sid.clone(), seq, Direction::FromCreator))
    );
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "fired early: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(7), "fired late: {elapsed:?}");
}

// ─── Test 3 ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn incoming_timer_starts_when_read() {
    let net = MemoryNetwork::new();
    let alice = peer(&net, "alice", EngineConfig::default());
    let mut bob = peer(&net, "bob", EngineConfig::default());

    let sid = alice.engine.handshake("bob").await.unwrap().session_id;
    alice.engine.send(&sid, b"read me", Some(5)).await.unwrap();
    assert!(matches!(
        bob.next_event().await,
        SinkEvent::Decrypted { seq: 1, .. }
    ));

    sleep(Duration::from_secs(20)).await;
    assert!(expired(&bob.drain_events()).is_empty());

    assert!(bob.engine.mark_read(&sid, 1).await.unwrap());
    assert!(!bob.engine.mark_read(&sid, 1).await.unwrap());
    sleep(Duration::from_secs(7)).await;
    assert_eq!(
        expired(&bob.drain_events()),
        vec![MessageId::new(sid, 1, Direction::FromCreator)]
    );
}

// ─── Test 4 ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn incoming_timer_starts_on_delivery_when_configured() {
    let net = MemoryNetwork::new();
    let alice = peer(&net, "alice", EngineConfig::default());
    let mut config = EngineConfig::default();
    config.self_destruct.start = DestructStart::OnDelivery;
    let mut bob = peer(&net, "bob", config);

    let sid = alice.engine.handshake("bob").await.unwrap().session_id;
    alice.engine.send(&sid, b"gone soon", Some(2)).await.unwrap();
    assert!(matches!(
        bob.next_event().await,
        SinkEvent::Decrypted { .. }
    ));
    sleep(Duration::from_secs(4)).await;
    assert_eq!(expired(&bob.drain_events()).len(), 1);
}

// ─── Test 5 ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cancelled_and_terminated_timers_never_fire() {
    let net = MemoryNetwork::new();
    let mut alice = peer(&net, "alice", EngineConfig::default());
    let _bob = peer(&net, "bob", EngineConfig::default());

    let sid = alice.engine.handshake("bob").await.unwrap().session_id;
    let seq = alice.engine.send(&sid, b"keep", Some(3)).await.unwrap();
    let id = MessageId::new(sid.clone(), seq, Direction::FromCreator);
    assert!(alice.engine.cancel_destruct(&id));
    assert!(!alice.engine.cancel_destruct(&id));

    alice.engine.send(&sid, b"dropped with session", Some(10)).await.unwrap();
    alice.engine.terminate(&sid).await.unwrap();

    sleep(Duration::from_secs(30)).await;
    let events = alice.drain_events();
    assert!(expired(&events).is_empty());
    assert!(events.contains(&SinkEvent::SessionTerminated { session_id: sid }));
}

// ─── Test 6 ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn session_default_ttl_applies_to_sends() {
    let net = MemoryNetwork::new();
    let mut alice = peer(&net, "alice", EngineConfig::default());
    let _bob = peer(&net, "bob", EngineConfig::default());

    let sid = alice.engine.handshake("bob").await.unwrap().session_id;
    assert!(matches!(
        alice.engine.set_ttl_default(&sid, 45).await,
        Err(EngineError::Scheduler(SchedulerError::InvalidTtl(45)))
    ));
    assert!(matches!(
        alice.engine.send(&sid, b"x", Some(45)).await,
        Err(EngineError::Scheduler(SchedulerError::InvalidTtl(45)))
    ));

    alice.engine.set_ttl_default(&sid, 1).await.unwrap();
    assert_eq!(alice.engine.snapshot(&sid).unwrap().ttl_default, 1);
    let seq = alice.engine.send(&sid, b"default timer", None).await.unwrap();
    sleep(Duration::from_secs(3)).await;
    assert_eq!(
        expired(&alice.drain_events()),
        vec![MessageId::new(sid, seq, Direction::FromCreator)]
    );
}

// ─── Test 7 ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rekey_timeout_keeps_old_key_then_retries() {
    let net = MemoryNetwork::new();
    let alice = peer(&net, "alice", EngineConfig::default());
    let mut bob = peer(&net, "bob", EngineConfig::default());

    let sid = alice.engine.handshake("bob").await.unwrap().session_id;
    alice.engine.send(&sid, b"hi", None).await.unwrap();
    bob.next_event().await;
    let old_key = bob.engine.snapshot(&sid).unwrap().key_id;

    net.set_partitioned("alice", true);
    bob.engine.request_rekey(&sid).await.unwrap();
    assert!(matches!(
        bob.engine.request_rekey(&sid).await,
        Err(EngineError::Rekey(_))
    ));

    sleep(Duration::from_secs(20)).await;
    assert!(bob.engine.snapshot(&sid).unwrap().rekey_in_progress);

    sleep(Duration::from_secs(12)).await;
    let snap = bob.engine.snapshot(&sid).unwrap();
    assert!(!snap.rekey_in_progress);
    assert_eq!(snap.key_generation, 0);
    assert_eq!(snap.key_id, old_key);

    // Old key still carries traffic.
    alice.engine.send(&sid, b"still old key", None).await.unwrap();
    assert!(matches!(
        bob.next_event().await,
        SinkEvent::Decrypted { seq: 2, .. }
    ));

    net.set_partitioned("alice", false);
    wait_until(|| {
        bob.engine.snapshot(&sid).unwrap().key_generation == 1
            && alice.engine.snapshot(&sid).unwrap().key_generation == 1
    })
    .await;
    assert_ne!(bob.engine.snapshot(&sid).unwrap().key_id, old_key);
}

// ─── Test 8 ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn message_count_triggers_rekey() {
    let net = MemoryNetwork::new();
    let mut config = EngineConfig::default();
    config.rekey.after_messages = 3;
    let alice = peer(&net, "alice", config);
    let mut bob = peer(&net, "bob", EngineConfig::default());

    let sid = alice.engine.handshake("bob").await.unwrap().session_id;
    for _ in 0..3 {
        alice.engine.send(&sid, b"tick", None).await.unwrap();
    }
    wait_until(|| {
        alice.engine.snapshot(&sid).unwrap().key_generation == 1
            && bob.engine.snapshot(&sid).unwrap().key_generation == 1
    })
    .await;

    alice.engine.send(&sid, b"under new key", None).await.unwrap();
    let mut seqs = Vec::new();
    while seqs.len() < 4 {
        if let SinkEvent::Decrypted { seq, .. } = bob.next_event().await {
            seqs.push(seq);
        }
    }
    assert_eq!(seqs, vec![1, 2, 3, 4]);
}
