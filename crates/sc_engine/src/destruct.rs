//! SelfDestructScheduler: per-message TTLs on a hashed timing wheel.
//!
//! Entries live in a generational arena; the wheel buckets and the
//! `MessageId → EntryKey` index only hold keys into it. Cancelling frees the
//! arena slot and bumps its generation, so stale keys left in a bucket are
//! recognised and skipped when that bucket is next visited.
//!
//! Time is measured in ticks of `resolution` since the scheduler was built.
//! An entry fires at the first tick at or after `scheduled_at + ttl`.
//!
//! Expired entries move to a ready queue before they are yielded, so a
//! caller that drops the `drain_expired` iterator early loses nothing.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use sc_crypto::kdf::Direction;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SchedulerError;

/// Timer values offered by the client's secret-chat timer menu, in seconds.
/// 0 means off.
pub const SUPPORTED_TTLS: &[u32] = &[
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25,
    26, 27, 28, 29, 30, 60, 3600, 86_400, 604_800,
];

pub fn validate_ttl(ttl_seconds: u32) -> Result<(), SchedulerError> {
    if SUPPORTED_TTLS.contains(&ttl_seconds) {
        Ok(())
    } else {
        Err(SchedulerError::InvalidTtl(ttl_seconds))
    }
}

/// When an incoming message's timer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestructStart {
    /// When the local user reads it
    OnRead,
    /// As soon as it is decrypted
    OnDelivery,
}

impl Default for DestructStart {
    fn default() -> Self {
        Self::OnRead
    }
}

/// Identifies a message without a message-store lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub session_id: String,
    pub seq: u64,
    pub direction: Direction,
}

impl MessageId {
    pub fn new(session_id: impl Into<String>, seq: u64, direction: Direction) -> Self {
        Self {
            session_id: session_id.into(),
            seq,
            direction,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelfDestructEntry {
    pub message_id: MessageId,
    pub session_id: String,
    pub expiry_time: Instant,
    deadline_tick: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredMessage {
    pub message_id: MessageId,
    pub session_id: String,
    pub expiry_time: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryKey {
    index: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct ArenaSlot {
    generation: u32,
    entry: Option<SelfDestructEntry>,
}

#[derive(Debug)]
pub struct SelfDestructScheduler {
    origin: Instant,
    resolution: Duration,
    wheel: Vec<Vec<EntryKey>>,
    /// Last tick fully processed
    current_tick: u64,
    arena: Vec<ArenaSlot>,
    free: Vec<u32>,
    index: HashMap<MessageId, EntryKey>,
    ready: VecDeque<ExpiredMessage>,
}

impl SelfDestructScheduler {
    pub fn new(resolution: Duration, slots: usize, origin: Instant) -> Self {
        let resolution = resolution.max(Duration::from_millis(1));
        let slots = slots.max(1);
        Self {
            origin,
            resolution,
            wheel: vec![Vec::new(); slots],
            current_tick: 0,
            arena: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Entries scheduled and not yet fired, plus fired ones not yet drained.
    pub fn len(&self) -> usize {
        self.index.len() + self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&SelfDestructEntry> {
        let key = self.index.get(message_id)?;
        self.slot(*key)
    }

    /// Schedule `message_id` to expire `ttl_seconds` after `now`. A TTL of 0
    /// cancels any existing timer and returns `None`. Rescheduling replaces.
    pub fn schedule(
        &mut self,
        message_id: MessageId,
        session_id: &str,
        ttl_seconds: u32,
        now: Instant,
    ) -> Result<Option<Instant>, SchedulerError> {
        validate_ttl(ttl_seconds)?;
        self.cancel(&message_id);
        if ttl_seconds == 0 {
            return Ok(None);
        }

        let expiry_time = now + Duration::from_secs(u64::from(ttl_seconds));
        let deadline_tick = self.tick_ceil(expiry_time).max(self.current_tick + 1);
        let entry = SelfDestructEntry {
            message_id: message_id.clone(),
            session_id: session_id.to_string(),
            expiry_time,
            deadline_tick,
        };

        let key = self.alloc(entry);
        let bucket = self.bucket_of(deadline_tick);
        self.wheel[bucket].push(key);
        self.index.insert(message_id, key);
        Ok(Some(expiry_time))
    }

    /// Idempotent; returns whether anything was removed.
    pub fn cancel(&mut self, message_id: &MessageId) -> bool {
        if let Some(key) = self.index.remove(message_id) {
            self.release(key);
            return true;
        }
        let before = self.ready.len();
        self.ready.retain(|e| &e.message_id != message_id);
        before != self.ready.len()
    }

    /// Drop every timer belonging to `session_id`. Returns how many.
    pub fn cancel_session(&mut self, session_id: &str) -> usize {
        let ids: Vec<MessageId> = self
            .index
            .keys()
            .filter(|id| id.session_id == session_id)
            .cloned()
            .collect();
        for id in &ids {
            if let Some(key) = self.index.remove(id) {
                self.release(key);
            }
        }
        let before = self.ready.len();
        self.ready.retain(|e| e.session_id != session_id);
        ids.len() + (before - self.ready.len())
    }

    /// Advance the wheel to `now` and iterate over everything that expired.
    pub fn drain_expired(&mut self, now: Instant) -> DrainExpired<'_> {
        self.advance(now);
        DrainExpired { scheduler: self }
    }

    fn advance(&mut self, now: Instant) {
        let target = self.tick_floor(now);
        if target <= self.current_tick {
            return;
        }
        let span = target - self.current_tick;
        let slots = self.wheel.len() as u64;

        let mut fired = Vec::new();
        if span >= slots {
            // Every bucket is due at least once; one sweep is enough.
            for bucket in 0..self.wheel.len() {
                self.sweep_bucket(bucket, target, &mut fired);
            }
            fired.sort_by_key(|e: &ExpiredMessage| e.expiry_time);
        } else {
            for tick in self.current_tick + 1..=target {
                let bucket = self.bucket_of(tick);
                self.sweep_bucket(bucket, tick, &mut fired);
            }
        }
        self.current_tick = target;

        if !fired.is_empty() {
            debug!(
                target: "sc_engine",
                event = "self_destruct_fired",
                count = fired.len(),
                tick = target,
            );
        }
        self.ready.extend(fired);
    }

    /// Move every live entry of `bucket` due at or before `tick` to `fired`;
    /// drop stale keys; keep entries for later rounds.
    fn sweep_bucket(&mut self, bucket: usize, tick: u64, fired: &mut Vec<ExpiredMessage>) {
        let keys = std::mem::take(&mut self.wheel[bucket]);
        let mut keep = Vec::with_capacity(keys.len());
        for key in keys {
            let due = match self.slot(key) {
                None => continue,
                Some(entry) => entry.deadline_tick <= tick,
            };
            if !due {
                keep.push(key);
                continue;
            }
            if let Some(entry) = self.release(key) {
                self.index.remove(&entry.message_id);
                fired.push(ExpiredMessage {
                    message_id: entry.message_id,
                    session_id: entry.session_id,
                    expiry_time: entry.expiry_time,
                });
            }
        }
        self.wheel[bucket] = keep;
    }

    fn alloc(&mut self, entry: SelfDestructEntry) -> EntryKey {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.arena[index as usize];
            slot.entry = Some(entry);
            return EntryKey {
                index,
                generation: slot.generation,
            };
        }
        let index = self.arena.len() as u32;
        self.arena.push(ArenaSlot {
            generation: 0,
            entry: Some(entry),
        });
        EntryKey {
            index,
            generation: 0,
        }
    }

    fn release(&mut self, key: EntryKey) -> Option<SelfDestructEntry> {
        let slot = self.arena.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        Some(entry)
    }

    fn slot(&self, key: EntryKey) -> Option<&SelfDestructEntry> {
        let slot = self.arena.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn bucket_of(&self, tick: u64) -> usize {
        (tick % self.wheel.len() as u64) as usize
    }

    fn tick_floor(&self, t: Instant) -> u64 {
        let elapsed = t.saturating_duration_since(self.origin);
        (elapsed.as_nanos() / self.resolution.as_nanos()) as u64
    }

    fn tick_ceil(&self, t: Instant) -> u64 {
        let elapsed = t.saturating_duration_since(self.origin).as_nanos();
        let res = self.resolution.as_nanos();
        ((elapsed + res - 1) / res) as u64
    }
}

/// Lazy iterator over expired entries. Whatever is not consumed stays queued.
pub struct DrainExpired<'a> {
    scheduler: &'a mut SelfDestructScheduler,
}

impl Iterator for DrainExpired<'_> {
    type Item = ExpiredMessage;

    fn next(&mut self) -> Option<ExpiredMessage> {
        self.scheduler.ready.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.scheduler.ready.len();
        (n, Some(n))
    }
}
