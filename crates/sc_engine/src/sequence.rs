//! Per-session sequence numbers.
//!
//! Outgoing numbers start at 1 and are strictly increasing. Incoming numbers
//! must be strictly greater than the last accepted one; under
//! `SequencePolicy::Strict` they must also be exactly one greater.

use serde::{Deserialize, Serialize};

use crate::error::SequenceError;
use crate::session::SecretChatSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencePolicy {
    /// Reject gaps as well as replays.
    Strict,
    /// Accept gaps (lost messages); still reject replays and reordering.
    BestEffort,
}

impl Default for SequencePolicy {
    fn default() -> Self {
        Self::Strict
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceTracker {
    policy: SequencePolicy,
}

impl SequenceTracker {
    pub fn new(policy: SequencePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> SequencePolicy {
        self.policy
    }

    /// Reserve the next outgoing sequence number.
    pub fn next_outgoing(&self, session: &mut SecretChatSession) -> Result<u64, SequenceError> {
        let next = session
            .outgoing_seq
            .checked_add(1)
            .ok_or(SequenceError::Exhausted)?;
        session.outgoing_seq = next;
        Ok(next)
    }

    /// Validate an authenticated incoming sequence number and advance the
    /// counter. The counter is untouched on error.
    pub fn accept_incoming(
        &self,
        session: &mut SecretChatSession,
        seq: u64,
    ) -> Result<(), SequenceError> {
        let last = session.incoming_seq;
        if seq <= last {
            return Err(SequenceError::ReplayedMessage { seq, last });
        }
        let expected = last + 1;
        if self.policy == SequencePolicy::Strict && seq != expected {
            return Err(SequenceError::SequenceGap { expected, got: seq });
        }
        session.incoming_seq = seq;
        Ok(())
    }
}
