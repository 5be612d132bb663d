//! Slot tables provide the exactly-once semantics of NFSv4.1 sessions as
//! described in RFC 8881 section 2.10.6.
//!
//! Every channel of a session owns one table. A slot is a sequencing lane: it
//! carries at most one request at a time, remembers the sequence ID of the
//! last request it accepted and, when the client asked for it, the complete
//! reply to that request. A retransmission carrying the same slot and
//! sequence ID is answered from that cache instead of being executed again.
//!
//! Per slot the state machine is:
//!
//! ```text
//! Idle(seq=n) --request(seq=n+1)--> InUse(seq=n+1) --complete--> Idle(seq=n+1, [reply])
//! ```
//!
//! The table mutex only guards this bookkeeping. It is released while the
//! request executes, so different slots of one table run concurrently.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::session::error::{Result, SessionError};

/// Outcome of a successful sequence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotVerdict {
    /// A new request; the slot is now busy until the request is completed.
    New,
    /// A retransmission of the last completed request. The cached reply must
    /// be sent back verbatim and the request must not be executed.
    Retry(Arc<[u8]>),
}

/// Sizes a slot table advertises in every SEQUENCE reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTableStatus {
    /// Highest slot index currently allocated (table length minus one).
    pub highest_slot: u32,
    /// Highest slot index the server wants the client to use.
    pub target_highest_slot: u32,
    /// Highest slot index that ever completed a request.
    pub highest_used_slot: Option<u32>,
}

#[derive(Debug, Default, Clone)]
struct Slot {
    /// Sequence ID of the request in flight, or of the last completed one.
    sequence: u32,
    in_use: bool,
    /// Whether the last completed request asked for its reply to be cached.
    cache_this: bool,
    reply: Option<Arc<[u8]>>,
}

#[derive(Debug)]
struct SlotTableState {
    slots: Vec<Slot>,
    target_highest_slot: u32,
    highest_used_slot: Option<u32>,
}

impl SlotTableState {
    fn highest_slot(&self) -> u32 {
        (self.slots.len() - 1) as u32
    }

    fn status(&self) -> SlotTableStatus {
        SlotTableStatus {
            highest_slot: self.highest_slot(),
            target_highest_slot: self.target_highest_slot,
            highest_used_slot: self.highest_used_slot,
        }
    }

    fn slot_mut(&mut self, slot_id: u32) -> Result<&mut Slot> {
        let highest = self.highest_slot();
        self.slots.get_mut(slot_id as usize).ok_or(SessionError::BadSlot { slot: slot_id, highest })
    }
}

/// Fixed-size table of slots for one channel of one session.
#[derive(Debug)]
pub struct SlotTable {
    state: Mutex<SlotTableState>,
    max_cached_reply: usize,
}

impl SlotTable {
    /// Creates a table with `size` slots (at least one) and no limit on the
    /// size of cached replies.
    pub fn new(size: u32) -> Self {
        Self::with_cache_limit(size, usize::MAX)
    }

    /// Creates a table with `size` slots (at least one) whose cached replies
    /// may not exceed `max_cached_reply` bytes.
    pub fn with_cache_limit(size: u32, max_cached_reply: usize) -> Self {
        let size = size.max(1);
        Self {
            state: Mutex::new(SlotTableState {
                slots: vec![Slot::default(); size as usize],
                target_highest_slot: size - 1,
                highest_used_slot: None,
            }),
            max_cached_reply,
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotTableState> {
        self.state.lock().expect("unable to unlock slot table mutex")
    }

    /// Number of allocated slots, always at least one.
    pub fn slot_count(&self) -> u32 {
        self.state().slots.len() as u32
    }

    /// Checks `sequence_id` against the slot's state.
    ///
    /// - `sequence_id` is the slot's sequence plus one (wrapping at 2^32): a
    ///   new request. It is refused with `SeqMisordered` if the slot is still
    ///   busy, otherwise the slot becomes busy and its old reply is dropped.
    /// - `sequence_id` equals the slot's sequence: a retry. `Delay` while the
    ///   original executes, the cached reply once it finished, or
    ///   `RetryUncachedReply` when the original did not ask for caching.
    /// - anything else is `SeqMisordered`.
    ///
    /// Failures leave the table untouched.
    pub fn validate_sequence(&self, slot_id: u32, sequence_id: u32) -> Result<SlotVerdict> {
        let mut state = self.state();
        let slot = state.slot_mut(slot_id)?;
        trace!(
            "slot {} seq {} (slot seq {}, in use {})",
            slot_id,
            sequence_id,
            slot.sequence,
            slot.in_use
        );

        if sequence_id == slot.sequence.wrapping_add(1) {
            if slot.in_use {
                return Err(SessionError::SeqMisordered { slot: slot_id, sequence: sequence_id });
            }
            slot.sequence = sequence_id;
            slot.in_use = true;
            slot.cache_this = false;
            slot.reply = None;
            return Ok(SlotVerdict::New);
        }

        if sequence_id == slot.sequence {
            if slot.in_use {
                return Err(SessionError::Delay { slot: slot_id, sequence: sequence_id });
            }
            return match (&slot.reply, slot.cache_this) {
                (Some(reply), true) => Ok(SlotVerdict::Retry(reply.clone())),
                _ => Err(SessionError::RetryUncachedReply { slot: slot_id, sequence: sequence_id }),
            };
        }

        Err(SessionError::SeqMisordered { slot: slot_id, sequence: sequence_id })
    }

    /// Records the completion of the request accepted on `slot_id`.
    ///
    /// Must be called exactly once per `SlotVerdict::New`, whatever the
    /// outcome of the request. The reply is copied into the slot only when
    /// `cache_requested` is set. A reply larger than the cache limit releases
    /// the slot without caching and reports `ReplyTooBigToCache`.
    pub fn complete_slot_request(
        &self,
        slot_id: u32,
        sequence_id: u32,
        cache_requested: bool,
        reply: &[u8],
    ) -> Result<()> {
        let max_cached_reply = self.max_cached_reply;
        let mut state = self.state();
        let slot = state.slot_mut(slot_id)?;
        if !slot.in_use || slot.sequence != sequence_id {
            return Err(SessionError::SlotNotInUse { slot: slot_id, sequence: sequence_id });
        }

        slot.in_use = false;
        let too_big = cache_requested && reply.len() > max_cached_reply;
        slot.cache_this = cache_requested && !too_big;
        slot.reply = if slot.cache_this { Some(Arc::from(reply)) } else { None };

        state.highest_used_slot = Some(state.highest_used_slot.map_or(slot_id, |h| h.max(slot_id)));

        if too_big {
            return Err(SessionError::ReplyTooBigToCache {
                size: reply.len(),
                limit: max_cached_reply,
            });
        }
        Ok(())
    }

    /// Asks the client to use no slot above `target`.
    ///
    /// The value is clamped to the allocated table. Slots are only released
    /// once the client acknowledges the lower target, see
    /// [`SlotTable::acknowledge_highest_slot`]. Returns the stored target.
    pub fn set_target_highest_slot(&self, target: u32) -> u32 {
        let mut state = self.state();
        state.target_highest_slot = target.min(state.highest_slot());
        state.target_highest_slot
    }

    /// Reconciles the client's reported highest slot with the target.
    ///
    /// When the client reports a highest slot at or below a lowered target
    /// and no slot above the target is busy, the table shrinks to the target.
    /// Returns true if the table shrank.
    pub fn acknowledge_highest_slot(&self, client_highest_slot: u32) -> bool {
        let mut state = self.state();
        let target = state.target_highest_slot;
        if target >= state.highest_slot() || client_highest_slot > target {
            return false;
        }
        let keep = target as usize + 1;
        if state.slots[keep..].iter().any(|slot| slot.in_use) {
            return false;
        }
        state.slots.truncate(keep);
        state.highest_used_slot = state.highest_used_slot.map(|h| h.min(target));
        true
    }

    /// Current table dimensions.
    pub fn status(&self) -> SlotTableStatus {
        self.state().status()
    }

    /// Number of slots with a request in flight.
    pub fn in_flight(&self) -> usize {
        self.state().slots.iter().filter(|slot| slot.in_use).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_at(sequence: u32) -> SlotTable {
        let table = SlotTable::new(2);
        table.state().slots[0].sequence = sequence;
        table
    }

    #[test]
    fn sequence_wraps_through_zero() {
        let table = table_at(u32::MAX - 1);
        assert_eq!(table.validate_sequence(0, u32::MAX), Ok(SlotVerdict::New));
        table.complete_slot_request(0, u32::MAX, true, b"last").expect("complete");

        match table.validate_sequence(0, u32::MAX) {
            Ok(SlotVerdict::Retry(reply)) => assert_eq!(&reply[..], b"last"),
            other => panic!("expected cached reply, got {other:?}"),
        }

        assert_eq!(table.validate_sequence(0, 0), Ok(SlotVerdict::New));
        table.complete_slot_request(0, 0, false, b"first").expect("complete");
        assert_eq!(table.validate_sequence(0, 1), Ok(SlotVerdict::New));
    }

    #[test]
    fn zero_is_misordered_before_the_wrap() {
        let table = table_at(u32::MAX - 1);
        assert_eq!(
            table.validate_sequence(0, 0),
            Err(SessionError::SeqMisordered { slot: 0, sequence: 0 })
        );
    }
}
