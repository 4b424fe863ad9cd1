//! Reader cursor: sequence-validated, in-order, wait-free delivery.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::{Ether, EtherError, MessageSet};

/// A reader's position in an Ether.
///
/// Each cursor consumes every message exactly once, in sequence order,
/// independently of other cursors. A fresh cursor starts after the last
/// sequence claimed at creation time.
pub struct Cursor<M: MessageSet> {
    ether: Arc<Ether<M>>,
    next_seq: u64,
    last_seen: u64,
}

impl<M: MessageSet> Cursor<M> {
    /// Create a cursor positioned after the producer's current sequence.
    #[must_use]
    pub fn new(ether: Arc<Ether<M>>) -> Self {
        let last = ether.header().sequence.load(Ordering::Acquire);
        Self {
            ether,
            next_seq: last + 1,
            last_seen: last,
        }
    }

    /// Try to deliver the next message.
    ///
    /// Returns `Ok(true)` after invoking `handler` with one message,
    /// `Ok(false)` when nothing is deliverable yet (nothing published, or a
    /// producer mid-flight on the expected sequence), and
    /// [`EtherError::ReaderLapped`] when the producer is a full capacity or
    /// more ahead, which is fatal: sequence order can no longer be preserved.
    #[inline]
    pub fn poll_one(&mut self, handler: &mut impl FnMut(M)) -> Result<bool, EtherError> {
        let header = self.ether.header();
        self.last_seen = header.sequence.load(Ordering::Relaxed);

        if self.last_seen < self.next_seq {
            return Ok(false);
        }
        let behind = self.last_seen - self.next_seq;
        if behind >= self.ether.capacity() {
            return Err(EtherError::ReaderLapped {
                next_seq: self.next_seq,
                behind,
            });
        }

        let slot = self.ether.slot_header(self.next_seq);
        if slot.seq.load(Ordering::Relaxed) != self.next_seq {
            // Claimed but not yet stamped; retry later.
            return Ok(false);
        }
        // Acquire pairs with the producer's release-store of commit: past
        // this point the payload bytes written before commit are visible.
        if slot.commit.load(Ordering::Acquire) != self.next_seq {
            return Ok(false);
        }

        let id = slot.selector.load(Ordering::Relaxed);
        // SAFETY: commit == seq guarantees the selector and payload for
        // this sequence were fully written before the release above.
        let msg = unsafe { M::decode(id, self.ether.payload_ptr(self.next_seq)) };

        // Order the payload copy before the overwrite re-check: a producer
        // lapping us mid-copy would have restamped slot.seq first.
        fence(Ordering::Acquire);
        if slot.seq.load(Ordering::Relaxed) != self.next_seq {
            return Err(EtherError::ReaderLapped {
                next_seq: self.next_seq,
                behind: self.ether.capacity(),
            });
        }

        debug_assert!(msg.is_some(), "committed slot carried unknown selector");
        if let Some(msg) = msg {
            handler(msg);
        }
        self.next_seq += 1;
        Ok(true)
    }

    /// Deliver up to `max` messages; returns how many were delivered.
    pub fn poll(&mut self, max: usize, handler: &mut impl FnMut(M)) -> Result<usize, EtherError> {
        let mut delivered = 0;
        while delivered < max {
            if !self.poll_one(handler)? {
                break;
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Unread backlog behind the producer, as of the last look.
    #[must_use]
    pub fn queue_len(&self) -> u64 {
        let seen = self.ether.header().sequence.load(Ordering::Relaxed);
        (seen + 1).saturating_sub(self.next_seq)
    }

    /// The ether this cursor reads.
    #[must_use]
    pub fn ether(&self) -> &Arc<Ether<M>> {
        &self.ether
    }

    /// Next sequence number this cursor expects.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.next_seq
    }
}
