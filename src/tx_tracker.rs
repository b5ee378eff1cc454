//! TX tracker (spec §4.D).
//!
//! Assigns 7-bit wrapping transaction ids, tracks outstanding sends in a
//! bounded TX ring, and matches asynchronous acknowledgements back to
//! their originals. The caller (see `channel.rs`) owns the `tx_mutex` and
//! `tx_cond` this spec requires; `TxTracker` itself is a plain,
//! unsynchronised structure built around a [`RingBuffer`].

use log::{debug, warn};

use crate::frame::{Frame, FrameFlags};
use crate::ring::RingBuffer;

/// Transaction ids wrap within 7 bits (spec §4.D): the device is
/// guaranteed to keep this space larger than any supported in-flight cap.
const TRANSACTION_ID_SPACE: u8 = 128;

/// A snapshot of a sent frame, kept until its ack arrives or the tracker
/// is flushed.
#[derive(Debug, Clone)]
pub struct TxEntry {
    /// Transaction id assigned at send time.
    pub transaction_id: u8,
    /// Arbitration id of the sent frame.
    pub can_id: u32,
    /// Flags of the sent frame.
    pub flags: FrameFlags,
    /// DLC of the sent frame.
    pub dlc: u8,
    /// Payload snapshot of the sent frame (up to 64 bytes).
    pub data: [u8; 64],
}

/// Per-channel, single-owner TX tracking state. Not thread-safe by
/// itself -- wrap in the channel's `tx_mutex`.
pub struct TxTracker {
    next_transaction_id: u8,
    max_outstanding: u32,
    outstanding: RingBuffer<TxEntry>,
}

/// Outcome of [`TxTracker::begin_send`].
pub enum BeginSendOutcome {
    /// Allocation succeeded; this transaction id must now be submitted to
    /// the transport and, on success, committed with
    /// [`TxTracker::commit_send`].
    Allocated(u8),
    /// The in-flight cap was reached.
    AtCapacity,
}

impl TxTracker {
    /// Creates a tracker with the given in-flight cap (reported by the
    /// device at OPEN time, spec §3).
    pub fn new(max_outstanding: u32) -> Self {
        TxTracker {
            next_transaction_id: 0,
            max_outstanding,
            outstanding: RingBuffer::new(crate::ring::DEFAULT_TX_CAPACITY),
        }
    }

    /// Number of currently outstanding (unacknowledged) sends.
    pub fn outstanding_count(&self) -> u32 {
        self.outstanding.count() as u32
    }

    /// Maximum outstanding sends this channel may have in flight.
    pub fn max_outstanding(&self) -> u32 {
        self.max_outstanding
    }

    /// Updates the in-flight cap (set once, from the OPEN reply).
    pub fn set_max_outstanding(&mut self, max_outstanding: u32) {
        self.max_outstanding = max_outstanding;
    }

    /// Attempts to allocate a transaction id for a new send (spec §4.D
    /// step 1-3). Callers must check capacity with
    /// `outstanding_count() >= max_outstanding()` themselves before
    /// waiting on the TX condition variable; this call performs the
    /// capacity check again so it is safe to call directly once a waiter
    /// wakes.
    pub fn begin_send(&mut self) -> BeginSendOutcome {
        if self.outstanding_count() >= self.max_outstanding {
            return BeginSendOutcome::AtCapacity;
        }
        let id = self.next_transaction_id;
        self.next_transaction_id = (self.next_transaction_id + 1) % TRANSACTION_ID_SPACE;
        BeginSendOutcome::Allocated(id)
    }

    /// Commits a successfully submitted send: appends its snapshot to the
    /// TX ring (spec §4.D step 5). Must be called exactly once per
    /// `Allocated` outcome that was actually submitted to the transport.
    pub fn commit_send(&mut self, transaction_id: u8, frame: &Frame) {
        let mut data = [0u8; 64];
        data[..frame.dlc as usize].copy_from_slice(frame.payload());
        let entry = TxEntry {
            transaction_id,
            can_id: frame.can_id,
            flags: frame.flags,
            dlc: frame.dlc,
            data,
        };
        if !self.outstanding.write(entry) {
            warn!("tx tracker: TX ring full, dropping snapshot for transaction {transaction_id}");
        }
    }

    /// Matches an incoming ack by transaction id, removing and returning
    /// the matched entry (spec §4.D ack path step 1-2). Order among
    /// remaining entries is preserved.
    pub fn match_ack(&mut self, transaction_id: u8) -> Option<TxEntry> {
        let found = self
            .outstanding
            .remove_first(|entry| entry.transaction_id == transaction_id);
        if found.is_none() {
            debug!("tx tracker: no outstanding entry for transaction {transaction_id}");
        }
        found
    }

    /// Drops every outstanding entry without acknowledgement (spec §4.D
    /// ack path step 2, triggered when an ack carries an error flag).
    pub fn flush(&mut self) {
        let dropped = self.outstanding.count();
        if dropped > 0 {
            warn!("tx tracker: flushing {dropped} outstanding TX entries");
        }
        self.outstanding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFlags;

    fn test_frame() -> Frame {
        Frame::new(0x123, &[1, 2, 3], 3, FrameFlags::STANDARD)
    }

    #[test]
    fn allocates_and_matches_ack() {
        let mut t = TxTracker::new(4);
        let id = match t.begin_send() {
            BeginSendOutcome::Allocated(id) => id,
            _ => panic!("expected allocation"),
        };
        t.commit_send(id, &test_frame());
        assert_eq!(t.outstanding_count(), 1);
        let matched = t.match_ack(id);
        assert!(matched.is_some());
        assert_eq!(t.outstanding_count(), 0);
    }

    #[test]
    fn cap_enforced() {
        let mut t = TxTracker::new(2);
        for _ in 0..2 {
            let id = match t.begin_send() {
                BeginSendOutcome::Allocated(id) => id,
                _ => panic!("expected allocation"),
            };
            t.commit_send(id, &test_frame());
        }
        assert!(matches!(t.begin_send(), BeginSendOutcome::AtCapacity));
    }

    #[test]
    fn flush_drops_everything() {
        let mut t = TxTracker::new(4);
        for _ in 0..3 {
            if let BeginSendOutcome::Allocated(id) = t.begin_send() {
                t.commit_send(id, &test_frame());
            }
        }
        assert_eq!(t.outstanding_count(), 3);
        t.flush();
        assert_eq!(t.outstanding_count(), 0);
    }

    #[test]
    fn transaction_ids_wrap_within_7_bits() {
        let mut t = TxTracker::new(200);
        let mut ids = Vec::new();
        for _ in 0..130 {
            if let BeginSendOutcome::Allocated(id) = t.begin_send() {
                ids.push(id);
                t.commit_send(id, &test_frame());
            }
        }
        assert!(ids.iter().all(|id| *id < TRANSACTION_ID_SPACE));
        assert_eq!(ids[0], 0);
        assert_eq!(ids[128], 0);
    }

    #[test]
    fn unmatched_ack_returns_none() {
        let mut t = TxTracker::new(4);
        assert!(t.match_ack(5).is_none());
    }
}
