//! The reassembly queue: a 256-slot circular buffer matching the 256-entry
//! sliding window of sequence numbers that may legitimately arrive.
//!
//! Most of a block's header is dealt with before it gets here; a slot only
//! records the opcode and the data section. A slot is occupied iff its
//! entry is `Some`; zero-length data still occupies its slot.

use bytes::Bytes;

use crate::protocol::Opcode;

const SLOTS: usize = 256;

/// An out-of-order block waiting for its turn.
#[derive(Debug)]
pub(crate) struct QueuedBlock {
    pub(crate) op: Opcode,
    pub(crate) data: Bytes,
}

/// Circular reassembly buffer indexed by sequence number modulo 256.
pub struct ReassemblyQueue {
    slots: Vec<Option<QueuedBlock>>,
    next_to_process: u32,
}

impl Default for ReassemblyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReassemblyQueue {
    /// Create an empty queue with the window edge at sequence number 0.
    pub fn new() -> Self {
        Self {
            slots: (0..SLOTS).map(|_| None).collect(),
            next_to_process: 0,
        }
    }

    /// The lowest acceptable sequence number in the receive window; this is
    /// the value header validation tests against.
    pub fn window(&self) -> u32 {
        self.next_to_process
    }

    /// Insert a block at `seqno`. Returns false if the block falls outside
    /// the window or duplicates an occupied slot, both protocol errors;
    /// the data is dropped either way.
    pub fn insert(&mut self, seqno: u32, op: Opcode, data: Bytes) -> bool {
        if seqno.wrapping_sub(self.window()) > (SLOTS - 1) as u32 {
            tracing::info!(seqno, window = self.window(), "block outside receive window");
            return false;
        }
        let pos = (seqno as usize) % SLOTS;
        if self.slots[pos].is_some() {
            tracing::info!(seqno, "duplicate block");
            return false;
        }
        self.slots[pos] = Some(QueuedBlock { op, data });
        true
    }

    /// Remove and return the next in-order block, advancing the window, or
    /// `None` if it has not arrived yet.
    pub(crate) fn remove_next(&mut self) -> Option<QueuedBlock> {
        let pos = (self.next_to_process as usize) % SLOTS;
        let blk = self.slots[pos].take()?;
        self.next_to_process = self.next_to_process.wrapping_add(1);
        Some(blk)
    }

    /// Reset the window edge to zero, as the last step of a rekeying cycle.
    ///
    /// # Panics
    ///
    /// Panics if any slot is still occupied; rekeying with blocks in flight
    /// is a protocol-state bug.
    pub fn reset(&mut self) {
        assert!(
            self.slots.iter().all(|s| s.is_none()),
            "reassembly queue reset with blocks pending"
        );
        self.next_to_process = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_in_order_delivery() {
        let mut q = ReassemblyQueue::new();
        assert!(q.insert(0, Opcode::Dat, data("a")));
        assert!(q.insert(1, Opcode::Dat, data("b")));

        assert_eq!(&q.remove_next().unwrap().data[..], b"a");
        assert_eq!(q.window(), 1);
        assert_eq!(&q.remove_next().unwrap().data[..], b"b");
        assert!(q.remove_next().is_none());
        assert_eq!(q.window(), 2);
    }

    #[test]
    fn test_out_of_order_blocks_wait() {
        let mut q = ReassemblyQueue::new();
        assert!(q.insert(1, Opcode::Dat, data("b")));
        // Block 0 has not arrived; nothing to deliver.
        assert!(q.remove_next().is_none());
        assert_eq!(q.window(), 0);

        assert!(q.insert(0, Opcode::Dat, data("a")));
        assert_eq!(&q.remove_next().unwrap().data[..], b"a");
        assert_eq!(&q.remove_next().unwrap().data[..], b"b");
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut q = ReassemblyQueue::new();
        assert!(q.insert(5, Opcode::Dat, data("x")));
        assert!(!q.insert(5, Opcode::Dat, data("y")));
    }

    #[test]
    fn test_window_bounds() {
        let mut q = ReassemblyQueue::new();
        // 255 is the last acceptable number; 256 is one past the window.
        assert!(q.insert(255, Opcode::Dat, data("edge")));
        assert!(!q.insert(256, Opcode::Dat, data("past")));

        // Advancing the window admits it.
        assert!(q.insert(0, Opcode::Dat, data("a")));
        q.remove_next().unwrap();
        assert!(q.insert(256, Opcode::Dat, data("now ok")));
    }

    #[test]
    fn test_zero_length_data_occupies_slot() {
        let mut q = ReassemblyQueue::new();
        assert!(q.insert(0, Opcode::Fin, Bytes::new()));
        assert!(!q.insert(0, Opcode::Fin, Bytes::new()));
        let blk = q.remove_next().unwrap();
        assert_eq!(blk.op, Opcode::Fin);
        assert!(blk.data.is_empty());
    }

    #[test]
    fn test_window_wraps_around_slot_array() {
        let mut q = ReassemblyQueue::new();
        for seq in 0..300u32 {
            assert!(q.insert(seq, Opcode::Dat, data(&seq.to_string())));
            let blk = q.remove_next().unwrap();
            assert_eq!(&blk.data[..], seq.to_string().as_bytes());
        }
        assert_eq!(q.window(), 300);
    }

    #[test]
    fn test_reset() {
        let mut q = ReassemblyQueue::new();
        assert!(q.insert(0, Opcode::Dat, data("a")));
        q.remove_next().unwrap();
        q.reset();
        assert_eq!(q.window(), 0);
    }

    #[test]
    #[should_panic(expected = "blocks pending")]
    fn test_reset_with_pending_blocks_panics() {
        let mut q = ReassemblyQueue::new();
        q.insert(1, Opcode::Dat, data("stuck"));
        q.reset();
    }
}
