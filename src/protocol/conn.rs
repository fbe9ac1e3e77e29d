//! Per-downstream-connection state.
//!
//! A downstream bridges one cover-protocol socket to the chop engine: the
//! raw socket bytes pass through the attached steg module, which extracts
//! covert payload into `recv_pending` on the way in and dresses assembled
//! blocks on the way out.

use std::time::Instant;

use bytes::BytesMut;

use crate::error::Result;
use crate::protocol::{CircuitId, ConnId, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::steg::{Steg, StegHints, WireCtx};

/// One cover-protocol connection and its steg module.
pub struct Downstream {
    pub(crate) id: ConnId,
    /// Back-reference to the owning circuit, by ID; `None` until the
    /// handshake attaches us (server) or after the circuit died
    pub(crate) circuit: Option<CircuitId>,
    pub(crate) steg: Box<dyn Steg>,
    /// Raw bytes from the socket the steg module has not yet consumed
    pub(crate) inbound: BytesMut,
    /// Raw bytes the steg module has produced for the socket
    pub(crate) outbound: BytesMut,
    /// Covert bytes extracted by the steg module, awaiting block framing
    pub(crate) recv_pending: BytesMut,
    /// The socket under this connection is established; until then it
    /// offers no transmit room (client dials are created before connect)
    pub(crate) connected: bool,
    /// The handshake prefix has been transmitted (client side)
    pub(crate) sent_handshake: bool,
    /// The steg module declared it will never transmit again
    pub(crate) no_more_transmissions: bool,
    /// Deadline by which the cover protocol owes the peer a transmission
    pub(crate) must_send_at: Option<Instant>,
}

impl Downstream {
    pub(crate) fn new(
        id: ConnId,
        circuit: Option<CircuitId>,
        steg: Box<dyn Steg>,
        connected: bool,
    ) -> Self {
        Self {
            id,
            circuit,
            steg,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            recv_pending: BytesMut::new(),
            connected,
            sent_handshake: false,
            no_more_transmissions: false,
            must_send_at: None,
        }
    }

    /// True if the cover protocol still owes the peer a transmission.
    pub(crate) fn must_send_pending(&self) -> bool {
        self.must_send_at.is_some()
    }

    /// Query the steg module's current room and clamp it to what one block
    /// can use: at most `MAX_BLOCK_SIZE`, and 0 unless a minimum block fits.
    pub(crate) fn transmit_room(&self, preferred: usize) -> usize {
        if !self.connected {
            return 0;
        }
        let room = self
            .steg
            .transmit_room(preferred, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
        if room <= MIN_BLOCK_SIZE {
            0
        } else {
            room.min(MAX_BLOCK_SIZE)
        }
    }

    /// Run the steg module's receive hook: socket bytes in `inbound` are
    /// distilled into `recv_pending`. Returns the hints the module raised.
    pub(crate) fn steg_receive(&mut self) -> (Result<()>, StegHints) {
        let mut hints = StegHints::default();
        let mut wire = WireCtx {
            inbound: &mut self.inbound,
            outbound: &mut self.outbound,
            hints: &mut hints,
        };
        let res = self.steg.receive(&mut wire, &mut self.recv_pending);
        (res, hints)
    }

    /// Hand a fully framed unit (handshake prefix and/or block, or raw
    /// chaff) to the steg module for embedding.
    pub(crate) fn steg_transmit(&mut self, data: &[u8]) -> (Result<()>, StegHints) {
        let mut hints = StegHints::default();
        let mut wire = WireCtx {
            inbound: &mut self.inbound,
            outbound: &mut self.outbound,
            hints: &mut hints,
        };
        let res = self.steg.transmit(&mut wire, data);
        (res, hints)
    }

    /// Transmit a block, prepending the 4-byte circuit ID (native byte
    /// order) if this client connection has not yet introduced itself.
    /// On success the handshake is considered sent and any must-send
    /// obligation is discharged.
    pub(crate) fn send_block(
        &mut self,
        is_server: bool,
        block: &[u8],
    ) -> (Result<()>, StegHints) {
        let (res, hints) = if !self.sent_handshake && !is_server {
            let id = self
                .circuit
                .expect("client connection always has a circuit");
            let mut framed = Vec::with_capacity(4 + block.len());
            framed.extend_from_slice(&id.to_ne_bytes());
            framed.extend_from_slice(block);
            self.steg_transmit(&framed)
        } else {
            self.steg_transmit(block)
        };

        if res.is_ok() {
            self.sent_handshake = true;
            self.must_send_at = None;
        }
        (res, hints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steg::NoSteg;

    #[test]
    fn test_handshake_prefix_only_once() {
        let mut conn = Downstream::new(1, Some(0xdeadbeef), Box::new(NoSteg::new()), true);

        let (res, _) = conn.send_block(false, b"BLOCK0");
        res.unwrap();
        assert!(conn.sent_handshake);

        let (res, _) = conn.send_block(false, b"BLOCK1");
        res.unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&0xdeadbeef_u32.to_ne_bytes());
        expected.extend_from_slice(b"BLOCK0");
        expected.extend_from_slice(b"BLOCK1");
        assert_eq!(&conn.outbound[..], &expected[..]);
    }

    #[test]
    fn test_server_never_prepends_handshake() {
        let mut conn = Downstream::new(1, None, Box::new(NoSteg::new()), true);
        let (res, _) = conn.send_block(true, b"BLOCK");
        res.unwrap();
        assert_eq!(&conn.outbound[..], b"BLOCK");
    }

    #[test]
    fn test_send_discharges_must_send() {
        let mut conn = Downstream::new(1, Some(7), Box::new(NoSteg::new()), true);
        conn.must_send_at = Some(Instant::now());
        let (res, _) = conn.send_block(false, b"B");
        res.unwrap();
        assert!(!conn.must_send_pending());
    }

    #[test]
    fn test_transmit_room_clamps() {
        let conn = Downstream::new(1, None, Box::new(NoSteg::new()), true);
        // NoSteg offers `hi`, which is already MAX_BLOCK_SIZE.
        assert_eq!(conn.transmit_room(100), MAX_BLOCK_SIZE);
    }
}
