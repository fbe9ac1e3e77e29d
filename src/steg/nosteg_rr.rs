//! Null steganography with request/response discipline.
//!
//! Mimics the connection shape of cover protocols like HTTP without their
//! framing: the client sends exactly one transmission per connection and
//! then ceases; the server may only speak after it has heard the client,
//! and owes a reply within 100 ms of receiving one.

use bytes::BytesMut;

use crate::error::Result;
use crate::steg::{Steg, WireCtx};

/// Reply deadline after a server-side receive, in milliseconds.
const REPLY_WITHIN_MS: u64 = 100;

/// Passthrough module with strict request/response alternation.
pub struct NoStegRr {
    is_server: bool,
    can_transmit: bool,
    did_transmit: bool,
}

impl NoStegRr {
    /// Create a request/response module for one side of a connection.
    pub fn new(is_server: bool) -> Self {
        Self {
            is_server,
            // Clients speak first.
            can_transmit: !is_server,
            did_transmit: false,
        }
    }
}

impl Steg for NoStegRr {
    fn name(&self) -> &'static str {
        "nosteg_rr"
    }

    fn transmit_room(&self, _preferred: usize, _lo: usize, hi: usize) -> usize {
        if self.can_transmit {
            hi
        } else {
            0
        }
    }

    fn transmit(&mut self, wire: &mut WireCtx<'_>, block: &[u8]) -> Result<()> {
        debug_assert!(self.can_transmit);
        wire.outbound.extend_from_slice(block);
        self.did_transmit = true;
        self.can_transmit = false;
        wire.hints.cease_transmission();
        Ok(())
    }

    fn receive(&mut self, wire: &mut WireCtx<'_>, dest: &mut BytesMut) -> Result<()> {
        dest.extend_from_slice(&wire.inbound.split());

        if !self.is_server {
            wire.hints.expect_close();
        } else if !self.did_transmit {
            self.can_transmit = true;
            wire.hints.transmit_soon(REPLY_WITHIN_MS);
        }
        Ok(())
    }
}
