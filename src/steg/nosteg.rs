//! Null steganography: blocks travel as-is on a plain byte stream.
//!
//! Useful for testing the chop engine and for deployments where the outer
//! channel is already innocuous.

use bytes::BytesMut;

use crate::error::Result;
use crate::steg::{Steg, WireCtx};

/// Passthrough module with no cover framing and no transmission limits.
pub struct NoSteg;

impl NoSteg {
    /// Create a passthrough module.
    pub fn new() -> Self {
        NoSteg
    }
}

impl Default for NoSteg {
    fn default() -> Self {
        Self::new()
    }
}

impl Steg for NoSteg {
    fn name(&self) -> &'static str {
        "nosteg"
    }

    fn transmit_room(&self, _preferred: usize, _lo: usize, hi: usize) -> usize {
        hi
    }

    fn transmit(&mut self, wire: &mut WireCtx<'_>, block: &[u8]) -> Result<()> {
        wire.outbound.extend_from_slice(block);
        Ok(())
    }

    fn receive(&mut self, wire: &mut WireCtx<'_>, dest: &mut BytesMut) -> Result<()> {
        dest.extend_from_slice(&wire.inbound.split());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steg::StegHints;

    #[test]
    fn test_passthrough() {
        let mut steg = NoSteg::new();
        let mut inbound = BytesMut::new();
        let mut outbound = BytesMut::new();
        let mut hints = StegHints::default();

        assert_eq!(steg.transmit_room(100, 32, 4096), 4096);

        let mut wire = WireCtx {
            inbound: &mut inbound,
            outbound: &mut outbound,
            hints: &mut hints,
        };
        steg.transmit(&mut wire, b"a block").unwrap();
        assert_eq!(&outbound[..], b"a block");

        inbound.extend_from_slice(b"wire bytes");
        let mut wire = WireCtx {
            inbound: &mut inbound,
            outbound: &mut outbound,
            hints: &mut hints,
        };
        let mut dest = BytesMut::new();
        steg.receive(&mut wire, &mut dest).unwrap();
        assert_eq!(&dest[..], b"wire bytes");
        assert!(inbound.is_empty());
        assert!(!hints.cease_transmission);
    }
}
