//! Steganography module contract and registry.
//!
//! A steg module dresses raw chop blocks in a cover-protocol appearance.
//! The engine treats modules as opaque policies: it asks how much payload a
//! module can currently hide ([`Steg::transmit_room`]), hands it assembled
//! blocks to embed ([`Steg::transmit`]), and asks it to extract covert
//! bytes from the connection's inbound stream ([`Steg::receive`]).
//!
//! Modules steer the connection lifecycle through [`StegHints`]: a module
//! may declare it will never transmit again, demand a transmission within a
//! deadline (cover protocols with mandatory replies), or note that the peer
//! is expected to close.

mod nosteg;
mod nosteg_rr;

use bytes::BytesMut;

pub use nosteg::NoSteg;
pub use nosteg_rr::NoStegRr;

use crate::error::Result;

/// Connection-lifecycle requests raised by a steg module during a
/// `transmit` or `receive` call; the engine applies them afterwards.
#[derive(Debug, Default)]
pub struct StegHints {
    /// The module will not transmit on this connection again
    pub cease_transmission: bool,
    /// The peer is expected to close this connection shortly
    pub expect_close: bool,
    /// The cover protocol owes the peer a transmission within this many
    /// milliseconds, with or without upstream data
    pub transmit_soon_ms: Option<u64>,
}

impl StegHints {
    /// Declare that this connection will never transmit again.
    pub fn cease_transmission(&mut self) {
        self.cease_transmission = true;
    }

    /// Note that the peer is expected to close the connection.
    pub fn expect_close(&mut self) {
        self.expect_close = true;
    }

    /// Demand a transmission within `ms` milliseconds.
    pub fn transmit_soon(&mut self, ms: u64) {
        self.transmit_soon_ms = Some(ms);
    }
}

/// The wire-side view a steg module operates on: raw socket bytes in both
/// directions plus the hint sink.
pub struct WireCtx<'a> {
    /// Bytes read from the socket, not yet consumed by the module
    pub inbound: &'a mut BytesMut,
    /// Bytes the module has dressed for the socket
    pub outbound: &'a mut BytesMut,
    /// Lifecycle requests to the engine
    pub hints: &'a mut StegHints,
}

/// A cover-protocol codec attached to one downstream connection.
pub trait Steg: Send {
    /// Module name as given on the command line.
    fn name(&self) -> &'static str;

    /// Maximum covert payload this module can hide in a single cover unit
    /// right now; 0 if it cannot transmit. `preferred` is what the caller
    /// would like to send, `lo..=hi` the block sizes it can produce.
    fn transmit_room(&self, preferred: usize, lo: usize, hi: usize) -> usize;

    /// Embed `block` in cover traffic and queue it on `wire.outbound`.
    /// The block is consumed on success.
    fn transmit(&mut self, wire: &mut WireCtx<'_>, block: &[u8]) -> Result<()>;

    /// Extract any covert payload hidden in `wire.inbound` into `dest`.
    fn receive(&mut self, wire: &mut WireCtx<'_>, dest: &mut BytesMut) -> Result<()>;
}

/// True if `name` names a registered steg module.
pub fn is_supported(name: &str) -> bool {
    matches!(name, "nosteg" | "nosteg_rr")
}

/// Instantiate the named steg module for one connection.
pub fn create(name: &str, is_server: bool) -> Option<Box<dyn Steg>> {
    match name {
        "nosteg" => Some(Box::new(NoSteg::new())),
        "nosteg_rr" => Some(Box::new(NoStegRr::new(is_server))),
        _ => None,
    }
}
