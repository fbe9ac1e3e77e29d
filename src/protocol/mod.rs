//! The chop protocol core.
//!
//! Blocks on the wire have a 16-byte header: a 32-bit sequence number, two
//! 16-bit length fields ("D" and "P"), an 8-bit opcode ("F"), and a 56-bit
//! check field, all big-endian:
//!
//! ```text
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | A | B | C | D | E | F |
//! |Sequence Number|   D   |   P   | F |           Check           |
//! ```
//!
//! The header is encrypted with AES in ECB mode: safe because the header is
//! exactly one AES block long, the sequence number never repeats, the
//! header key is used for nothing else, and the high 24 bits of the
//! sequence number plus the check field constitute an 80-bit MAC. The
//! receiver maintains a 256-element sliding window of acceptable sequence
//! numbers beginning at the lowest number not yet processed; a header whose
//! sequence number falls outside it, or whose check field is not all zero,
//! condemns the connection it arrived on.
//!
//! The data and padding sections that follow are encrypted with AES-GCM
//! under a separate key, with the *encrypted* header as the nonce; a
//! 16-byte tag covers both sections. Sequence numbers start at zero per
//! circuit and direction, advance by one per block, and never wrap; a
//! rekeying cycle (reserved, unimplemented) would be required first.

mod block;
mod circuit;
mod conn;
mod engine;
mod reassembly;

pub use block::{decode_next, encode_block, BlockHeader, DecodedBlock, Opcode};
pub use circuit::Circuit;
pub use conn::Downstream;
pub use engine::{ChopEngine, Event};
pub use reassembly::ReassemblyQueue;

/// Block header length in bytes
pub const HEADER_LEN: usize = 16;

/// GCM tag length in bytes
pub const TRAILER_LEN: usize = 16;

/// Maximum length of the data or padding section of one block
pub const SECTION_LEN: usize = u16::MAX as usize;

/// Smallest possible block: header plus tag
pub const MIN_BLOCK_SIZE: usize = HEADER_LEN + TRAILER_LEN;

/// Largest possible block: both sections full
pub const MAX_BLOCK_SIZE: usize = MIN_BLOCK_SIZE + SECTION_LEN * 2;

/// Handshake prefix length: the circuit ID on a new downstream
pub const HANDSHAKE_LEN: usize = 4;

/// Circuit identifier: nonzero, chosen at random by the client
pub type CircuitId = u32;

/// Downstream connection identifier, local to one engine
pub type ConnId = u64;
