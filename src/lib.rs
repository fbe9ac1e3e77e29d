//! # stegomux
//!
//! A steganographic multiplexing transport: one protected byte stream (the
//! "upstream") is chopped into authenticated blocks and spread across a
//! dynamic set of cover-protocol connections (the "downstreams"), each
//! dressed by a pluggable steg module so the wire traffic resembles the
//! chosen cover protocol.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Upstream application stream                 │
//! ├─────────────────────────────────────────────────────────┤
//! │  Circuit (sequencing, half-close FSM, chaff timers)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Block codec (ECB header + GCM payload, 256-slot window)│
//! ├─────────────────────────────────────────────────────────┤
//! │  Downstream connections + steg modules (cover framing)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  TCP (tokio driver)                                     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Confidentiality & integrity**: every block is AES-GCM authenticated;
//!    the 16-byte header doubles as the nonce after AES-ECB encryption
//! 2. **Unlinkability**: blocks of one circuit may traverse any downstream,
//!    in any order, and are reassembled through a 256-sequence window
//! 3. **Cover fidelity**: chaff and reply timers keep the cover protocol
//!    flowing even when the upstream has nothing to say
//!
//! The chop engine itself ([`protocol::ChopEngine`]) is a deterministic,
//! I/O-free state machine; all sockets and timers live in [`net`].

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod net;
pub mod protocol;
pub mod steg;

pub use config::{Config, Mode};
pub use error::{Error, Result};
