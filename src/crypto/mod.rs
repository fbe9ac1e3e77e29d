//! Cryptographic primitives for the chop protocol.
//!
//! This module provides:
//! - AES-ECB single-block contexts for header encryption
//! - AES-GCM AEAD with a 16-byte nonce for block payloads
//! - A keystream generator (HKDF-Expand over a secret or a passphrase)
//! - Secure random number generation
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod ecb;
mod gcm;
mod kdf;
mod random;

pub use ecb::{EcbDecryptor, EcbEncryptor};
pub use gcm::{GcmDecryptor, GcmEncryptor};
pub use kdf::KeyGenerator;
pub use random::{range_geom, SecureRandom};

/// AES block size in bytes; also the chop header and GCM nonce size
pub const BLOCK_SIZE: usize = 16;

/// Size of the GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// PBKDF2 iteration count for passphrase-derived keys
pub const PBKDF2_ITERATIONS: u32 = 10_000;
