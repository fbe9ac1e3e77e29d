//! Keystream generation.
//!
//! A [`KeyGenerator`] expands either a high-entropy secret or a passphrase
//! into an arbitrary-length keystream following HKDF-Expand (RFC 5869):
//! `T(1) = HMAC(prk, info || 0x01)`, `T(i) = HMAC(prk, T(i-1) || info || i)`.
//! The block counter is a single byte; when it would wrap the generator is
//! poisoned and yields only zeros from then on. A rekeying cycle is required
//! before any circuit could plausibly exhaust it.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::crypto::PBKDF2_ITERATIONS;

type HmacSha256 = Hmac<Sha256>;

const DIGEST_LEN: usize = 32;
const ZERO_SALT: [u8; DIGEST_LEN] = [0u8; DIGEST_LEN];

/// Streaming HKDF-Expand keystream over a pseudorandom key.
pub struct KeyGenerator {
    /// HMAC keyed with the PRK; cloned for each output block
    expander: HmacSha256,
    info: Vec<u8>,
    prev: [u8; DIGEST_LEN],
    counter: u8,
    leftover: usize,
    dead: bool,
}

impl Drop for KeyGenerator {
    fn drop(&mut self) {
        self.prev.zeroize();
        self.info.zeroize();
    }
}

impl KeyGenerator {
    /// Build a generator from a high-entropy secret:
    /// `prk = HMAC-SHA256(key = salt, msg = secret)` (HKDF-Extract).
    /// An empty salt is replaced by 32 zero bytes.
    pub fn from_random_secret(secret: &[u8], salt: &[u8], info: &[u8]) -> Self {
        let salt = if salt.is_empty() { &ZERO_SALT[..] } else { salt };
        let mut extract =
            HmacSha256::new_from_slice(salt).expect("HMAC accepts any key length");
        extract.update(secret);
        let mut prk: [u8; DIGEST_LEN] = extract.finalize().into_bytes().into();
        let gen = Self::from_prk(&prk, info);
        prk.zeroize();
        gen
    }

    /// Build a generator from a passphrase:
    /// `prk = PBKDF2-HMAC-SHA256(phrase, salt, 10000 iterations)`.
    /// An empty salt is replaced by 32 zero bytes.
    pub fn from_passphrase(phrase: &[u8], salt: &[u8], info: &[u8]) -> Self {
        let salt = if salt.is_empty() { &ZERO_SALT[..] } else { salt };
        let mut prk = [0u8; DIGEST_LEN];
        pbkdf2::pbkdf2::<HmacSha256>(phrase, salt, PBKDF2_ITERATIONS, &mut prk)
            .expect("PBKDF2 output length is valid");
        let gen = Self::from_prk(&prk, info);
        prk.zeroize();
        gen
    }

    fn from_prk(prk: &[u8; DIGEST_LEN], info: &[u8]) -> Self {
        Self {
            expander: HmacSha256::new_from_slice(prk)
                .expect("HMAC accepts any key length"),
            info: info.to_vec(),
            prev: [0u8; DIGEST_LEN],
            counter: 1,
            leftover: 0,
            dead: false,
        }
    }

    /// Fill `buf` with keystream bytes and return how many were produced.
    ///
    /// A short count happens only when the block counter would wrap: the
    /// remainder of `buf` is zeroed, the generator is poisoned, and every
    /// later call zero-fills and returns 0.
    pub fn generate(&mut self, buf: &mut [u8]) -> usize {
        if self.dead {
            buf.fill(0);
            return 0;
        }

        let mut n = 0;
        if self.leftover > 0 {
            let take = self.leftover.min(buf.len());
            let start = DIGEST_LEN - self.leftover;
            buf[..take].copy_from_slice(&self.prev[start..start + take]);
            self.leftover -= take;
            n = take;
        }

        while n < buf.len() {
            let mut mac = self.expander.clone();
            if self.counter > 1 {
                mac.update(&self.prev);
            }
            mac.update(&self.info);
            mac.update(&[self.counter]);
            self.prev.copy_from_slice(&mac.finalize().into_bytes());

            let want = buf.len() - n;
            if want >= DIGEST_LEN {
                buf[n..n + DIGEST_LEN].copy_from_slice(&self.prev);
                n += DIGEST_LEN;
            } else {
                buf[n..].copy_from_slice(&self.prev[..want]);
                self.leftover = DIGEST_LEN - want;
                n = buf.len();
            }

            let (next, wrapped) = self.counter.overflowing_add(1);
            self.counter = next;
            if wrapped {
                buf[n..].fill(0);
                self.dead = true;
                break;
            }
        }

        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc5869_case_1() {
        // RFC 5869 A.1: from_random_secret is exactly HKDF-SHA256.
        let ikm = [0x0bu8; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();
        let expected = [
            0x3c, 0xb2, 0x5f, 0x25, 0xfa, 0xac, 0xd5, 0x7a, 0x90, 0x43, 0x4f,
            0x64, 0xd0, 0x36, 0x2f, 0x2a, 0x2d, 0x2d, 0x0a, 0x90, 0xcf, 0x1a,
            0x5a, 0x4c, 0x5d, 0xb0, 0x2d, 0x56, 0xec, 0xc4, 0xc5, 0xbf, 0x34,
            0x00, 0x72, 0x08, 0xd5, 0xb8, 0x87, 0x18, 0x58, 0x65,
        ];

        let mut gen = KeyGenerator::from_random_secret(&ikm, &salt, &info);
        let mut okm = [0u8; 42];
        assert_eq!(gen.generate(&mut okm), 42);
        assert_eq!(okm, expected);
    }

    #[test]
    fn test_split_reads_match_one_read() {
        let mut a = KeyGenerator::from_passphrase(b"phrase", b"salt", b"ctx");
        let mut b = KeyGenerator::from_passphrase(b"phrase", b"salt", b"ctx");

        let mut whole = [0u8; 80];
        assert_eq!(a.generate(&mut whole), 80);

        // Awkward split sizes exercise the leftover carry.
        let mut parts = [0u8; 80];
        assert_eq!(b.generate(&mut parts[..7]), 7);
        assert_eq!(b.generate(&mut parts[7..39]), 32);
        assert_eq!(b.generate(&mut parts[39..]), 41);
        assert_eq!(whole, parts);
    }

    #[test]
    fn test_passphrase_and_salt_matter() {
        let mut a = KeyGenerator::from_passphrase(b"phrase", b"salt", b"");
        let mut b = KeyGenerator::from_passphrase(b"phrase!", b"salt", b"");
        let mut c = KeyGenerator::from_passphrase(b"phrase", b"", b"");

        let (mut ka, mut kb, mut kc) = ([0u8; 32], [0u8; 32], [0u8; 32]);
        a.generate(&mut ka);
        b.generate(&mut kb);
        c.generate(&mut kc);
        assert_ne!(ka, kb);
        assert_ne!(ka, kc);
    }

    #[test]
    fn test_counter_exhaustion_poisons() {
        let mut gen = KeyGenerator::from_random_secret(b"secret", b"", b"");

        // 255 blocks of 32 bytes exist before the 1-byte counter wraps.
        let mut stream = vec![0u8; 255 * DIGEST_LEN];
        assert_eq!(gen.generate(&mut stream), 255 * DIGEST_LEN);
        assert!(stream.iter().any(|&b| b != 0));

        let mut more = [0xffu8; 16];
        assert_eq!(gen.generate(&mut more), 0);
        assert_eq!(more, [0u8; 16]);
    }

    #[test]
    fn test_exhaustion_mid_read_zero_fills_tail() {
        let mut gen = KeyGenerator::from_random_secret(b"secret", b"", b"");
        let mut head = vec![0u8; 254 * DIGEST_LEN];
        assert_eq!(gen.generate(&mut head), head.len());

        // One block remains; ask for two.
        let mut tail = [0xffu8; 2 * DIGEST_LEN];
        assert_eq!(gen.generate(&mut tail), DIGEST_LEN);
        assert!(tail[..DIGEST_LEN].iter().any(|&b| b != 0));
        assert_eq!(&tail[DIGEST_LEN..], &[0u8; DIGEST_LEN]);

        let mut more = [0u8; 4];
        assert_eq!(gen.generate(&mut more), 0);
    }
}
