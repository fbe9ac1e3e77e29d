//! Single-block AES-ECB contexts for header encryption.
//!
//! ECB is safe here because each context only ever processes exactly one
//! 16-byte block per header, the sequence number inside the block never
//! repeats, and the header key is used for nothing else.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256, Block};
use zeroize::Zeroizing;

use crate::crypto::{KeyGenerator, BLOCK_SIZE};

/// An AES core of any of the three standard key sizes.
enum AesCore {
    Aes128(Box<Aes128>),
    Aes192(Box<Aes192>),
    Aes256(Box<Aes256>),
}

impl AesCore {
    /// Expand `key` into a cipher core.
    ///
    /// # Panics
    ///
    /// Panics on a key that is not 16, 24, or 32 bytes; that is a caller
    /// bug, not a runtime condition.
    fn new(key: &[u8]) -> Self {
        match key.len() {
            16 => AesCore::Aes128(Box::new(
                Aes128::new_from_slice(key).expect("length checked"),
            )),
            24 => AesCore::Aes192(Box::new(
                Aes192::new_from_slice(key).expect("length checked"),
            )),
            32 => AesCore::Aes256(Box::new(
                Aes256::new_from_slice(key).expect("length checked"),
            )),
            n => panic!("AES only supports 16, 24, or 32-byte keys (got {n})"),
        }
    }

    fn from_generator(gen: &mut KeyGenerator, keylen: usize) -> Self {
        let mut key = Zeroizing::new(vec![0u8; keylen]);
        let got = gen.generate(&mut key);
        assert_eq!(got, keylen, "key generator exhausted");
        AesCore::new(&key)
    }

    fn encrypt(&self, out: &mut [u8; BLOCK_SIZE], input: &[u8; BLOCK_SIZE]) {
        let inp = Block::from_slice(input);
        let outp = Block::from_mut_slice(out);
        match self {
            AesCore::Aes128(c) => c.encrypt_block_b2b(inp, outp),
            AesCore::Aes192(c) => c.encrypt_block_b2b(inp, outp),
            AesCore::Aes256(c) => c.encrypt_block_b2b(inp, outp),
        }
    }

    fn decrypt(&self, out: &mut [u8; BLOCK_SIZE], input: &[u8; BLOCK_SIZE]) {
        let inp = Block::from_slice(input);
        let outp = Block::from_mut_slice(out);
        match self {
            AesCore::Aes128(c) => c.decrypt_block_b2b(inp, outp),
            AesCore::Aes192(c) => c.decrypt_block_b2b(inp, outp),
            AesCore::Aes256(c) => c.decrypt_block_b2b(inp, outp),
        }
    }
}

/// Encrypts exactly one 16-byte block per call, no padding.
pub struct EcbEncryptor {
    core: AesCore,
}

impl EcbEncryptor {
    /// Create an encryptor from a raw 16/24/32-byte key.
    pub fn new(key: &[u8]) -> Self {
        Self { core: AesCore::new(key) }
    }

    /// Create an encryptor from the next `keylen` bytes of a key generator.
    pub fn from_generator(gen: &mut KeyGenerator, keylen: usize) -> Self {
        Self { core: AesCore::from_generator(gen, keylen) }
    }

    /// Encrypt one block. Infallible once the context is built.
    pub fn encrypt(&self, out: &mut [u8; BLOCK_SIZE], input: &[u8; BLOCK_SIZE]) {
        self.core.encrypt(out, input);
    }
}

/// Decrypts exactly one 16-byte block per call, no padding.
pub struct EcbDecryptor {
    core: AesCore,
}

impl EcbDecryptor {
    /// Create a decryptor from a raw 16/24/32-byte key.
    pub fn new(key: &[u8]) -> Self {
        Self { core: AesCore::new(key) }
    }

    /// Create a decryptor from the next `keylen` bytes of a key generator.
    pub fn from_generator(gen: &mut KeyGenerator, keylen: usize) -> Self {
        Self { core: AesCore::from_generator(gen, keylen) }
    }

    /// Decrypt one block. Infallible once the context is built.
    pub fn decrypt(&self, out: &mut [u8; BLOCK_SIZE], input: &[u8; BLOCK_SIZE]) {
        self.core.decrypt(out, input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fips197_vector() {
        // FIPS-197 appendix C.1
        let key: [u8; 16] = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
            0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        ];
        let plain: [u8; 16] = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
            0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
        ];
        let expected: [u8; 16] = [
            0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30,
            0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4, 0xc5, 0x5a,
        ];

        let enc = EcbEncryptor::new(&key);
        let mut cipher = [0u8; 16];
        enc.encrypt(&mut cipher, &plain);
        assert_eq!(cipher, expected);

        let dec = EcbDecryptor::new(&key);
        let mut back = [0u8; 16];
        dec.decrypt(&mut back, &cipher);
        assert_eq!(back, plain);
    }

    #[test]
    fn test_all_key_sizes_round_trip() {
        for keylen in [16usize, 24, 32] {
            let key = vec![0x42u8; keylen];
            let enc = EcbEncryptor::new(&key);
            let dec = EcbDecryptor::new(&key);

            let plain = *b"the quick brown ";
            let mut cipher = [0u8; 16];
            enc.encrypt(&mut cipher, &plain);
            assert_ne!(cipher, plain);

            let mut back = [0u8; 16];
            dec.decrypt(&mut back, &cipher);
            assert_eq!(back, plain);
        }
    }

    #[test]
    #[should_panic(expected = "16, 24, or 32-byte keys")]
    fn test_bad_key_size_panics() {
        let _ = EcbEncryptor::new(&[0u8; 20]);
    }
}
