//! AES-GCM AEAD for block payloads.
//!
//! The chop protocol uses the *encrypted* 16-byte block header as the GCM
//! nonce, so these contexts are instantiated with a 16-byte nonce size
//! rather than the conventional 12. Associated data is always empty; the
//! tag is 16 bytes and trails the ciphertext.

use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{AeadInPlace, AesGcm, KeyInit};
use bytes::BytesMut;
use zeroize::Zeroizing;

use crate::crypto::{KeyGenerator, BLOCK_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

type Gcm128 = AesGcm<Aes128, U16>;
type Gcm192 = AesGcm<Aes192, U16>;
type Gcm256 = AesGcm<Aes256, U16>;

enum GcmCore {
    Aes128(Box<Gcm128>),
    Aes192(Box<Gcm192>),
    Aes256(Box<Gcm256>),
}

impl GcmCore {
    fn new(key: &[u8]) -> Self {
        match key.len() {
            16 => GcmCore::Aes128(Box::new(
                Gcm128::new_from_slice(key).expect("length checked"),
            )),
            24 => GcmCore::Aes192(Box::new(
                Gcm192::new_from_slice(key).expect("length checked"),
            )),
            32 => GcmCore::Aes256(Box::new(
                Gcm256::new_from_slice(key).expect("length checked"),
            )),
            n => panic!("AES only supports 16, 24, or 32-byte keys (got {n})"),
        }
    }

    fn from_generator(gen: &mut KeyGenerator, keylen: usize) -> Self {
        let mut key = Zeroizing::new(vec![0u8; keylen]);
        let got = gen.generate(&mut key);
        assert_eq!(got, keylen, "key generator exhausted");
        GcmCore::new(&key)
    }

    fn seal(&self, buf: &mut [u8], nonce: &[u8; BLOCK_SIZE]) -> [u8; TAG_SIZE] {
        let nonce = GenericArray::from_slice(nonce);
        let tag = match self {
            GcmCore::Aes128(c) => c.encrypt_in_place_detached(nonce, b"", buf),
            GcmCore::Aes192(c) => c.encrypt_in_place_detached(nonce, b"", buf),
            GcmCore::Aes256(c) => c.encrypt_in_place_detached(nonce, b"", buf),
        }
        // Only fails for plaintexts beyond the 64 GiB GCM limit, far past
        // the 128 KiB block ceiling.
        .expect("payload within GCM length limit");
        tag.into()
    }

    fn open(
        &self,
        buf: &mut [u8],
        tag: &[u8; TAG_SIZE],
        nonce: &[u8; BLOCK_SIZE],
    ) -> Result<()> {
        let nonce = GenericArray::from_slice(nonce);
        let tag = GenericArray::from_slice(tag);
        match self {
            GcmCore::Aes128(c) => c.decrypt_in_place_detached(nonce, b"", buf, tag),
            GcmCore::Aes192(c) => c.decrypt_in_place_detached(nonce, b"", buf, tag),
            GcmCore::Aes256(c) => c.decrypt_in_place_detached(nonce, b"", buf, tag),
        }
        .map_err(|_| Error::AuthFailure)
    }
}

/// GCM sealing context for one direction of one circuit.
pub struct GcmEncryptor {
    core: GcmCore,
}

impl GcmEncryptor {
    /// Create an encryptor from a raw 16/24/32-byte key.
    pub fn new(key: &[u8]) -> Self {
        Self { core: GcmCore::new(key) }
    }

    /// Create an encryptor from the next `keylen` bytes of a key generator.
    pub fn from_generator(gen: &mut KeyGenerator, keylen: usize) -> Self {
        Self { core: GcmCore::from_generator(gen, keylen) }
    }

    /// Append `plaintext.len()` bytes of ciphertext plus the 16-byte tag
    /// to `out`.
    pub fn encrypt(&self, out: &mut BytesMut, plaintext: &[u8], nonce: &[u8; BLOCK_SIZE]) {
        let start = out.len();
        out.extend_from_slice(plaintext);
        let tag = self.core.seal(&mut out[start..], nonce);
        out.extend_from_slice(&tag);
    }
}

/// GCM opening context for one direction of one circuit.
pub struct GcmDecryptor {
    core: GcmCore,
}

impl GcmDecryptor {
    /// Create a decryptor from a raw 16/24/32-byte key.
    pub fn new(key: &[u8]) -> Self {
        Self { core: GcmCore::new(key) }
    }

    /// Create a decryptor from the next `keylen` bytes of a key generator.
    pub fn from_generator(gen: &mut KeyGenerator, keylen: usize) -> Self {
        Self { core: GcmCore::from_generator(gen, keylen) }
    }

    /// Decrypt `buf` (ciphertext followed by the 16-byte tag) in place.
    ///
    /// On success the plaintext occupies `buf[..returned]`. On
    /// [`Error::AuthFailure`] the buffer contents must not be consumed.
    pub fn decrypt(&self, buf: &mut [u8], nonce: &[u8; BLOCK_SIZE]) -> Result<usize> {
        if buf.len() < TAG_SIZE {
            return Err(Error::AuthFailure);
        }
        let n = buf.len() - TAG_SIZE;
        let (body, tag) = buf.split_at_mut(n);
        let tag: [u8; TAG_SIZE] = (&*tag).try_into().expect("split at TAG_SIZE");
        self.core.open(body, &tag, nonce)?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (GcmEncryptor, GcmDecryptor) {
        let key = [0x1fu8; 16];
        (GcmEncryptor::new(&key), GcmDecryptor::new(&key))
    }

    #[test]
    fn test_seal_open_round_trip() {
        let (enc, dec) = pair();
        let nonce = [0xabu8; 16];

        let mut sealed = BytesMut::new();
        enc.encrypt(&mut sealed, b"covert payload", &nonce);
        assert_eq!(sealed.len(), 14 + TAG_SIZE);

        let mut buf = sealed.to_vec();
        let n = dec.decrypt(&mut buf, &nonce).unwrap();
        assert_eq!(&buf[..n], b"covert payload");
    }

    #[test]
    fn test_empty_payload_is_tag_only() {
        let (enc, dec) = pair();
        let nonce = [0x07u8; 16];

        let mut sealed = BytesMut::new();
        enc.encrypt(&mut sealed, b"", &nonce);
        assert_eq!(sealed.len(), TAG_SIZE);

        let mut buf = sealed.to_vec();
        assert_eq!(dec.decrypt(&mut buf, &nonce).unwrap(), 0);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (enc, dec) = pair();
        let nonce = [0x55u8; 16];

        let mut sealed = BytesMut::new();
        enc.encrypt(&mut sealed, b"secret data", &nonce);

        let mut buf = sealed.to_vec();
        buf[0] ^= 0x01;
        assert!(matches!(dec.decrypt(&mut buf, &nonce), Err(Error::AuthFailure)));
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let (enc, dec) = pair();

        let mut sealed = BytesMut::new();
        enc.encrypt(&mut sealed, b"secret data", &[0x01u8; 16]);

        let mut buf = sealed.to_vec();
        assert!(matches!(
            dec.decrypt(&mut buf, &[0x02u8; 16]),
            Err(Error::AuthFailure)
        ));
    }

    #[test]
    fn test_short_input_rejected() {
        let (_, dec) = pair();
        let mut buf = vec![0u8; TAG_SIZE - 1];
        assert!(dec.decrypt(&mut buf, &[0u8; 16]).is_err());
    }
}
