//! Block header and codec.

use bytes::{Buf, Bytes, BytesMut};

use crate::crypto::{EcbDecryptor, EcbEncryptor, GcmDecryptor, GcmEncryptor};
use crate::error::{Error, Result};
use crate::protocol::{HEADER_LEN, MIN_BLOCK_SIZE, SECTION_LEN, TRAILER_LEN};

/// Block opcode (the "F" header field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Ordinary data; the data section goes upstream
    Dat,
    /// Last block in this direction; data, if any, precedes EOF
    Fin,
    /// Protocol error; close the circuit now
    Rst,
    /// Commence rekeying (reserved, unimplemented)
    Rk1,
    /// Continue rekeying (reserved, unimplemented)
    Rk2,
    /// Conclude rekeying (reserved, unimplemented)
    Rk3,
    /// 128–255: reserved for steganography modules
    Steg(u8),
    /// 6–127: reserved for future definition; never sendable
    Reserved(u8),
}

impl Opcode {
    /// Decode an opcode byte. Every value maps to *some* opcode; whether it
    /// is acceptable is decided when the block is processed.
    pub fn from_wire(v: u8) -> Self {
        match v {
            0 => Opcode::Dat,
            1 => Opcode::Fin,
            2 => Opcode::Rst,
            3 => Opcode::Rk1,
            4 => Opcode::Rk2,
            5 => Opcode::Rk3,
            128..=255 => Opcode::Steg(v),
            _ => Opcode::Reserved(v),
        }
    }

    /// The wire byte for this opcode.
    pub fn wire(self) -> u8 {
        match self {
            Opcode::Dat => 0,
            Opcode::Fin => 1,
            Opcode::Rst => 2,
            Opcode::Rk1 => 3,
            Opcode::Rk2 => 4,
            Opcode::Rk3 => 5,
            Opcode::Steg(v) | Opcode::Reserved(v) => v,
        }
    }
}

/// A block header in both cleartext and ciphertext form.
///
/// The ciphertext doubles as the GCM nonce for the block payload.
pub struct BlockHeader {
    clear: [u8; HEADER_LEN],
    cipher: [u8; HEADER_LEN],
}

impl BlockHeader {
    /// Build and encrypt a header for transmission.
    ///
    /// Opcodes in the reserved zero range (6–127) are unsendable.
    pub fn new(
        seqno: u32,
        d: u16,
        p: u16,
        f: Opcode,
        ec: &EcbEncryptor,
    ) -> Result<Self> {
        if matches!(f, Opcode::Reserved(_)) {
            return Err(Error::protocol(format!(
                "opcode {:#04x} is reserved and unsendable",
                f.wire()
            )));
        }

        let mut clear = [0u8; HEADER_LEN];
        clear[0..4].copy_from_slice(&seqno.to_be_bytes());
        clear[4..6].copy_from_slice(&d.to_be_bytes());
        clear[6..8].copy_from_slice(&p.to_be_bytes());
        clear[8] = f.wire();
        // clear[9..16] is the check field, all zero.

        let mut cipher = [0u8; HEADER_LEN];
        ec.encrypt(&mut cipher, &clear);
        Ok(Self { clear, cipher })
    }

    /// Decrypt a received header. `buf` must hold at least 16 bytes, which
    /// are peeked, not consumed.
    pub fn decrypt(buf: &[u8], dc: &EcbDecryptor) -> Self {
        let mut cipher = [0u8; HEADER_LEN];
        cipher.copy_from_slice(&buf[..HEADER_LEN]);
        let mut clear = [0u8; HEADER_LEN];
        dc.decrypt(&mut clear, &cipher);
        Self { clear, cipher }
    }

    /// Sequence number field.
    pub fn seqno(&self) -> u32 {
        u32::from_be_bytes(self.clear[0..4].try_into().expect("4 bytes"))
    }

    /// Data section length.
    pub fn dlen(&self) -> usize {
        u16::from_be_bytes(self.clear[4..6].try_into().expect("2 bytes")) as usize
    }

    /// Padding section length.
    pub fn plen(&self) -> usize {
        u16::from_be_bytes(self.clear[6..8].try_into().expect("2 bytes")) as usize
    }

    /// Total on-wire length of the block this header announces.
    pub fn total_len(&self) -> usize {
        HEADER_LEN + TRAILER_LEN + self.dlen() + self.plen()
    }

    /// Opcode field.
    pub fn opcode(&self) -> Opcode {
        Opcode::from_wire(self.clear[8])
    }

    /// Accept this header iff the check field is all zero and the sequence
    /// number falls within the 256-entry window starting at `window`.
    ///
    /// This check runs in constant time: every byte and the window delta
    /// are OR-folded into one accumulator compared once at the end.
    pub fn valid(&self, window: u32) -> bool {
        let mut ck = self.clear[9]
            | self.clear[10]
            | self.clear[11]
            | self.clear[12]
            | self.clear[13]
            | self.clear[14]
            | self.clear[15];
        let delta = self.seqno().wrapping_sub(window);
        ck |= u8::from(delta & !0xFFu32 != 0);
        ck == 0
    }

    /// The header ciphertext, which is also the payload nonce.
    pub fn nonce(&self) -> &[u8; HEADER_LEN] {
        &self.cipher
    }
}

/// A validated, decrypted block ready for the reassembly queue.
#[derive(Debug)]
pub struct DecodedBlock {
    /// Sequence number
    pub seqno: u32,
    /// Opcode
    pub op: Opcode,
    /// Data section; padding has already been discarded
    pub data: Bytes,
}

/// Assemble one complete wire block:
/// `ECB(header) || GCM(data || zero-padding) || tag`.
pub fn encode_block(
    seqno: u32,
    op: Opcode,
    data: &[u8],
    padding: usize,
    hdr_crypt: &EcbEncryptor,
    payload_crypt: &GcmEncryptor,
) -> Result<Bytes> {
    debug_assert!(data.len() <= SECTION_LEN);
    debug_assert!(padding <= SECTION_LEN);

    let hdr = BlockHeader::new(seqno, data.len() as u16, padding as u16, op, hdr_crypt)?;
    debug_assert!(hdr.valid(seqno));

    let mut scratch = Vec::with_capacity(data.len() + padding);
    scratch.extend_from_slice(data);
    scratch.resize(data.len() + padding, 0);

    let mut block = BytesMut::with_capacity(MIN_BLOCK_SIZE + scratch.len());
    block.extend_from_slice(hdr.nonce());
    payload_crypt.encrypt(&mut block, &scratch, hdr.nonce());
    Ok(block.freeze())
}

/// Try to decode the next block from `pending`.
///
/// Returns `Ok(None)` when more bytes are needed (nothing is consumed),
/// [`Error::BadHeader`] when the header fails the check-field/window test,
/// and [`Error::AuthFailure`] when the payload tag rejects. Both errors
/// condemn the connection the bytes arrived on.
pub fn decode_next(
    pending: &mut BytesMut,
    window: u32,
    hdr_crypt: &EcbDecryptor,
    payload_crypt: &GcmDecryptor,
) -> Result<Option<DecodedBlock>> {
    if pending.len() < MIN_BLOCK_SIZE {
        return Ok(None);
    }

    let hdr = BlockHeader::decrypt(pending, hdr_crypt);
    if !hdr.valid(window) {
        return Err(Error::BadHeader);
    }
    if pending.len() < hdr.total_len() {
        return Ok(None);
    }

    pending.advance(HEADER_LEN);
    let mut body = pending
        .split_to(hdr.total_len() - HEADER_LEN)
        .to_vec();
    payload_crypt.decrypt(&mut body, hdr.nonce())?;

    body.truncate(hdr.dlen());
    Ok(Some(DecodedBlock {
        seqno: hdr.seqno(),
        op: hdr.opcode(),
        data: Bytes::from(body),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecureRandom;

    fn contexts() -> (EcbEncryptor, EcbDecryptor, GcmEncryptor, GcmDecryptor) {
        let hk = [0x11u8; 16];
        let pk = [0x22u8; 16];
        (
            EcbEncryptor::new(&hk),
            EcbDecryptor::new(&hk),
            GcmEncryptor::new(&pk),
            GcmDecryptor::new(&pk),
        )
    }

    #[test]
    fn test_opcode_wire_mapping() {
        assert_eq!(Opcode::from_wire(0), Opcode::Dat);
        assert_eq!(Opcode::from_wire(1), Opcode::Fin);
        assert_eq!(Opcode::from_wire(2), Opcode::Rst);
        assert_eq!(Opcode::from_wire(6), Opcode::Reserved(6));
        assert_eq!(Opcode::from_wire(127), Opcode::Reserved(127));
        assert_eq!(Opcode::from_wire(128), Opcode::Steg(128));
        for v in 0..=255u8 {
            assert_eq!(Opcode::from_wire(v).wire(), v);
        }
    }

    #[test]
    fn test_block_round_trip_discards_padding() {
        let (he, hd, pe, pd) = contexts();
        let block = encode_block(7, Opcode::Dat, b"hello", 40, &he, &pe).unwrap();
        assert_eq!(block.len(), MIN_BLOCK_SIZE + 5 + 40);

        let mut pending = BytesMut::from(&block[..]);
        let blk = decode_next(&mut pending, 0, &hd, &pd).unwrap().unwrap();
        assert_eq!(blk.seqno, 7);
        assert_eq!(blk.op, Opcode::Dat);
        assert_eq!(&blk.data[..], b"hello");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_incomplete_block_needs_more_data() {
        let (he, hd, pe, pd) = contexts();
        let block = encode_block(0, Opcode::Dat, b"0123456789", 0, &he, &pe).unwrap();

        // Header alone, then header + partial body: nothing consumed.
        for cut in [8, HEADER_LEN, block.len() - 1] {
            let mut pending = BytesMut::from(&block[..cut]);
            assert!(decode_next(&mut pending, 0, &hd, &pd).unwrap().is_none());
            assert_eq!(pending.len(), cut);
        }
    }

    #[test]
    fn test_out_of_window_header_rejected() {
        let (he, hd, pe, pd) = contexts();
        let block = encode_block(300, Opcode::Dat, b"x", 0, &he, &pe).unwrap();

        let mut pending = BytesMut::from(&block[..]);
        // Window starts at 0; 300 is more than 255 ahead.
        assert!(matches!(
            decode_next(&mut pending, 0, &hd, &pd),
            Err(Error::BadHeader)
        ));
        // Within a window that covers it, the same block parses.
        let mut pending = BytesMut::from(&block[..]);
        assert!(decode_next(&mut pending, 200, &hd, &pd).unwrap().is_some());
    }

    #[test]
    fn test_random_headers_rejected() {
        // Forgery resistance is structural (an 80-bit MAC); uniformly
        // random headers must essentially never validate.
        let (_, hd, _, _) = contexts();
        for _ in 0..10_000 {
            let mut junk = [0u8; HEADER_LEN];
            SecureRandom::fill(&mut junk);
            let hdr = BlockHeader::decrypt(&junk, &hd);
            assert!(!hdr.valid(0), "random header accepted");
        }
    }

    #[test]
    fn test_corrupted_payload_fails_auth() {
        let (he, hd, pe, pd) = contexts();
        let block = encode_block(0, Opcode::Dat, b"payload", 3, &he, &pe).unwrap();

        let mut corrupted = BytesMut::from(&block[..]);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x80;
        assert!(matches!(
            decode_next(&mut corrupted, 0, &hd, &pd),
            Err(Error::AuthFailure)
        ));
    }

    #[test]
    fn test_reserved_opcode_unsendable() {
        let (he, _, pe, _) = contexts();
        assert!(encode_block(0, Opcode::Reserved(6), b"", 0, &he, &pe).is_err());
        assert!(encode_block(0, Opcode::Reserved(127), b"", 0, &he, &pe).is_err());
        // The steg range is sendable.
        assert!(encode_block(0, Opcode::Steg(0x80), b"", 0, &he, &pe).is_ok());
    }

    #[test]
    fn test_two_blocks_in_one_buffer() {
        let (he, hd, pe, pd) = contexts();
        let b0 = encode_block(0, Opcode::Dat, b"first", 0, &he, &pe).unwrap();
        let b1 = encode_block(1, Opcode::Fin, b"second", 8, &he, &pe).unwrap();

        let mut pending = BytesMut::new();
        pending.extend_from_slice(&b0);
        pending.extend_from_slice(&b1);

        let first = decode_next(&mut pending, 0, &hd, &pd).unwrap().unwrap();
        assert_eq!(&first.data[..], b"first");
        let second = decode_next(&mut pending, 0, &hd, &pd).unwrap().unwrap();
        assert_eq!(second.op, Opcode::Fin);
        assert_eq!(&second.data[..], b"second");
        assert!(pending.is_empty());
    }
}
