//! Per-circuit state.
//!
//! A circuit is the logical bidirectional channel multiplexed over one or
//! more downstream connections. It owns the four cryptographic contexts
//! for its two directions, the reassembly queue, and the set of attached
//! downstream connection IDs. Downstreams refer back to their circuit by
//! ID only, so teardown by timer can never leave a dangling reference.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::crypto::{
    range_geom, EcbDecryptor, EcbEncryptor, GcmDecryptor, GcmEncryptor, KeyGenerator,
};
use crate::protocol::{CircuitId, ConnId, ReassemblyQueue};

/// Bytes of keystream consumed per cryptographic context (AES-128).
const KEY_LEN: usize = 16;

/// Last-resort shutdown interval for an idle server-side circuit. Must
/// exceed the largest interval the peer's flush timer can produce, or we
/// would axe circuits that merely had nothing to say for a while.
const AXE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// One logical end-to-end stream and its crypto state.
pub struct Circuit {
    /// Circuit identifier, shared with the peer via the handshake prefix
    pub(crate) id: CircuitId,
    pub(crate) send_crypt: GcmEncryptor,
    pub(crate) send_hdr_crypt: EcbEncryptor,
    pub(crate) recv_crypt: GcmDecryptor,
    pub(crate) recv_hdr_crypt: EcbDecryptor,
    pub(crate) recv_queue: ReassemblyQueue,
    /// Attached downstream connections
    pub(crate) downstreams: HashSet<ConnId>,
    /// Next block sequence number to transmit; must never reach 2^32
    pub(crate) send_seq: u32,
    /// Consecutive send() invocations that moved no real data
    pub(crate) dead_cycles: u32,
    pub(crate) sent_fin: bool,
    pub(crate) received_fin: bool,
    /// The upstream application has half-closed toward us
    pub(crate) upstream_eof: bool,
    /// Upstream bytes waiting to be chopped into blocks
    pub(crate) send_buffer: BytesMut,
    /// Cooperative chaff/poll trigger
    pub(crate) flush_at: Option<Instant>,
    /// Last-resort teardown for an abandoned server circuit
    pub(crate) axe_at: Option<Instant>,
}

impl Circuit {
    /// Create a circuit and derive its directional keys from `passphrase`.
    ///
    /// Both sides expand the same keystream; the server takes its send pair
    /// first and the client its receive pair first, so the contexts line up
    /// across the wire.
    pub fn new(id: CircuitId, is_server: bool, passphrase: &[u8]) -> Self {
        let mut kgen = KeyGenerator::from_passphrase(passphrase, &[], &[]);

        let (send_crypt, send_hdr_crypt, recv_crypt, recv_hdr_crypt);
        if is_server {
            send_crypt = GcmEncryptor::from_generator(&mut kgen, KEY_LEN);
            send_hdr_crypt = EcbEncryptor::from_generator(&mut kgen, KEY_LEN);
            recv_crypt = GcmDecryptor::from_generator(&mut kgen, KEY_LEN);
            recv_hdr_crypt = EcbDecryptor::from_generator(&mut kgen, KEY_LEN);
        } else {
            recv_crypt = GcmDecryptor::from_generator(&mut kgen, KEY_LEN);
            recv_hdr_crypt = EcbDecryptor::from_generator(&mut kgen, KEY_LEN);
            send_crypt = GcmEncryptor::from_generator(&mut kgen, KEY_LEN);
            send_hdr_crypt = EcbEncryptor::from_generator(&mut kgen, KEY_LEN);
        }

        Self {
            id,
            send_crypt,
            send_hdr_crypt,
            recv_crypt,
            recv_hdr_crypt,
            recv_queue: ReassemblyQueue::new(),
            downstreams: HashSet::new(),
            send_seq: 0,
            dead_cycles: 0,
            sent_fin: false,
            received_fin: false,
            upstream_eof: false,
            send_buffer: BytesMut::new(),
            flush_at: None,
            axe_at: None,
        }
    }

    /// The circuit may destroy itself only when it is half-closed in both
    /// directions, the upstream is gone, and no downstream remains.
    pub fn at_eof(&self) -> bool {
        self.sent_fin && self.received_fin && self.upstream_eof && self.downstreams.is_empty()
    }

    /// Interval until the flush timer should fire.
    ///
    /// The expected delay grows roughly exponentially with the number of
    /// dead cycles (capped at ~10 minutes), drawn from a geometric
    /// distribution capped at 20 minutes. 10*60*1000 lies between 2^19 and
    /// 2^20, hence the shift cap of 19.
    pub fn flush_interval(&self) -> Duration {
        let shift = self.dead_cycles.clamp(1, 19);
        let xv = (1u64 << shift).clamp(1, 10 * 60 * 1000);
        Duration::from_millis(range_geom(20 * 60 * 1000, xv) + 100)
    }

    /// Interval until the axe timer should fire.
    pub fn axe_interval(&self) -> Duration {
        AXE_INTERVAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_interval_bounds() {
        let mut ckt = Circuit::new(1, false, b"test phrase");
        for cycles in [0u32, 1, 5, 19, 40, 1000] {
            ckt.dead_cycles = cycles;
            for _ in 0..50 {
                let iv = ckt.flush_interval();
                assert!(iv >= Duration::from_millis(100));
                assert!(iv < Duration::from_millis(20 * 60 * 1000 + 100));
            }
        }
    }

    #[test]
    fn test_flush_interval_grows_with_dead_cycles() {
        // With few dead cycles the expectation is ~2ms + 100; with many it
        // saturates near 10 minutes. Compare sample means far apart.
        let mut ckt = Circuit::new(1, false, b"test phrase");

        ckt.dead_cycles = 1;
        let low: u128 = (0..200)
            .map(|_| ckt.flush_interval().as_millis())
            .sum::<u128>()
            / 200;

        ckt.dead_cycles = 19;
        let high: u128 = (0..200)
            .map(|_| ckt.flush_interval().as_millis())
            .sum::<u128>()
            / 200;

        assert!(high > low * 10, "expected growth, got {low} -> {high}");
    }

    #[test]
    fn test_axe_exceeds_any_flush_interval() {
        let ckt = Circuit::new(1, true, b"test phrase");
        // The flush distribution is capped at 20 minutes + 100 ms.
        assert!(ckt.axe_interval() > Duration::from_millis(20 * 60 * 1000 + 100));
    }

    #[test]
    fn test_at_eof_requires_all_conditions() {
        let mut ckt = Circuit::new(1, false, b"test phrase");
        assert!(!ckt.at_eof());
        ckt.sent_fin = true;
        ckt.received_fin = true;
        assert!(!ckt.at_eof());
        ckt.upstream_eof = true;
        assert!(ckt.at_eof());
        ckt.downstreams.insert(3);
        assert!(!ckt.at_eof());
    }
}
