//! The chop engine: circuit table, server demux, send/receive paths, and
//! cooperative timers.
//!
//! The engine is a deterministic state machine with no I/O of its own. The
//! driver feeds it socket bytes, EOFs, and timer ticks; the engine hands
//! back an ordered queue of [`Event`]s to execute. All engine state is
//! meant to be owned by one task; block processing is re-entrancy-free by
//! construction, and nothing here is shared across threads.

use std::backtrace::Backtrace;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use zeroize::Zeroizing;

use crate::crypto::SecureRandom;
use crate::error::{Error, Result};
use crate::protocol::{
    decode_next, encode_block, Circuit, CircuitId, ConnId, Downstream, Opcode,
    HANDSHAKE_LEN, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, SECTION_LEN,
};
use crate::steg::{Steg, StegHints};

/// How long a retired circuit ID lingers in the table, swallowing late
/// connections for it (the TIME_WAIT analogue). Long enough for any
/// in-flight cover-protocol reply; purged afterwards to bound the table.
const TOMBSTONE_TTL: Duration = Duration::from_secs(10 * 60);

/// A circuit-table slot: live, or a tombstone awaiting purge.
enum CircuitSlot {
    Live(Box<Circuit>),
    Tombstone(Instant),
}

fn live(circuits: &HashMap<CircuitId, CircuitSlot>, id: CircuitId) -> Option<&Circuit> {
    match circuits.get(&id) {
        Some(CircuitSlot::Live(ck)) => Some(ck),
        _ => None,
    }
}

fn live_mut(
    circuits: &mut HashMap<CircuitId, CircuitSlot>,
    id: CircuitId,
) -> Option<&mut Circuit> {
    match circuits.get_mut(&id) {
        Some(CircuitSlot::Live(ck)) => Some(ck),
        _ => None,
    }
}

/// An action the driver must carry out, in queue order.
#[derive(Debug)]
pub enum Event {
    /// Wire bytes ready for a downstream socket
    DownstreamWrite {
        /// Connection to write to
        conn: ConnId,
        /// Cover-protocol bytes
        data: Bytes,
    },
    /// Close a downstream socket once prior writes have drained
    DownstreamClose {
        /// Connection to close
        conn: ConnId,
    },
    /// Reassembled bytes ready for the upstream application socket
    UpstreamWrite {
        /// Owning circuit
        circuit: CircuitId,
        /// In-order upstream payload
        data: Bytes,
    },
    /// Half-close the upstream socket's write side
    UpstreamEof {
        /// Owning circuit
        circuit: CircuitId,
    },
    /// Server side: dial the configured upstream target for this circuit
    OpenUpstream {
        /// Newly demultiplexed circuit
        circuit: CircuitId,
    },
    /// Client side: re-dial the configured cover connections
    ReopenDownstreams {
        /// Circuit that lost all its downstreams
        circuit: CircuitId,
    },
    /// The circuit is gone; release any upstream socket state
    CircuitDestroyed {
        /// Retired circuit
        circuit: CircuitId,
    },
}

enum HandshakeOutcome {
    Attached(CircuitId),
    NeedMore,
    Stale,
}

/// The multiplexing/demultiplexing core for one process.
pub struct ChopEngine {
    is_server: bool,
    passphrase: Zeroizing<Vec<u8>>,
    circuits: HashMap<CircuitId, CircuitSlot>,
    conns: HashMap<ConnId, Downstream>,
    next_conn_id: ConnId,
    events: VecDeque<Event>,
    shutting_down: bool,
}

impl ChopEngine {
    /// Create an engine for one side of the protocol.
    pub fn new(is_server: bool, passphrase: impl Into<Vec<u8>>) -> Self {
        Self {
            is_server,
            passphrase: Zeroizing::new(passphrase.into()),
            circuits: HashMap::new(),
            conns: HashMap::new(),
            next_conn_id: 1,
            events: VecDeque::new(),
            shutting_down: false,
        }
    }

    /// True if this is the server end.
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Drain the pending action queue.
    pub fn take_events(&mut self) -> VecDeque<Event> {
        std::mem::take(&mut self.events)
    }

    /// Number of live circuits.
    pub fn circuit_count(&self) -> usize {
        self.circuits
            .values()
            .filter(|s| matches!(s, CircuitSlot::Live(_)))
            .count()
    }

    /// Number of downstream connections.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// True once every circuit and connection has wound down.
    pub fn is_idle(&self) -> bool {
        self.conns.is_empty() && self.circuit_count() == 0
    }

    /// True if `id` names a live (non-tombstone) circuit.
    pub fn circuit_is_live(&self, id: CircuitId) -> bool {
        live(&self.circuits, id).is_some()
    }

    /// True if `id` names an open downstream connection.
    pub fn has_conn(&self, id: ConnId) -> bool {
        self.conns.contains_key(&id)
    }

    /// Client side: create a circuit with a fresh random nonzero ID.
    ///
    /// The ID is retried until it collides with nothing in the table,
    /// tombstones included, so a recycled ID cannot be confused with its
    /// predecessor's stragglers.
    pub fn create_circuit(&mut self) -> Result<CircuitId> {
        if self.shutting_down {
            return Err(Error::config("shutting down; not accepting new circuits"));
        }
        debug_assert!(!self.is_server, "server circuits come from the handshake");
        let id = loop {
            let id = SecureRandom::nonzero_u32();
            if !self.circuits.contains_key(&id) {
                break id;
            }
        };
        let ck = Circuit::new(id, false, &self.passphrase);
        self.circuits.insert(id, CircuitSlot::Live(Box::new(ck)));
        tracing::debug!(circuit = id, "created client circuit");
        Ok(id)
    }

    /// Register a downstream connection with its steg module, optionally
    /// attaching it to a circuit (client side; the server attaches at
    /// handshake time).
    pub fn create_connection(
        &mut self,
        steg: Box<dyn Steg>,
        circuit: Option<CircuitId>,
    ) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        // Server connections are born from accepted sockets; client ones
        // are created ahead of the dial and offer no room until it lands.
        self.conns
            .insert(id, Downstream::new(id, None, steg, self.is_server));
        if let Some(ck_id) = circuit {
            self.add_downstream(ck_id, id);
        }
        id
    }

    /// Connection established (first writable event).
    ///
    /// The handshake proper is generated inside the block send path so it
    /// can share a cover unit with real data; this hook only guarantees
    /// the client says *something* promptly, because the server cannot
    /// open its upstream, or forward anything, until it learns which
    /// circuit the connection belongs to.
    pub fn downstream_connected(&mut self, conn_id: ConnId, now: Instant) {
        let (needs_handshake, ck_id) = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return;
            };
            conn.connected = true;
            (!self.is_server && !conn.sent_handshake, conn.circuit)
        };
        if needs_handshake {
            self.conn_send(conn_id, now);
        }
        // A connection appearing may unblock upstream data queued while
        // every dial was still in flight.
        if let Some(ck_id) = ck_id {
            let backlog = live(&self.circuits, ck_id).is_some_and(|ck| {
                !ck.send_buffer.is_empty() || (ck.upstream_eof && !ck.sent_fin)
            });
            if backlog {
                self.circuit_send(ck_id, now);
            }
        }
    }

    /// Bytes arrived from a downstream socket.
    pub fn downstream_data(&mut self, conn_id: ConnId, data: &[u8], now: Instant) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        conn.inbound.extend_from_slice(data);
        self.conn_recv(conn_id, now);
    }

    /// A downstream socket half-closed from the peer side.
    ///
    /// Data may still be buffered (for a brand-new connection, even the
    /// handshake itself), so it is processed before the circuit is
    /// consulted. Anything the steg module leaves unconsumed at EOF is a
    /// protocol error.
    pub fn downstream_eof(&mut self, conn_id: ConnId, now: Instant) {
        let has_pending = self
            .conns
            .get(&conn_id)
            .is_some_and(|c| !c.inbound.is_empty());
        if has_pending {
            self.conn_recv(conn_id, now);
        }

        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        if !conn.inbound.is_empty() {
            tracing::info!(conn = conn_id, "EOF with unconsumed wire bytes");
            self.close_conn(conn_id, false, now);
            return;
        }

        // Keep the connection only while we may still transmit on it and
        // while the cover protocol owes nothing.
        let drop_now = match conn.circuit.and_then(|id| live(&self.circuits, id)) {
            Some(ck) => {
                (ck.sent_fin || conn.no_more_transmissions) && !conn.must_send_pending()
            }
            None => true,
        };
        if drop_now {
            self.close_conn(conn_id, true, now);
        }
    }

    /// A downstream socket failed; drop it without ceremony.
    pub fn downstream_error(&mut self, conn_id: ConnId, now: Instant) {
        tracing::debug!(conn = conn_id, "downstream error");
        self.close_conn(conn_id, false, now);
    }

    /// Bytes arrived from the upstream application.
    pub fn upstream_data(&mut self, ck_id: CircuitId, data: &[u8], now: Instant) {
        let Some(ck) = live_mut(&mut self.circuits, ck_id) else {
            return;
        };
        ck.send_buffer.extend_from_slice(data);
        self.circuit_send(ck_id, now);
    }

    /// The upstream application half-closed; the next block carries FIN.
    pub fn upstream_eof(&mut self, ck_id: CircuitId, now: Instant) {
        let Some(ck) = live_mut(&mut self.circuits, ck_id) else {
            return;
        };
        ck.upstream_eof = true;
        self.circuit_send(ck_id, now);
    }

    /// The upstream socket is gone entirely (error or full close).
    pub fn upstream_closed(&mut self, ck_id: CircuitId, now: Instant) {
        if self.circuit_is_live(ck_id) {
            tracing::debug!(circuit = ck_id, "upstream closed; destroying circuit");
            self.destroy_circuit(ck_id, now);
        }
    }

    /// The earliest pending flush/axe/must-send/tombstone deadline.
    pub fn next_timer(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |t: Option<Instant>| {
            if let Some(t) = t {
                next = Some(next.map_or(t, |n| n.min(t)));
            }
        };
        for slot in self.circuits.values() {
            match slot {
                CircuitSlot::Live(ck) => {
                    consider(ck.flush_at);
                    consider(ck.axe_at);
                }
                CircuitSlot::Tombstone(t) => consider(Some(*t)),
            }
        }
        for conn in self.conns.values() {
            consider(conn.must_send_at);
        }
        next
    }

    /// Fire every timer whose deadline has passed.
    pub fn on_timer(&mut self, now: Instant) {
        let due_sends: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.must_send_at.is_some_and(|t| t <= now))
            .map(|(&id, _)| id)
            .collect();
        for conn_id in due_sends {
            self.conn_send(conn_id, now);
        }

        let mut due_flush = Vec::new();
        let mut due_axe = Vec::new();
        let mut dead_stones = Vec::new();
        for (&id, slot) in &self.circuits {
            match slot {
                CircuitSlot::Live(ck) => {
                    if ck.flush_at.is_some_and(|t| t <= now) {
                        due_flush.push(id);
                    } else if ck.axe_at.is_some_and(|t| t <= now) {
                        due_axe.push(id);
                    }
                }
                CircuitSlot::Tombstone(t) if *t <= now => dead_stones.push(id),
                CircuitSlot::Tombstone(_) => {}
            }
        }
        for id in due_flush {
            self.circuit_send(id, now);
        }
        for id in due_axe {
            tracing::warn!(circuit = id, "axe timer expired; destroying idle circuit");
            self.destroy_circuit(id, now);
        }
        for id in dead_stones {
            self.circuits.remove(&id);
        }
    }

    /// Stop accepting circuits; in barbaric mode also tear down every
    /// circuit and connection immediately.
    pub fn start_shutdown(&mut self, barbaric: bool, now: Instant) {
        self.shutting_down = true;
        if !barbaric {
            return;
        }
        let live_ids: Vec<CircuitId> = self
            .circuits
            .iter()
            .filter(|(_, s)| matches!(s, CircuitSlot::Live(_)))
            .map(|(&id, _)| id)
            .collect();
        for id in live_ids {
            self.destroy_circuit(id, now);
        }
        let conn_ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in conn_ids {
            self.close_conn(id, false, now);
        }
        self.circuits.clear();
    }

    // --- send path ---------------------------------------------------------

    /// Chop as much of the circuit's pending upstream data as its
    /// connections can carry. At least one block goes out per invocation
    /// when any connection has room, so chaff flows even with nothing to
    /// say.
    fn circuit_send(&mut self, ck_id: CircuitId, now: Instant) {
        {
            let Some(ck) = live_mut(&mut self.circuits, ck_id) else {
                return;
            };
            ck.flush_at = None;
            if ck.downstreams.is_empty() {
                // No connections, but we must send. The client reopens its
                // cover connections; the server can only wait for the
                // client to reconnect, under the axe.
                tracing::debug!(circuit = ck_id, "no downstream connections");
                if self.is_server {
                    ck.axe_at = Some(now + ck.axe_interval());
                } else {
                    self.events
                        .push_back(Event::ReopenDownstreams { circuit: ck_id });
                }
                return;
            }
        }

        let avail0 = match live(&self.circuits, ck_id) {
            Some(ck) => ck.send_buffer.len(),
            None => return,
        };

        loop {
            let (target, blocksize) = {
                let Some(ck) = live(&self.circuits, ck_id) else {
                    return;
                };
                tracing::debug!(
                    circuit = ck_id,
                    avail = ck.send_buffer.len(),
                    "bytes to send"
                );
                self.pick_connection(ck, ck.send_buffer.len())
            };
            let Some(conn_id) = target else {
                // Not an error: e.g. the server has something to say but
                // the client's cover protocol has not spoken yet.
                tracing::debug!(circuit = ck_id, "no target connection available");
                break;
            };
            if self.send_targeted(ck_id, conn_id, blocksize, now).is_err() {
                self.destroy_circuit(ck_id, now);
                return;
            }
            let remaining = match live(&self.circuits, ck_id) {
                Some(ck) => ck.send_buffer.len(),
                None => return,
            };
            if remaining == 0 {
                break;
            }
        }

        {
            let Some(ck) = live_mut(&mut self.circuits, ck_id) else {
                return;
            };
            if ck.send_buffer.len() < avail0 {
                ck.dead_cycles = 0;
            } else {
                ck.dead_cycles += 1;
                tracing::debug!(circuit = ck_id, dead_cycles = ck.dead_cycles, "dead cycle");
            }
        }
        self.check_for_eof(ck_id, now);
    }

    /// Scan the circuit's connections for the best fit for a data section
    /// of `desired` bytes. Returns the connection whose room is the
    /// smallest at or above the desired block size if any, else the one
    /// with the most room below it, together with the block size to build.
    fn pick_connection(&self, ck: &Circuit, desired: usize) -> (Option<ConnId>, usize) {
        let desired = desired.min(SECTION_LEN) + MIN_BLOCK_SIZE;
        let mut maxbelow = 0usize;
        let mut minabove = MAX_BLOCK_SIZE + 1;
        let mut targbelow = None;
        let mut targabove = None;

        tracing::debug!(circuit = ck.id, desired, "target block size");
        for &conn_id in &ck.downstreams {
            let Some(conn) = self.conns.get(&conn_id) else {
                continue;
            };
            let room = conn.transmit_room(desired);
            tracing::debug!(conn = conn_id, room, steg = conn.steg.name(), "offers room");
            if room == 0 {
                continue;
            }
            if room >= desired {
                if room < minabove {
                    minabove = room;
                    targabove = Some(conn_id);
                }
            } else if room > maxbelow {
                maxbelow = room;
                targbelow = Some(conn_id);
            }
        }

        if targabove.is_some() {
            (targabove, desired)
        } else {
            (targbelow, maxbelow)
        }
    }

    /// One block through `conn_id`, sized by the connection's own room.
    fn send_targeted_auto(
        &mut self,
        ck_id: CircuitId,
        conn_id: ConnId,
        now: Instant,
    ) -> Result<()> {
        let blocksize = {
            let Some(ck) = live(&self.circuits, ck_id) else {
                return Err(Error::protocol("send on dead circuit"));
            };
            let Some(conn) = self.conns.get(&conn_id) else {
                return Err(Error::protocol("send on closed connection"));
            };
            let want = ck.send_buffer.len().min(SECTION_LEN) + MIN_BLOCK_SIZE;
            let room = conn.transmit_room(want);
            if room == 0 {
                tracing::warn!(
                    conn = conn_id,
                    need = MIN_BLOCK_SIZE,
                    "send without enough transmit room"
                );
                return Err(Error::NoUsableConnection {
                    needed: MIN_BLOCK_SIZE,
                });
            }
            want.min(room)
        };
        self.send_targeted(ck_id, conn_id, blocksize, now)
    }

    /// One block of exactly `blocksize` wire bytes through `conn_id`:
    /// as much pending data as fits, zero padding for the rest, FIN iff
    /// this carries the last of it after upstream EOF.
    fn send_targeted(
        &mut self,
        ck_id: CircuitId,
        conn_id: ConnId,
        blocksize: usize,
        now: Instant,
    ) -> Result<()> {
        debug_assert!((MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&blocksize));
        let (d, p, op) = {
            let Some(ck) = live(&self.circuits, ck_id) else {
                return Err(Error::protocol("send on dead circuit"));
            };
            let avail = ck.send_buffer.len();
            let d = avail.min(SECTION_LEN).min(blocksize - MIN_BLOCK_SIZE);
            let op = if ck.upstream_eof && !ck.sent_fin && d == avail {
                // This block carries the last byte of real data to be sent
                // in this direction; mark it as such.
                Opcode::Fin
            } else {
                Opcode::Dat
            };
            (d, blocksize - MIN_BLOCK_SIZE - d, op)
        };
        self.send_block_on(ck_id, conn_id, d, p, op, now)
    }

    /// Used for RST (and reserved for rekeying): a block with explicit
    /// opcode on whichever connection has room for it.
    fn send_special(&mut self, ck_id: CircuitId, op: Opcode, now: Instant) -> Result<()> {
        let (target, blocksize) = {
            let Some(ck) = live(&self.circuits, ck_id) else {
                return Err(Error::protocol("send on dead circuit"));
            };
            self.pick_connection(ck, 0)
        };
        let Some(conn_id) = target else {
            tracing::warn!(
                circuit = ck_id,
                opcode = op.wire(),
                "no usable connection for special block"
            );
            return Err(Error::NoUsableConnection {
                needed: MIN_BLOCK_SIZE,
            });
        };
        self.send_block_on(ck_id, conn_id, 0, blocksize - MIN_BLOCK_SIZE, op, now)
    }

    /// Encode and transmit one block; on success consume the data from the
    /// circuit's send buffer and advance the sequence number.
    fn send_block_on(
        &mut self,
        ck_id: CircuitId,
        conn_id: ConnId,
        d: usize,
        p: usize,
        op: Opcode,
        now: Instant,
    ) -> Result<()> {
        let is_server = self.is_server;
        let (res, hints) = {
            let Some(ck) = live_mut(&mut self.circuits, ck_id) else {
                return Err(Error::protocol("send on dead circuit"));
            };
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return Err(Error::protocol("send on closed connection"));
            };
            if ck.send_seq == u32::MAX {
                // Rekeying would reset the sequence space; without it the
                // circuit has to die before the counter can wrap.
                return Err(Error::protocol("sequence number space exhausted"));
            }
            let block = encode_block(
                ck.send_seq,
                op,
                &ck.send_buffer[..d],
                p,
                &ck.send_hdr_crypt,
                &ck.send_crypt,
            )?;
            tracing::debug!(
                conn = conn_id,
                seqno = ck.send_seq,
                d,
                p,
                opcode = op.wire(),
                "transmitting block"
            );
            let (res, hints) = conn.send_block(is_server, &block);
            if res.is_ok() {
                ck.send_buffer.advance(d);
                ck.send_seq += 1;
                if op == Opcode::Fin {
                    ck.sent_fin = true;
                }
            }
            (res, hints)
        };
        self.flush_conn_outbound(conn_id);
        self.apply_hints(conn_id, hints, now);
        res
    }

    /// The per-connection send hook: fired by the must-send timer, the
    /// client handshake, and EOF courtesies. With a live circuit it sends
    /// a real (possibly empty) block; without one it can only emit raw
    /// chaff to keep the cover protocol in countenance.
    fn conn_send(&mut self, conn_id: ConnId, now: Instant) {
        let ck_id = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return;
            };
            conn.must_send_at = None;
            conn.circuit
                .filter(|&id| live(&self.circuits, id).is_some())
        };
        match ck_id {
            Some(ck_id) => {
                tracing::debug!(conn = conn_id, "must send");
                if self.send_targeted_auto(ck_id, conn_id, now).is_err() {
                    self.close_conn(conn_id, true, now);
                }
            }
            None => {
                tracing::debug!(conn = conn_id, "must send (no circuit)");
                self.conn_send_chaff(conn_id, now);
            }
        }
    }

    /// With no circuit there are no keys, so nothing can be encrypted;
    /// random bytes fed straight to the steg module satisfy the cover
    /// protocol and fail the peer's header check like any other noise.
    fn conn_send_chaff(&mut self, conn_id: ConnId, now: Instant) {
        let (res, hints) = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return;
            };
            if conn.transmit_room(MIN_BLOCK_SIZE) == 0 {
                tracing::warn!(conn = conn_id, "chaff wanted but no transmit room");
                (
                    Err(Error::NoUsableConnection {
                        needed: MIN_BLOCK_SIZE,
                    }),
                    StegHints::default(),
                )
            } else {
                let mut chaff = [0u8; MIN_BLOCK_SIZE];
                SecureRandom::fill(&mut chaff);
                conn.steg_transmit(&chaff)
            }
        };
        self.flush_conn_outbound(conn_id);
        match res {
            Ok(()) => self.apply_hints(conn_id, hints, now),
            Err(_) => self.close_conn(conn_id, true, now),
        }
    }

    // --- receive path ------------------------------------------------------

    /// Drive the receive side of one connection: steg extraction, the
    /// handshake if still unattached, the block decode loop, and a full
    /// drain of the reassembly queue.
    fn conn_recv(&mut self, conn_id: ConnId, now: Instant) {
        let (res, hints) = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return;
            };
            conn.steg_receive()
        };
        if let Err(e) = res {
            tracing::warn!(conn = conn_id, error = %e, "steg receive failed");
            self.close_conn(conn_id, true, now);
            return;
        }
        self.flush_conn_outbound(conn_id);
        self.apply_hints(conn_id, hints, now);

        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        let attached = conn
            .circuit
            .filter(|&id| live(&self.circuits, id).is_some());
        let awaiting_handshake = self.is_server && conn.circuit.is_none();
        let ck_id = match attached {
            Some(id) => id,
            None if awaiting_handshake => {
                match self.recv_handshake(conn_id, now) {
                    HandshakeOutcome::Attached(id) => id,
                    HandshakeOutcome::NeedMore => return,
                    HandshakeOutcome::Stale => {
                        self.drain_stale(conn_id, now);
                        return;
                    }
                }
            }
            None => {
                // A connection for a circuit we have already torn down:
                // a client reconnect crossed with the FIN exchange. We no
                // longer hold keys for anything past the handshake, so
                // it is chaff or a protocol error either way.
                self.drain_stale(conn_id, now);
                return;
            }
        };

        loop {
            let decoded = {
                let Some(ck) = live_mut(&mut self.circuits, ck_id) else {
                    return;
                };
                let Some(conn) = self.conns.get_mut(&conn_id) else {
                    return;
                };
                decode_next(
                    &mut conn.recv_pending,
                    ck.recv_queue.window(),
                    &ck.recv_hdr_crypt,
                    &ck.recv_crypt,
                )
            };
            match decoded {
                Ok(None) => break,
                Ok(Some(blk)) => {
                    tracing::debug!(
                        conn = conn_id,
                        seqno = blk.seqno,
                        len = blk.data.len(),
                        opcode = blk.op.wire(),
                        "receiving block"
                    );
                    let inserted = {
                        let Some(ck) = live_mut(&mut self.circuits, ck_id) else {
                            return;
                        };
                        ck.recv_queue.insert(blk.seqno, blk.op, blk.data)
                    };
                    if !inserted {
                        // Duplicate (or raced out of the window): a block
                        // protocol error. Drain what is already in order,
                        // answer with RST, and take the circuit down.
                        self.process_queue(ck_id, now);
                        if self.circuit_is_live(ck_id) {
                            let _ = self.send_special(ck_id, Opcode::Rst, now);
                            self.destroy_circuit(ck_id, now);
                        }
                        return;
                    }
                }
                Err(e) => {
                    // Forged/stale header or failed tag: this connection is
                    // condemned, the circuit keeps its other connections.
                    tracing::info!(conn = conn_id, error = %e, "dropping connection");
                    self.close_conn(conn_id, false, now);
                    return;
                }
            }
        }

        self.process_queue(ck_id, now);
    }

    /// Read the 4-byte circuit-ID prefix off a new server-side connection
    /// and attach it to the right circuit, creating one on first sight.
    fn recv_handshake(&mut self, conn_id: ConnId, now: Instant) -> HandshakeOutcome {
        debug_assert!(self.is_server);
        let id = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return HandshakeOutcome::Stale;
            };
            if conn.recv_pending.len() < HANDSHAKE_LEN {
                return HandshakeOutcome::NeedMore;
            }
            let raw: [u8; HANDSHAKE_LEN] = conn.recv_pending.split_to(HANDSHAKE_LEN)[..]
                .try_into()
                .expect("exactly HANDSHAKE_LEN bytes");
            u32::from_ne_bytes(raw)
        };

        if live(&self.circuits, id).is_some() {
            tracing::debug!(conn = conn_id, circuit = id, "found circuit");
            self.add_downstream(id, conn_id);
            return HandshakeOutcome::Attached(id);
        }
        if self.circuits.contains_key(&id) {
            tracing::debug!(conn = conn_id, circuit = id, "stale circuit");
            return HandshakeOutcome::Stale;
        }
        if id == 0 || self.shutting_down {
            tracing::debug!(conn = conn_id, circuit = id, "refusing new circuit");
            return HandshakeOutcome::Stale;
        }

        let ck = Circuit::new(id, true, &self.passphrase);
        self.circuits.insert(id, CircuitSlot::Live(Box::new(ck)));
        tracing::debug!(conn = conn_id, circuit = id, "created new circuit");
        self.events.push_back(Event::OpenUpstream { circuit: id });
        self.add_downstream(id, conn_id);
        HandshakeOutcome::Attached(id)
    }

    /// Dispose of a connection whose circuit is gone or never existed:
    /// drain its bytes, pay any cover-protocol reply it owes, close it.
    fn drain_stale(&mut self, conn_id: ConnId, now: Instant) {
        let owes_reply = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return;
            };
            tracing::debug!(conn = conn_id, "connection for stale circuit");
            conn.recv_pending.clear();
            conn.must_send_pending()
        };
        if owes_reply {
            self.conn_send(conn_id, now);
        }
        self.close_conn(conn_id, true, now);
    }

    /// Drain the reassembly queue in order, dispatching by opcode, then
    /// follow up with whatever sending or closing became possible.
    fn process_queue(&mut self, ck_id: CircuitId, now: Instant) {
        let mut count = 0u32;
        let mut sent_error = false;
        let mut teardown = false;
        let mut drop_data = false;

        loop {
            let mut pending_error = false;
            let op = {
                let Some(ck) = live_mut(&mut self.circuits, ck_id) else {
                    return;
                };
                let Some(blk) = ck.recv_queue.remove_next() else {
                    break;
                };
                let op = blk.op;
                match op {
                    Opcode::Fin | Opcode::Dat => {
                        if op == Opcode::Fin {
                            if ck.received_fin {
                                tracing::info!(circuit = ck_id, "protocol error: duplicate FIN");
                                pending_error = true;
                            } else {
                                tracing::debug!(circuit = ck_id, "received FIN");
                            }
                        }
                        if !blk.data.is_empty() {
                            if ck.received_fin {
                                tracing::info!(circuit = ck_id, "protocol error: data after FIN");
                                pending_error = true;
                            } else if drop_data {
                                // Nothing after an RST reaches the upstream.
                            } else {
                                self.events.push_back(Event::UpstreamWrite {
                                    circuit: ck_id,
                                    data: blk.data,
                                });
                            }
                        }
                        if op == Opcode::Fin && !pending_error && !ck.received_fin {
                            ck.received_fin = true;
                            self.events.push_back(Event::UpstreamEof { circuit: ck_id });
                        }
                    }
                    Opcode::Rst => {
                        tracing::info!(circuit = ck_id, "received RST; disconnecting circuit");
                        self.events.push_back(Event::UpstreamEof { circuit: ck_id });
                        drop_data = true;
                        pending_error = true;
                    }
                    Opcode::Rk1 | Opcode::Rk2 | Opcode::Rk3 => {
                        tracing::warn!(circuit = ck_id, "rekeying not yet implemented");
                        pending_error = true;
                    }
                    Opcode::Steg(v) | Opcode::Reserved(v) => {
                        tracing::warn!(
                            circuit = ck_id,
                            opcode = v,
                            "protocol error: unknown block opcode"
                        );
                        pending_error = true;
                    }
                }
                op
            };

            if pending_error {
                teardown = true;
                if !sent_error {
                    // There is no point answering an RST or a duplicate FIN
                    // with an RST of our own.
                    if !matches!(op, Opcode::Rst | Opcode::Fin) {
                        let _ = self.send_special(ck_id, Opcode::Rst, now);
                    }
                    sent_error = true;
                }
            }
            count += 1;
        }

        tracing::debug!(circuit = ck_id, count, "processed blocks");
        if count > 0 {
            if let Some(ck) = live_mut(&mut self.circuits, ck_id) {
                ck.dead_cycles = 0;
            }
        }
        if teardown {
            self.destroy_circuit(ck_id, now);
            return;
        }

        // It may have become possible to send queued data or a FIN.
        let wants_send = match live(&self.circuits, ck_id) {
            Some(ck) => !ck.send_buffer.is_empty() || (ck.upstream_eof && !ck.sent_fin),
            None => return,
        };
        if wants_send {
            self.circuit_send(ck_id, now);
        } else {
            self.check_for_eof(ck_id, now);
        }
    }

    /// At EOF both ways, pay each connection's cover-protocol debts and
    /// close them all; otherwise a client keeps its flush timer running so
    /// the conversation cannot deadlock.
    fn check_for_eof(&mut self, ck_id: CircuitId, now: Instant) {
        let at_eof = {
            let Some(ck) = live_mut(&mut self.circuits, ck_id) else {
                return;
            };
            if ck.sent_fin && ck.received_fin {
                ck.flush_at = None;
                true
            } else {
                if !self.is_server {
                    ck.flush_at = Some(now + ck.flush_interval());
                }
                false
            }
        };
        if !at_eof {
            return;
        }

        let conn_ids: Vec<ConnId> = match live(&self.circuits, ck_id) {
            Some(ck) => ck.downstreams.iter().copied().collect(),
            None => return,
        };
        for conn_id in conn_ids {
            if self
                .conns
                .get(&conn_id)
                .is_some_and(|c| c.must_send_pending())
            {
                self.conn_send(conn_id, now);
            }
            self.close_conn(conn_id, true, now);
        }
    }

    // --- attach/detach and teardown ---------------------------------------

    fn add_downstream(&mut self, ck_id: CircuitId, conn_id: ConnId) {
        let Some(ck) = live_mut(&mut self.circuits, ck_id) else {
            return;
        };
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        conn.circuit = Some(ck_id);
        ck.downstreams.insert(conn_id);
        tracing::debug!(
            circuit = ck_id,
            conn = conn_id,
            total = ck.downstreams.len(),
            "added connection"
        );
        ck.axe_at = None;
    }

    fn drop_downstream(&mut self, ck_id: CircuitId, conn_id: ConnId, now: Instant) {
        let destroy = {
            let Some(ck) = live_mut(&mut self.circuits, ck_id) else {
                return;
            };
            ck.downstreams.remove(&conn_id);
            tracing::debug!(
                circuit = ck_id,
                conn = conn_id,
                remaining = ck.downstreams.len(),
                "dropped connection"
            );
            if !ck.downstreams.is_empty() {
                return;
            }
            // Last connection gone. Fully half-closed both ways means the
            // circuit is finished; otherwise the server arms the axe in
            // case the client never comes back, and the client arms the
            // flush timer so further transmissions from the server stay
            // possible.
            if ck.sent_fin && ck.received_fin {
                true
            } else if self.is_server {
                ck.axe_at = Some(now + ck.axe_interval());
                false
            } else {
                ck.flush_at = Some(now + ck.flush_interval());
                false
            }
        };
        if destroy {
            self.destroy_circuit(ck_id, now);
        }
    }

    /// Remove a connection, optionally flushing its outbound bytes first,
    /// and detach it from its circuit.
    fn close_conn(&mut self, conn_id: ConnId, flush: bool, now: Instant) {
        let Some(mut conn) = self.conns.remove(&conn_id) else {
            return;
        };
        if flush && !conn.outbound.is_empty() {
            self.events.push_back(Event::DownstreamWrite {
                conn: conn_id,
                data: conn.outbound.split().freeze(),
            });
        }
        self.events.push_back(Event::DownstreamClose { conn: conn_id });
        if let Some(ck_id) = conn.circuit {
            self.drop_downstream(ck_id, conn_id, now);
        }
    }

    /// Retire a circuit to a tombstone, flushing and closing any
    /// connections it still holds.
    ///
    /// Destruction before both half-closes and upstream EOF is a bug
    /// somewhere (or a deliberate teardown after a protocol error), so it
    /// is logged loudly with a backtrace.
    fn destroy_circuit(&mut self, ck_id: CircuitId, now: Instant) {
        let Some(slot) = self.circuits.get_mut(&ck_id) else {
            return;
        };
        if !matches!(slot, CircuitSlot::Live(_)) {
            return;
        }
        let CircuitSlot::Live(ck) =
            std::mem::replace(slot, CircuitSlot::Tombstone(now + TOMBSTONE_TTL))
        else {
            unreachable!();
        };

        if !(ck.sent_fin && ck.received_fin && ck.upstream_eof) {
            tracing::warn!(
                circuit = ck_id,
                sent_fin = ck.sent_fin,
                received_fin = ck.received_fin,
                upstream_eof = ck.upstream_eof,
                downstreams = ck.downstreams.len(),
                backtrace = %Backtrace::force_capture(),
                "destroying active circuit"
            );
        }

        // Surviving connections outlive detachment only to flush and close.
        for conn_id in ck.downstreams.iter().copied() {
            if let Some(mut conn) = self.conns.remove(&conn_id) {
                conn.circuit = None;
                if !conn.outbound.is_empty() {
                    self.events.push_back(Event::DownstreamWrite {
                        conn: conn_id,
                        data: conn.outbound.split().freeze(),
                    });
                }
                self.events.push_back(Event::DownstreamClose { conn: conn_id });
            }
        }

        self.events
            .push_back(Event::CircuitDestroyed { circuit: ck_id });
    }

    // --- small helpers -----------------------------------------------------

    /// Move any cover bytes the steg module produced into the event queue.
    fn flush_conn_outbound(&mut self, conn_id: ConnId) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if !conn.outbound.is_empty() {
            let data = conn.outbound.split().freeze();
            self.events
                .push_back(Event::DownstreamWrite { conn: conn.id, data });
        }
    }

    /// Apply lifecycle requests a steg module raised during a call.
    fn apply_hints(&mut self, conn_id: ConnId, hints: StegHints, now: Instant) {
        if let Some(ms) = hints.transmit_soon_ms {
            if let Some(conn) = self.conns.get_mut(&conn_id) {
                tracing::debug!(conn = conn_id, ms, "must send within deadline");
                conn.must_send_at = Some(now + Duration::from_millis(ms));
            }
        }
        if hints.cease_transmission {
            if let Some(conn) = self.conns.get_mut(&conn_id) {
                conn.no_more_transmissions = true;
                conn.must_send_at = None;
            }
            self.close_conn(conn_id, true, now);
        }
        // expect_close requires no engine action today.
    }
}
